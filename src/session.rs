//! Per-device connection session.
//!
//! A [`DeviceSession`] owns the lifecycle of one peripheral connection:
//! Disconnected → Connecting → Connected → Discovering → Ready, with
//! Disconnecting and Failed off to the side. Commands are validated against
//! the state and the discovery snapshot before any radio call goes out, and
//! every transition is published on the session event channel.
//!
//! Command serialization is per device: one read/write/subscribe command may
//! be in flight at a time, and a second one fails fast instead of queueing.
//! The notification dispatch path does not go through the command slot, so
//! pushed values keep flowing during a slow read.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::gatt::{DiscoverySnapshot, Service};
use crate::radio::RadioLink;
use crate::router::{NotificationRouter, SubscriptionKey, ValueListener};

/// The step an establish attempt failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePhase {
    /// The radio-level connect was refused or timed out.
    Connect,
    /// The connection came up but service discovery failed.
    Discovery,
}

impl fmt::Display for FailurePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Discovery => write!(f, "discovery"),
        }
    }
}

/// Lifecycle state of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// No connection. The only state a fresh establish may start from,
    /// besides [`SessionState::Failed`].
    #[default]
    Disconnected,
    /// Radio connect issued, completion pending.
    Connecting,
    /// Connected, services not yet discovered.
    Connected,
    /// Service discovery in flight.
    Discovering,
    /// Connected with a discovery snapshot; commands are accepted.
    Ready,
    /// Teardown in progress.
    Disconnecting,
    /// An establish attempt failed; reset by a fresh connect.
    Failed(FailurePhase),
}

impl SessionState {
    /// Whether a connection is established (services discovered or not).
    pub fn is_established(&self) -> bool {
        matches!(self, Self::Connected | Self::Ready)
    }

    /// Whether the session accepts characteristic commands.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Whether the session is between stable states.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Discovering | Self::Disconnecting)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Discovering => write!(f, "Discovering"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Failed(phase) => write!(f, "Failed({phase})"),
        }
    }
}

/// Event published on every session state transition.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    /// The device whose session changed.
    pub device_id: String,
    /// The state the session moved to.
    pub state: SessionState,
}

/// State guarded by one lock so the snapshot can never outlive the state
/// that justifies it.
struct SessionInner {
    state: SessionState,
    snapshot: DiscoverySnapshot,
}

/// Releases the per-device command slot when the operation settles.
struct CommandSlot<'a> {
    busy: &'a AtomicBool,
}

impl Drop for CommandSlot<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// Connection session for a single peripheral.
pub struct DeviceSession {
    /// Platform identifier of the peripheral.
    device_id: String,
    /// Radio transport.
    radio: Arc<dyn RadioLink>,
    /// Shared notification router.
    router: Arc<NotificationRouter>,
    /// Lifecycle state and discovery snapshot.
    inner: RwLock<SessionInner>,
    /// Per-device command slot; held while a command is in flight.
    busy: AtomicBool,
    /// Channel for state transitions.
    event_tx: broadcast::Sender<SessionEvent>,
}

impl DeviceSession {
    /// Creates a session in the Disconnected state.
    pub(crate) fn new(
        device_id: impl Into<String>,
        radio: Arc<dyn RadioLink>,
        router: Arc<NotificationRouter>,
        event_tx: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            radio,
            router,
            inner: RwLock::new(SessionInner {
                state: SessionState::Disconnected,
                snapshot: DiscoverySnapshot::default(),
            }),
            busy: AtomicBool::new(false),
            event_tx,
        }
    }

    /// The device this session belongs to.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.read().state
    }

    /// The discovered services.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotReady`] until discovery has completed.
    pub fn services(&self) -> Result<Vec<Service>> {
        let inner = self.inner.read();
        if !inner.state.is_ready() {
            return Err(Error::NotReady { state: inner.state });
        }
        Ok(inner.snapshot.services().to_vec())
    }

    /// Triples with an active notification subscription on this device.
    pub fn active_subscriptions(&self) -> Vec<SubscriptionKey> {
        self.router.keys_for_device(&self.device_id)
    }

    /// Drives the session to Ready: connect, then discover services.
    ///
    /// Valid from Disconnected or Failed. A connect failure leaves the
    /// session `Failed(Connect)`, a discovery failure `Failed(Discovery)`;
    /// both are reset by calling this again. If the peripheral drops the
    /// link while a step is in flight, that step's result is abandoned and
    /// the call returns [`Error::ConnectionLost`].
    pub(crate) async fn establish(&self) -> Result<()> {
        let from = {
            let mut inner = self.inner.write();
            match inner.state {
                SessionState::Disconnected | SessionState::Failed(_) => {
                    let from = inner.state;
                    inner.state = SessionState::Connecting;
                    from
                }
                SessionState::Connected | SessionState::Ready => {
                    return Err(Error::AlreadyConnected {
                        device_id: self.device_id.clone(),
                    });
                }
                SessionState::Connecting
                | SessionState::Discovering
                | SessionState::Disconnecting => {
                    return Err(Error::OperationInProgress {
                        device_id: self.device_id.clone(),
                    });
                }
            }
        };
        self.announce(from, SessionState::Connecting);
        info!("Connecting to {}", self.device_id);

        if let Err(e) = self.radio.connect(&self.device_id).await {
            warn!("Connect to {} failed: {}", self.device_id, e);
            self.transition(
                SessionState::Connecting,
                SessionState::Failed(FailurePhase::Connect),
            );
            return Err(Error::ConnectionFailed {
                reason: e.to_string(),
            });
        }

        if !self.transition(SessionState::Connecting, SessionState::Connected) {
            // A spontaneous disconnect won the race; abandon the result.
            return Err(Error::ConnectionLost);
        }
        info!("Connected to {}", self.device_id);

        self.discover_services().await
    }

    /// Discovers services on the connected peripheral and stores the
    /// snapshot. Entered from Connected only.
    async fn discover_services(&self) -> Result<()> {
        if !self.transition(SessionState::Connected, SessionState::Discovering) {
            return Err(Error::ConnectionLost);
        }

        match self.radio.retrieve_services(&self.device_id).await {
            Ok(services) => {
                let count = services.len();
                let committed = {
                    let mut inner = self.inner.write();
                    if inner.state == SessionState::Discovering {
                        inner.snapshot = DiscoverySnapshot::new(services);
                        inner.state = SessionState::Ready;
                        true
                    } else {
                        false
                    }
                };
                if !committed {
                    return Err(Error::ConnectionLost);
                }
                self.announce(SessionState::Discovering, SessionState::Ready);
                info!("Discovered {} services on {}", count, self.device_id);
                Ok(())
            }
            Err(e) => {
                warn!("Service discovery on {} failed: {}", self.device_id, e);
                self.transition(
                    SessionState::Discovering,
                    SessionState::Failed(FailurePhase::Discovery),
                );
                Err(Error::DiscoveryFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Reads a characteristic and decodes the value as UTF-8 text.
    pub async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<String> {
        let _slot = self.begin_command()?;
        self.validate_triple(service, characteristic)?;

        let payload = self.radio.read(&self.device_id, service, characteristic).await?;
        trace!("Read {} bytes from {}", payload.len(), characteristic);
        String::from_utf8(payload).map_err(|_| Error::DecodeError {
            context: format!("read from characteristic {characteristic}"),
        })
    }

    /// Writes UTF-8 text to a characteristic.
    ///
    /// With `with_response` false the fire-and-forget write primitive is
    /// used and completion means the bytes were handed to the radio.
    pub async fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        text: &str,
        with_response: bool,
    ) -> Result<()> {
        let _slot = self.begin_command()?;
        self.validate_triple(service, characteristic)?;

        self.radio
            .write(
                &self.device_id,
                service,
                characteristic,
                text.as_bytes(),
                with_response,
            )
            .await?;
        trace!("Wrote {} bytes to {}", text.len(), characteristic);
        Ok(())
    }

    /// Registers a listener for value updates from a characteristic.
    ///
    /// Any number of listeners may be registered per characteristic; the
    /// radio-level notification is enabled once, with the first. If that
    /// enable fails the registration is rolled back, so a subscription
    /// exists exactly when the radio is notifying.
    pub async fn start_notifications(
        &self,
        service: Uuid,
        characteristic: Uuid,
        listener: ValueListener,
    ) -> Result<()> {
        let _slot = self.begin_command()?;
        self.validate_triple(service, characteristic)?;

        let key = SubscriptionKey::new(self.device_id.clone(), service, characteristic);
        let first = self.router.subscribe(key.clone(), listener);
        if first {
            if let Err(e) = self
                .radio
                .start_notify(&self.device_id, service, characteristic)
                .await
            {
                self.router.unsubscribe(&key);
                return Err(e);
            }
            debug!("Notifications enabled for {}", key);
        }
        Ok(())
    }

    /// Disables notifications for a characteristic and drops every listener
    /// registered for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSubscribed`] when notifications were never
    /// started for this characteristic.
    pub async fn stop_notifications(&self, service: Uuid, characteristic: Uuid) -> Result<()> {
        let _slot = self.begin_command()?;
        self.validate_triple(service, characteristic)?;

        let key = SubscriptionKey::new(self.device_id.clone(), service, characteristic);
        if !self.router.is_active(&key) {
            return Err(Error::NotSubscribed { characteristic });
        }

        self.radio
            .stop_notify(&self.device_id, service, characteristic)
            .await?;
        self.router.unsubscribe(&key);
        debug!("Notifications disabled for {}", key);
        Ok(())
    }

    /// Tears the connection down.
    ///
    /// Safe to call from any state. Every active subscription is stopped
    /// best-effort, the radio disconnect is issued, and the session lands on
    /// Disconnected even when the radio calls fail. The command slot is
    /// deliberately bypassed so a stuck command cannot hold up teardown.
    pub async fn disconnect(&self) {
        let from = {
            let mut inner = self.inner.write();
            match inner.state {
                SessionState::Disconnected => {
                    debug!("Session {} already disconnected", self.device_id);
                    return;
                }
                SessionState::Disconnecting => {
                    debug!("Session {} already disconnecting", self.device_id);
                    return;
                }
                from => {
                    inner.state = SessionState::Disconnecting;
                    from
                }
            }
        };
        self.announce(from, SessionState::Disconnecting);
        info!("Disconnecting from {}", self.device_id);

        for key in self.router.keys_for_device(&self.device_id) {
            if let Err(e) = self
                .radio
                .stop_notify(&self.device_id, key.service, key.characteristic)
                .await
            {
                warn!("Failed to stop notifications for {}: {}", key, e);
            }
            self.router.unsubscribe(&key);
        }

        if let Err(e) = self.radio.disconnect(&self.device_id).await {
            warn!(
                "Radio disconnect for {} failed: {}; treating as disconnected",
                self.device_id, e
            );
        }

        self.finish_disconnect();
    }

    /// Handles a spontaneous disconnect reported by the radio.
    ///
    /// Moves straight to Disconnected from whatever state the session was
    /// in, clears the snapshot, and drops the device's subscriptions. The
    /// link is already gone, so no radio calls are made.
    pub(crate) fn handle_remote_disconnect(&self) {
        let dropped = self.router.clear_device(&self.device_id);
        if dropped > 0 {
            debug!(
                "Dropped {} notification subscriptions for {}",
                dropped, self.device_id
            );
        }
        let from = self.finish_disconnect();
        if from != SessionState::Disconnected {
            info!("Device {} disconnected (was {})", self.device_id, from);
        }
    }

    /// Terminal cleanup: snapshot cleared, state Disconnected.
    fn finish_disconnect(&self) -> SessionState {
        let from = {
            let mut inner = self.inner.write();
            let from = inner.state;
            inner.state = SessionState::Disconnected;
            inner.snapshot = DiscoverySnapshot::default();
            from
        };
        if from != SessionState::Disconnected {
            self.announce(from, SessionState::Disconnected);
        }
        from
    }

    /// Claims the per-device command slot, failing fast when taken.
    fn begin_command(&self) -> Result<CommandSlot<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::OperationInProgress {
                device_id: self.device_id.clone(),
            });
        }
        Ok(CommandSlot { busy: &self.busy })
    }

    /// Checks that the session is Ready and the triple exists in the
    /// discovery snapshot.
    fn validate_triple(&self, service: Uuid, characteristic: Uuid) -> Result<()> {
        let inner = self.inner.read();
        if !inner.state.is_ready() {
            return Err(Error::NotReady { state: inner.state });
        }
        let hosted = inner
            .snapshot
            .service(&service)
            .ok_or(Error::UnknownService { uuid: service })?;
        hosted
            .characteristic(&characteristic)
            .ok_or(Error::UnknownCharacteristic {
                uuid: characteristic,
            })?;
        Ok(())
    }

    /// Commits `to` only when the state still equals `from`.
    ///
    /// A miss means another path (usually a remote disconnect) changed the
    /// state first; the caller abandons its result.
    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let swapped = {
            let mut inner = self.inner.write();
            if inner.state == from {
                inner.state = to;
                true
            } else {
                false
            }
        };
        if swapped {
            self.announce(from, to);
        }
        swapped
    }

    fn announce(&self, from: SessionState, to: SessionState) {
        debug!("Session {} state changed: {} -> {}", self.device_id, from, to);
        let _ = self.event_tx.send(SessionEvent {
            device_id: self.device_id.clone(),
            state: to,
        });
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device_id", &self.device_id)
            .field("state", &self.state())
            .finish()
    }
}
