//! Session manager facade.
//!
//! The one object consumers hold. It owns the radio transport, the device
//! registry, the notification router, the per-device sessions, and the
//! activity log, and it runs the single event pump that routes radio events
//! to them. Construct it explicitly and share it by reference; there is no
//! process-wide instance.
//!
//! Scans are bounded: [`SessionManager::start_scan`] arms a timer that stops
//! the scan after the requested duration, and [`SessionManager::stop_scan`]
//! cancels it early.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activity::{ActivityEntry, ActivityKind, ActivityLog};
use crate::error::{Error, Result};
use crate::gatt::Service;
use crate::permissions::{PermissionBroker, PermissionGate, SystemBroker};
use crate::radio::{BtleRadio, RadioEvent, RadioLink};
use crate::registry::{Device, DeviceRegistry};
use crate::router::{NotificationRouter, SubscriptionKey};
use crate::session::{DeviceSession, SessionEvent, SessionState};

/// Scan duration used when the caller has no preference.
pub const DEFAULT_SCAN_DURATION: Duration = Duration::from_secs(10);

type SessionMap = Arc<RwLock<HashMap<String, Arc<DeviceSession>>>>;

/// Callback handle for unregistering callbacks.
///
/// The callback stays registered for the lifetime of the handle; dropping it
/// (or calling [`CallbackHandle::unregister`]) removes the registration.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Scan bookkeeping shared between commands, the stop timer, and the pump.
struct ScanState {
    /// Whether a scan is running.
    active: AtomicBool,
    /// Timer that ends the current scan.
    timer: RwLock<Option<JoinHandle<()>>>,
    /// `ScanStopped` acknowledgements still owed for stops issued here.
    pending_stops: AtomicU64,
}

impl ScanState {
    fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            timer: RwLock::new(None),
            pending_stops: AtomicU64::new(0),
        }
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.timer.write().take() {
            timer.abort();
        }
    }

    fn arm_timer(&self, timer: JoinHandle<()>) {
        if let Some(previous) = self.timer.write().replace(timer) {
            previous.abort();
        }
    }

    /// Credits one stop as issued by this manager. Must be called before
    /// the radio stop goes out, so the pump cannot see the resulting
    /// `ScanStopped` before the credit exists.
    fn expect_stop_event(&self) {
        self.pending_stops.fetch_add(1, Ordering::SeqCst);
    }

    /// Consumes one stop credit. False means the stop was not ours and the
    /// platform ended the scan on its own.
    fn acknowledge_stop(&self) -> bool {
        self.pending_stops
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Coordinates scanning, sessions, and notification routing over one radio.
pub struct SessionManager {
    /// Radio transport.
    radio: Arc<dyn RadioLink>,
    /// Runtime permission gate.
    gate: PermissionGate,
    /// Devices sighted during the current scan.
    registry: Arc<DeviceRegistry>,
    /// Notification fan-out, shared with every session.
    router: Arc<NotificationRouter>,
    /// Live sessions keyed by device identifier.
    sessions: SessionMap,
    /// Operation history.
    activity: Arc<ActivityLog>,
    /// Channel the sessions publish their transitions on.
    session_tx: broadcast::Sender<SessionEvent>,
    /// Scan flag, stop timer, and owed stop acknowledgements.
    scan: Arc<ScanState>,
    /// Radio event pump task.
    pump_handle: RwLock<Option<JoinHandle<()>>>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
}

impl SessionManager {
    /// Creates a manager over the system Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RadioUnavailable`] when no adapter is present.
    pub async fn new() -> Result<Self> {
        let radio = BtleRadio::new().await?;
        Ok(Self::with_radio(Arc::new(radio)))
    }

    /// Creates a manager over a specific radio transport.
    pub fn with_radio(radio: Arc<dyn RadioLink>) -> Self {
        Self::with_radio_and_broker(radio, SystemBroker)
    }

    /// Creates a manager over a specific radio and permission broker.
    pub fn with_radio_and_broker(
        radio: Arc<dyn RadioLink>,
        broker: impl PermissionBroker + 'static,
    ) -> Self {
        let (session_tx, _) = broadcast::channel(64);
        Self {
            radio,
            gate: PermissionGate::new(broker),
            registry: Arc::new(DeviceRegistry::new()),
            router: Arc::new(NotificationRouter::new()),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            activity: Arc::new(ActivityLog::new()),
            session_tx,
            scan: Arc::new(ScanState::new()),
            pump_handle: RwLock::new(None),
            callback_counter: AtomicU64::new(0),
        }
    }

    /// Brings the radio up, starts the event pump, and requests permissions.
    ///
    /// Safe to call repeatedly: the radio startup re-runs, but the event pump
    /// is started at most once, so events are never delivered twice. A radio
    /// that is present but powered off is reported in the activity log and is
    /// not an error; commands will fail until it is switched on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] when a required grant is refused.
    pub async fn initialize(&self) -> Result<()> {
        self.radio.initialize().await?;

        if !self.radio.is_available().await {
            warn!("Bluetooth adapter is not powered on");
            self.activity.record(
                ActivityKind::Error,
                None,
                "Bluetooth is not available or disabled",
            );
        }

        self.ensure_event_pump();
        self.gate.ensure().await?;

        info!("Session manager initialized");
        Ok(())
    }

    /// Stops event delivery.
    ///
    /// Aborts the event pump and any scan timer. Live sessions are left
    /// untouched; callers that want peripherals released must
    /// [`disconnect`](Self::disconnect) them explicitly. A later
    /// [`initialize`](Self::initialize) starts a fresh pump.
    pub fn shutdown(&self) {
        info!("Shutting down session manager");
        if let Some(pump) = self.pump_handle.write().take() {
            pump.abort();
        }
        self.scan.cancel_timer();
        self.scan.active.store(false, Ordering::SeqCst);
        // The aborted pump takes any owed stop acknowledgements with it.
        self.scan.pending_stops.store(0, Ordering::SeqCst);
    }

    // --- Scanning ------------------------------------------------------

    /// Starts a scan that stops itself after `duration`.
    ///
    /// Any previous scan is stopped first, best effort, and the registry is
    /// cleared so observers never see stale entries alongside fresh ones.
    pub async fn start_scan(&self, duration: Duration) -> Result<()> {
        if self.scan.active.swap(false, Ordering::SeqCst) {
            self.scan.cancel_timer();
            self.scan.expect_stop_event();
            if let Err(e) = self.radio.stop_scan().await {
                self.scan.acknowledge_stop();
                debug!("Stopping previous scan failed: {}", e);
            }
        }

        self.registry.clear();
        self.radio.start_scan().await?;
        self.scan.active.store(true, Ordering::SeqCst);
        info!("Scan started for {:?}", duration);
        self.activity.record(
            ActivityKind::Info,
            None,
            format!("Scan started ({duration:?})"),
        );

        let radio = self.radio.clone();
        let scan = self.scan.clone();
        let activity = self.activity.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if !scan.active.swap(false, Ordering::SeqCst) {
                return;
            }
            debug!("Scan duration elapsed, stopping");
            scan.expect_stop_event();
            match radio.stop_scan().await {
                Ok(()) => activity.record(ActivityKind::Info, None, "Scan stopped"),
                Err(e) => {
                    scan.acknowledge_stop();
                    warn!("Failed to stop scan after its duration: {}", e);
                }
            }
        });
        self.scan.arm_timer(timer);
        Ok(())
    }

    /// Stops the current scan and cancels its timer.
    ///
    /// Calling this when no scan is running is a no-op.
    pub async fn stop_scan(&self) -> Result<()> {
        self.scan.cancel_timer();
        if !self.scan.active.swap(false, Ordering::SeqCst) {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }
        self.scan.expect_stop_event();
        if let Err(e) = self.radio.stop_scan().await {
            self.scan.acknowledge_stop();
            return Err(e);
        }
        self.activity.record(ActivityKind::Info, None, "Scan stopped");
        Ok(())
    }

    /// Whether a scan is currently running.
    pub fn is_scanning(&self) -> bool {
        self.scan.active.load(Ordering::SeqCst)
    }

    // --- Sessions ------------------------------------------------------

    /// Connects to a device and discovers its services.
    ///
    /// Creates the session, drives it to Ready, and keeps it in the session
    /// arena until [`disconnect`](Self::disconnect) or a remote disconnect
    /// destroys it. A failed attempt is evicted, so the next call starts
    /// from a clean session.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyConnected`] when a live session exists for the device,
    /// [`Error::OperationInProgress`] when one is mid-transition, and the
    /// establish errors ([`Error::ConnectionFailed`], [`Error::DiscoveryFailed`],
    /// [`Error::ConnectionLost`]) otherwise.
    pub async fn connect(&self, device_id: &str) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.write();
            match sessions.get(device_id) {
                Some(existing) => {
                    let state = existing.state();
                    if state.is_established() {
                        return Err(Error::AlreadyConnected {
                            device_id: device_id.to_string(),
                        });
                    }
                    if state.is_transitioning() {
                        return Err(Error::OperationInProgress {
                            device_id: device_id.to_string(),
                        });
                    }
                    // Disconnected or Failed leftover: drive it again.
                    existing.clone()
                }
                None => {
                    let session = Arc::new(DeviceSession::new(
                        device_id,
                        self.radio.clone(),
                        self.router.clone(),
                        self.session_tx.clone(),
                    ));
                    sessions.insert(device_id.to_string(), session.clone());
                    session
                }
            }
        };

        match session.establish().await {
            Ok(()) => {
                self.activity.record(
                    ActivityKind::Info,
                    Some(device_id),
                    format!("Connected to {device_id}"),
                );
                Ok(())
            }
            Err(e) => {
                // Evict the failed session so a retry starts clean. The
                // pointer check keeps a session another caller has since
                // replaced out of harm's way.
                {
                    let mut sessions = self.sessions.write();
                    if let Some(current) = sessions.get(device_id) {
                        if Arc::ptr_eq(current, &session) {
                            sessions.remove(device_id);
                        }
                    }
                }
                self.activity
                    .record(ActivityKind::Error, Some(device_id), e.to_string());
                Err(e)
            }
        }
    }

    /// Disconnects from a device and destroys its session.
    ///
    /// Active notification subscriptions are stopped best-effort and the
    /// session always ends Disconnected, even when radio calls fail.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] when no session exists.
    pub async fn disconnect(&self, device_id: &str) -> Result<()> {
        let session =
            self.sessions
                .write()
                .remove(device_id)
                .ok_or_else(|| Error::DeviceNotFound {
                    device_id: device_id.to_string(),
                })?;
        session.disconnect().await;
        self.activity.record(
            ActivityKind::Info,
            Some(device_id),
            format!("Disconnected from {device_id}"),
        );
        Ok(())
    }

    /// The lifecycle state of a device's session.
    pub fn session_state(&self, device_id: &str) -> Result<SessionState> {
        Ok(self.session(device_id)?.state())
    }

    /// The services discovered on a connected device.
    pub fn services(&self, device_id: &str) -> Result<Vec<Service>> {
        self.session(device_id)?.services()
    }

    // --- Characteristic operations -------------------------------------

    /// Reads a characteristic and decodes the value as UTF-8 text.
    pub async fn read(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<String> {
        let session = self.session(device_id)?;
        match session.read(service, characteristic).await {
            Ok(text) => {
                self.activity
                    .record(ActivityKind::Read, Some(device_id), text.clone());
                Ok(text)
            }
            Err(e) => {
                self.activity.record(
                    ActivityKind::Error,
                    Some(device_id),
                    format!("Read failed: {e}"),
                );
                Err(e)
            }
        }
    }

    /// Writes UTF-8 text to a characteristic.
    pub async fn write(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
        text: &str,
        with_response: bool,
    ) -> Result<()> {
        let session = self.session(device_id)?;
        match session
            .write(service, characteristic, text, with_response)
            .await
        {
            Ok(()) => {
                self.activity
                    .record(ActivityKind::Write, Some(device_id), text);
                Ok(())
            }
            Err(e) => {
                self.activity.record(
                    ActivityKind::Error,
                    Some(device_id),
                    format!("Write failed: {e}"),
                );
                Err(e)
            }
        }
    }

    /// Registers `on_value` for value updates from a characteristic.
    ///
    /// Listeners accumulate per characteristic; the radio-level notification
    /// is enabled with the first one.
    pub async fn start_notifications<F>(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
        on_value: F,
    ) -> Result<()>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let session = self.session(device_id)?;
        match session
            .start_notifications(service, characteristic, Arc::new(on_value))
            .await
        {
            Ok(()) => {
                self.activity.record(
                    ActivityKind::Info,
                    Some(device_id),
                    format!("Notifications started for {characteristic}"),
                );
                Ok(())
            }
            Err(e) => {
                self.activity.record(
                    ActivityKind::Error,
                    Some(device_id),
                    format!("Start notifications failed: {e}"),
                );
                Err(e)
            }
        }
    }

    /// Disables notifications for a characteristic and drops all of its
    /// listeners.
    pub async fn stop_notifications(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        let session = self.session(device_id)?;
        match session.stop_notifications(service, characteristic).await {
            Ok(()) => {
                self.activity.record(
                    ActivityKind::Info,
                    Some(device_id),
                    format!("Notifications stopped for {characteristic}"),
                );
                Ok(())
            }
            Err(e) => {
                self.activity.record(
                    ActivityKind::Error,
                    Some(device_id),
                    format!("Stop notifications failed: {e}"),
                );
                Err(e)
            }
        }
    }

    // --- Observers ------------------------------------------------------

    /// The devices discovered by the current scan, in discovery order.
    pub fn devices(&self) -> Vec<Device> {
        self.registry.snapshot()
    }

    /// Looks up a discovered device by identifier.
    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.registry.get(device_id)
    }

    /// Subscribes to registry snapshots, one per change.
    pub fn subscribe_devices(&self) -> broadcast::Receiver<Vec<Device>> {
        self.registry.subscribe()
    }

    /// Registers a callback for registry changes.
    pub fn on_devices_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(Vec<Device>) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.registry.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(devices) = rx.recv().await {
                callback(devices);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Subscribes to session state transitions across all devices.
    pub fn subscribe_sessions(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_tx.subscribe()
    }

    /// Registers a callback for session state transitions.
    pub fn on_session_state<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.session_tx.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                callback(event);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// The operation history.
    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    /// Subscribes to activity entries as they are recorded.
    pub fn subscribe_activity(&self) -> broadcast::Receiver<ActivityEntry> {
        self.activity.subscribe()
    }

    // --- Internals ------------------------------------------------------

    fn session(&self, device_id: &str) -> Result<Arc<DeviceSession>> {
        self.sessions
            .read()
            .get(device_id)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                device_id: device_id.to_string(),
            })
    }

    /// Spawns the radio event pump, once.
    fn ensure_event_pump(&self) {
        let mut pump = self.pump_handle.write();
        if pump.is_some() {
            debug!("Radio event pump already running");
            return;
        }

        let mut rx = self.radio.subscribe();
        let registry = self.registry.clone();
        let router = self.router.clone();
        let sessions = self.sessions.clone();
        let activity = self.activity.clone();
        let scan = self.scan.clone();

        *pump = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => Self::handle_radio_event(
                        event, &registry, &router, &sessions, &activity, &scan,
                    ),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Radio event pump lagged, {} events dropped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Radio event stream ended");
        }));
    }

    /// Routes one radio event to the component that owns it.
    fn handle_radio_event(
        event: RadioEvent,
        registry: &DeviceRegistry,
        router: &NotificationRouter,
        sessions: &RwLock<HashMap<String, Arc<DeviceSession>>>,
        activity: &ActivityLog,
        scan: &ScanState,
    ) {
        match event {
            RadioEvent::PeripheralDiscovered(sighting) => {
                registry.upsert(sighting);
            }
            RadioEvent::ScanStopped => {
                if scan.acknowledge_stop() {
                    debug!("Scan stop acknowledged");
                } else {
                    scan.cancel_timer();
                    if scan.active.swap(false, Ordering::SeqCst) {
                        debug!("Scan stopped by the platform");
                        activity.record(ActivityKind::Info, None, "Scan stopped");
                    }
                }
            }
            RadioEvent::PeripheralDisconnected { device_id } => {
                match sessions.write().remove(&device_id) {
                    Some(session) => {
                        session.handle_remote_disconnect();
                        activity.record(
                            ActivityKind::Info,
                            Some(&device_id),
                            format!("Device {device_id} disconnected"),
                        );
                    }
                    None => {
                        // No live session, but stray router keys would keep
                        // dispatching to a device that is gone.
                        router.clear_device(&device_id);
                        debug!("Disconnect event for unmanaged device {}", device_id);
                    }
                }
            }
            RadioEvent::CharacteristicValueUpdated {
                device_id,
                service,
                characteristic,
                value,
            } => {
                let key = SubscriptionKey::new(device_id.clone(), service, characteristic);
                let delivered = router.dispatch(&key, &value);
                if delivered > 0 {
                    if let Ok(text) = std::str::from_utf8(&value) {
                        activity.record(ActivityKind::Notification, Some(&device_id), text);
                    }
                }
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(pump) = self.pump_handle.write().take() {
            pump.abort();
        }
        self.scan.cancel_timer();
    }
}
