//! Characteristic notification routing.
//!
//! Maps (device, service, characteristic) triples to ordered listener lists
//! and fans inbound value updates out to them. The radio-level notify state
//! belongs to the caller: [`NotificationRouter::subscribe`] reports when a
//! triple gains its first listener, which is the caller's cue to enable the
//! notification on the radio, and `unsubscribe` drops the whole list at once.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{trace, warn};
use uuid::Uuid;

/// Key identifying one characteristic on one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    /// The device the characteristic lives on.
    pub device_id: String,
    /// Service hosting the characteristic.
    pub service: Uuid,
    /// The characteristic itself.
    pub characteristic: Uuid,
}

impl SubscriptionKey {
    /// Builds a key from its parts.
    pub fn new(device_id: impl Into<String>, service: Uuid, characteristic: Uuid) -> Self {
        Self {
            device_id: device_id.into(),
            service,
            characteristic,
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.device_id, self.service, self.characteristic
        )
    }
}

/// Callback invoked with each decoded characteristic value.
pub type ValueListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Fans characteristic value updates out to registered listeners.
#[derive(Default)]
pub struct NotificationRouter {
    listeners: RwLock<HashMap<SubscriptionKey, Vec<ValueListener>>>,
}

impl NotificationRouter {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for a triple.
    ///
    /// Returns `true` when the triple had no listeners before; the caller
    /// must then enable the radio-level notification.
    pub fn subscribe(&self, key: SubscriptionKey, listener: ValueListener) -> bool {
        let mut listeners = self.listeners.write();
        let list = listeners.entry(key).or_default();
        list.push(listener);
        list.len() == 1
    }

    /// Drops every listener for a triple. Returns whether any existed.
    pub fn unsubscribe(&self, key: &SubscriptionKey) -> bool {
        self.listeners.write().remove(key).is_some()
    }

    /// Whether a triple currently has listeners.
    pub fn is_active(&self, key: &SubscriptionKey) -> bool {
        self.listeners.read().contains_key(key)
    }

    /// Number of listeners registered for a triple.
    pub fn listener_count(&self, key: &SubscriptionKey) -> usize {
        self.listeners.read().get(key).map_or(0, Vec::len)
    }

    /// Keys currently registered for a device.
    pub fn keys_for_device(&self, device_id: &str) -> Vec<SubscriptionKey> {
        self.listeners
            .read()
            .keys()
            .filter(|key| key.device_id == device_id)
            .cloned()
            .collect()
    }

    /// Drops every listener for a device. Returns the triples removed.
    pub fn clear_device(&self, device_id: &str) -> usize {
        let mut listeners = self.listeners.write();
        let keys: Vec<SubscriptionKey> = listeners
            .keys()
            .filter(|key| key.device_id == device_id)
            .cloned()
            .collect();
        for key in &keys {
            listeners.remove(key);
        }
        keys.len()
    }

    /// Decodes a value update as UTF-8 and delivers it to the triple's
    /// listeners in registration order.
    ///
    /// Undecodable payloads are dropped without invoking anyone. A panicking
    /// listener is contained and does not stop delivery to the rest.
    /// Returns the number of listeners invoked.
    pub fn dispatch(&self, key: &SubscriptionKey, value: &[u8]) -> usize {
        let text = match std::str::from_utf8(value) {
            Ok(text) => text,
            Err(_) => {
                warn!(
                    "Dropping non-UTF-8 payload ({} bytes) for {}",
                    value.len(),
                    key
                );
                return 0;
            }
        };

        // Snapshot the list so listeners can re-enter the router.
        let list = match self.listeners.read().get(key) {
            Some(list) => list.clone(),
            None => {
                trace!("No listeners for {}", key);
                return 0;
            }
        };

        for listener in &list {
            if catch_unwind(AssertUnwindSafe(|| listener(text))).is_err() {
                warn!("Listener panicked while handling a value for {}", key);
            }
        }
        trace!("Delivered {} bytes to {} listeners for {}", value.len(), list.len(), key);
        list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn key(device_id: &str) -> SubscriptionKey {
        SubscriptionKey::new(
            device_id,
            crate::gatt::bluetooth_uuid(0x180D),
            crate::gatt::bluetooth_uuid(0x2A37),
        )
    }

    fn recording_listener(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> ValueListener {
        let log = log.clone();
        let tag = tag.to_string();
        Arc::new(move |text| log.lock().push(format!("{tag}:{text}")))
    }

    #[test]
    fn first_listener_triggers_radio_enable() {
        let router = NotificationRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        assert!(router.subscribe(key("dev-1"), recording_listener(&log, "a")));
        assert!(!router.subscribe(key("dev-1"), recording_listener(&log, "b")));
        assert_eq!(router.listener_count(&key("dev-1")), 2);
    }

    #[test]
    fn delivers_in_registration_order() {
        let router = NotificationRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.subscribe(key("dev-1"), recording_listener(&log, "first"));
        router.subscribe(key("dev-1"), recording_listener(&log, "second"));

        let delivered = router.dispatch(&key("dev-1"), b"72 bpm");

        assert_eq!(delivered, 2);
        assert_eq!(
            log.lock().clone(),
            vec!["first:72 bpm".to_string(), "second:72 bpm".to_string()]
        );
    }

    #[test]
    fn unsubscribe_drops_every_listener_at_once() {
        let router = NotificationRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.subscribe(key("dev-1"), recording_listener(&log, "a"));
        router.subscribe(key("dev-1"), recording_listener(&log, "b"));

        assert!(router.unsubscribe(&key("dev-1")));
        assert!(!router.unsubscribe(&key("dev-1")));
        assert!(!router.is_active(&key("dev-1")));
        assert_eq!(router.dispatch(&key("dev-1"), b"ignored"), 0);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn drops_non_utf8_payloads() {
        let router = NotificationRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.subscribe(key("dev-1"), recording_listener(&log, "a"));

        assert_eq!(router.dispatch(&key("dev-1"), &[0xFF, 0xFE, 0x80]), 0);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn a_panicking_listener_does_not_stop_the_rest() {
        let router = NotificationRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.subscribe(key("dev-1"), Arc::new(|_| panic!("listener bug")));
        router.subscribe(key("dev-1"), recording_listener(&log, "survivor"));

        let delivered = router.dispatch(&key("dev-1"), b"hello");

        assert_eq!(delivered, 2);
        assert_eq!(log.lock().clone(), vec!["survivor:hello".to_string()]);
    }

    #[test]
    fn clear_device_removes_only_that_device() {
        let router = NotificationRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.subscribe(key("dev-1"), recording_listener(&log, "a"));
        router.subscribe(key("dev-2"), recording_listener(&log, "b"));

        assert_eq!(router.keys_for_device("dev-1").len(), 1);
        assert_eq!(router.clear_device("dev-1"), 1);
        assert!(!router.is_active(&key("dev-1")));
        assert!(router.is_active(&key("dev-2")));
    }
}
