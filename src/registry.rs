//! Registry of advertising devices.
//!
//! Every peripheral sighted during the current scan lands here, keyed by
//! identifier and ordered first-sighted-first. Rediscoveries refresh the
//! entry in place without moving it; observers receive the full ordered
//! snapshot on every change.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::radio::{Advertisement, AdvertisedPeripheral};

/// Display name given to devices that advertise without a local name.
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/// Signal strength substituted when a sighting reports no RSSI, in dBm.
pub const RSSI_FLOOR: i16 = -100;

/// A discovered device, normalized for display and comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Device {
    /// Platform identifier, stable for the scan session.
    pub id: String,
    /// Advertised name, or [`UNKNOWN_DEVICE_NAME`].
    pub name: String,
    /// Signal strength in dBm, or [`RSSI_FLOOR`] when unreported.
    pub rssi: i16,
    /// The advertisement payload, passed through untouched.
    pub advertisement: Advertisement,
}

impl Device {
    /// Normalizes a raw sighting into a registry entry.
    pub fn from_sighting(sighting: AdvertisedPeripheral) -> Self {
        Self {
            id: sighting.id,
            name: sighting
                .name
                .unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_string()),
            rssi: sighting.rssi.unwrap_or(RSSI_FLOOR),
            advertisement: sighting.advertisement,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    order: Vec<String>,
    devices: HashMap<String, Device>,
}

impl RegistryInner {
    fn snapshot(&self) -> Vec<Device> {
        self.order
            .iter()
            .filter_map(|id| self.devices.get(id).cloned())
            .collect()
    }
}

/// Registry of currently-advertising devices.
pub struct DeviceRegistry {
    inner: RwLock<RegistryInner>,
    changed_tx: broadcast::Sender<Vec<Device>>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        let (changed_tx, _) = broadcast::channel(32);
        Self {
            inner: RwLock::new(RegistryInner::default()),
            changed_tx,
        }
    }

    /// Records a sighting, inserting or refreshing its entry.
    ///
    /// Sightings without an identifier are dropped. Returns whether the
    /// sighting was recorded.
    pub fn upsert(&self, sighting: AdvertisedPeripheral) -> bool {
        if sighting.id.is_empty() {
            warn!("Dropping sighting without an identifier");
            return false;
        }

        let device = Device::from_sighting(sighting);
        let snapshot = {
            let mut inner = self.inner.write();
            if !inner.devices.contains_key(&device.id) {
                debug!(
                    "Discovered device: {} ({}) RSSI {}",
                    device.name, device.id, device.rssi
                );
                inner.order.push(device.id.clone());
            }
            inner.devices.insert(device.id.clone(), device);
            inner.snapshot()
        };
        self.publish(snapshot);
        true
    }

    /// Empties the registry and notifies observers with an empty snapshot.
    pub fn clear(&self) {
        let was_empty = {
            let mut inner = self.inner.write();
            let was_empty = inner.order.is_empty();
            inner.order.clear();
            inner.devices.clear();
            was_empty
        };
        if !was_empty {
            debug!("Device registry cleared");
        }
        self.publish(Vec::new());
    }

    /// The current devices, in discovery order.
    pub fn snapshot(&self) -> Vec<Device> {
        self.inner.read().snapshot()
    }

    /// Looks up a device by identifier.
    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.inner.read().devices.get(device_id).cloned()
    }

    /// Number of known devices.
    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    /// Whether no devices are known.
    pub fn is_empty(&self) -> bool {
        self.inner.read().order.is_empty()
    }

    /// Subscribes to ordered snapshots, one per change.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<Device>> {
        self.changed_tx.subscribe()
    }

    fn publish(&self, snapshot: Vec<Device>) {
        let _ = self.changed_tx.send(snapshot);
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
