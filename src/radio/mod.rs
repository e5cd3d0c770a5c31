//! Radio transport abstraction.
//!
//! The session layer drives an abstract radio rather than a concrete
//! Bluetooth stack: scanning, connections, GATT operations, and a typed
//! out-of-band event stream. Production code runs against [`BtleRadio`];
//! the unit tests script a fake.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;
use crate::gatt::Service;

pub mod btle;
#[cfg(test)]
pub(crate) mod fake;

pub use btle::BtleRadio;

/// Advertisement payload carried with a sighting, passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Advertisement {
    /// Manufacturer-specific data keyed by company identifier.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Service UUIDs listed in the advertisement.
    pub services: Vec<Uuid>,
    /// Service data keyed by service UUID.
    pub service_data: HashMap<Uuid, Vec<u8>>,
}

/// A raw sighting of an advertising peripheral, before normalization.
#[derive(Debug, Clone)]
pub struct AdvertisedPeripheral {
    /// Platform identifier, stable for the scan session.
    pub id: String,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Signal strength in dBm, if reported.
    pub rssi: Option<i16>,
    /// The advertisement payload.
    pub advertisement: Advertisement,
}

/// Out-of-band event pushed up from the radio.
#[derive(Debug, Clone)]
pub enum RadioEvent {
    /// A peripheral was sighted during a scan, for the first time or again.
    PeripheralDiscovered(AdvertisedPeripheral),
    /// The scan stopped.
    ScanStopped,
    /// A connected peripheral dropped its connection.
    PeripheralDisconnected {
        /// Identifier of the peripheral that disconnected.
        device_id: String,
    },
    /// A subscribed characteristic pushed a new value.
    CharacteristicValueUpdated {
        /// Identifier of the peripheral that sent the value.
        device_id: String,
        /// Service hosting the characteristic.
        service: Uuid,
        /// Characteristic that changed.
        characteristic: Uuid,
        /// The raw value bytes.
        value: Bytes,
    },
}

/// Abstract radio transport consumed by the session layer.
///
/// Implementations must be cheap to share behind an `Arc` and safe to call
/// from multiple tasks. Per-device command ordering is enforced above this
/// trait, not inside it.
#[async_trait]
pub trait RadioLink: Send + Sync {
    /// Brings the transport up. Safe to call repeatedly.
    async fn initialize(&self) -> Result<()>;

    /// Whether the underlying adapter is present and powered on.
    async fn is_available(&self) -> bool;

    /// Starts advertising discovery.
    async fn start_scan(&self) -> Result<()>;

    /// Stops an in-progress scan. Must be safe to call when not scanning.
    async fn stop_scan(&self) -> Result<()>;

    /// Connects to a previously sighted peripheral.
    async fn connect(&self, device_id: &str) -> Result<()>;

    /// Disconnects from a peripheral.
    async fn disconnect(&self, device_id: &str) -> Result<()>;

    /// Discovers services and characteristics on a connected peripheral.
    async fn retrieve_services(&self, device_id: &str) -> Result<Vec<Service>>;

    /// Reads the current value of a characteristic.
    async fn read(&self, device_id: &str, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Writes a value to a characteristic.
    async fn write(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
        with_response: bool,
    ) -> Result<()>;

    /// Enables value notifications for a characteristic.
    async fn start_notify(&self, device_id: &str, service: Uuid, characteristic: Uuid)
        -> Result<()>;

    /// Disables value notifications for a characteristic.
    async fn stop_notify(&self, device_id: &str, service: Uuid, characteristic: Uuid)
        -> Result<()>;

    /// Subscribes to the out-of-band event stream.
    fn subscribe(&self) -> broadcast::Receiver<RadioEvent>;
}
