// Allow holding locks across await points - we use parking_lot which is designed for this
#![allow(clippy::await_holding_lock)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # blelink
//!
//! A cross-platform Rust library for discovering, connecting to, and
//! exchanging UTF-8 text values with Bluetooth Low Energy peripherals.
//!
//! Everything hangs off one [`SessionManager`]: it scans for peripherals,
//! keeps a session per connected device, discovers GATT services, and routes
//! characteristic notifications to registered listeners. There is no global
//! instance; construct a manager and pass it around.
//!
//! ## Features
//!
//! - **Bounded discovery**: scans stop themselves after a duration, or on demand
//! - **Session lifecycle**: Disconnected → Connecting → Connected → Discovering → Ready,
//!   observable per transition
//! - **Text reads and writes**: characteristic values decoded and encoded as UTF-8
//! - **Notification fan-out**: many listeners per characteristic, one radio-level enable
//! - **Activity feed**: a timestamped, newest-first history of every operation
//! - **Runtime permissions**: pluggable broker for platforms that gate BLE access
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blelink::{Result, SessionManager};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Create the manager and bring the radio up
//!     let manager = SessionManager::new().await?;
//!     manager.initialize().await?;
//!
//!     // Scan for nearby peripherals
//!     manager.start_scan(Duration::from_secs(10)).await?;
//!     tokio::time::sleep(Duration::from_secs(10)).await;
//!
//!     for device in manager.devices() {
//!         println!("Found {} ({}) at {} dBm", device.name, device.id, device.rssi);
//!     }
//!
//!     // Connect to the first one and list its services
//!     if let Some(device) = manager.devices().first() {
//!         manager.connect(&device.id).await?;
//!         for service in manager.services(&device.id)? {
//!             println!("  service {}", service.uuid);
//!         }
//!         manager.disconnect(&device.id).await?;
//!     }
//!
//!     manager.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ### Runtime permissions
//! Platforms that gate BLE behind runtime grants can plug a
//! [`PermissionBroker`] into [`SessionManager::with_radio_and_broker`];
//! everywhere else the default [`SystemBroker`] is a no-op.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod activity;
pub mod error;
pub mod gatt;
pub mod manager;
pub mod permissions;
pub mod radio;
pub mod registry;
pub mod router;
pub mod session;

// Re-exports for convenience
pub use error::{Error, Result};
pub use manager::{CallbackHandle, SessionManager, DEFAULT_SCAN_DURATION};

// Re-export commonly used types from submodules
pub use activity::{ActivityEntry, ActivityKind, ActivityLog};
pub use gatt::{
    bluetooth_uuid, Characteristic, CharacteristicProperties, DiscoverySnapshot, Service,
};
pub use permissions::{Grant, GrantDecision, PermissionBroker, PermissionGate, SystemBroker};
pub use radio::{Advertisement, AdvertisedPeripheral, BtleRadio, RadioEvent, RadioLink};
pub use registry::{Device, DeviceRegistry, UNKNOWN_DEVICE_NAME};
pub use router::{NotificationRouter, SubscriptionKey, ValueListener};
pub use session::{DeviceSession, FailurePhase, SessionEvent, SessionState};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<SessionManager>();
        let _ = std::any::TypeId::of::<DeviceSession>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<Device>();
        let _ = std::any::TypeId::of::<SessionState>();
        let _ = std::any::TypeId::of::<ActivityEntry>();
        let _ = std::any::TypeId::of::<SubscriptionKey>();
    }

    #[test]
    fn test_short_uuid_expansion() {
        let uuid = bluetooth_uuid(0x180D);
        assert_eq!(uuid.to_string(), "0000180d-0000-1000-8000-00805f9b34fb");
    }
}
