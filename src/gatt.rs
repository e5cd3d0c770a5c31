//! GATT data model produced by service discovery.
//!
//! A session keeps a [`DiscoverySnapshot`] of the services and
//! characteristics found on its peripheral and validates every read, write
//! and subscription target against it. The snapshot is replaced wholesale on
//! each discovery and cleared when the connection ends.

use uuid::Uuid;

/// Bluetooth base UUID with the 16-bit assigned-number slot zeroed.
const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Expands a 16-bit Bluetooth assigned number into a full 128-bit UUID.
///
/// ```
/// use blelink::bluetooth_uuid;
///
/// let heart_rate = bluetooth_uuid(0x180D);
/// assert_eq!(heart_rate.to_string(), "0000180d-0000-1000-8000-00805f9b34fb");
/// ```
pub fn bluetooth_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Capability flags of a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicProperties {
    /// The value can be read.
    pub read: bool,
    /// The value can be written with an acknowledgement.
    pub write: bool,
    /// The value can be written without an acknowledgement.
    pub write_without_response: bool,
    /// The peripheral pushes value changes as notifications.
    pub notify: bool,
    /// The peripheral pushes value changes as acknowledged indications.
    pub indicate: bool,
}

impl CharacteristicProperties {
    /// Whether the peripheral can push value changes for this characteristic.
    pub fn supports_subscription(&self) -> bool {
        self.notify || self.indicate
    }

    /// Whether the characteristic accepts writes of either kind.
    pub fn supports_write(&self) -> bool {
        self.write || self.write_without_response
    }
}

/// A characteristic discovered under a service.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Characteristic {
    /// The characteristic UUID.
    pub uuid: Uuid,
    /// Capability flags reported by the peripheral.
    pub properties: CharacteristicProperties,
    /// Descriptor UUIDs, carried through untouched.
    pub descriptors: Vec<Uuid>,
}

/// A service discovered on a peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Service {
    /// The service UUID.
    pub uuid: Uuid,
    /// Characteristics hosted by this service.
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    /// Looks up a characteristic of this service by UUID.
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| &c.uuid == uuid)
    }
}

/// The services and characteristics discovered on a connected peripheral.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoverySnapshot {
    services: Vec<Service>,
}

impl DiscoverySnapshot {
    /// Builds a snapshot from discovered services.
    pub fn new(services: Vec<Service>) -> Self {
        Self { services }
    }

    /// All discovered services, in discovery order.
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Whether the snapshot holds no services.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Looks up a service by UUID.
    pub fn service(&self, uuid: &Uuid) -> Option<&Service> {
        self.services.iter().find(|s| &s.uuid == uuid)
    }

    /// Looks up a characteristic by service and characteristic UUID.
    pub fn characteristic(&self, service: &Uuid, characteristic: &Uuid) -> Option<&Characteristic> {
        self.service(service)
            .and_then(|s| s.characteristic(characteristic))
    }

    /// Finds the first service whose UUID contains the given fragment,
    /// compared case-insensitively.
    ///
    /// Convenient for locating a service by its 16-bit short form, e.g.
    /// `"180d"` for Heart Rate.
    pub fn find_service_matching(&self, fragment: &str) -> Option<&Service> {
        let fragment = fragment.to_lowercase();
        self.services
            .iter()
            .find(|s| s.uuid.to_string().contains(&fragment))
    }

    /// Finds the first characteristic of a service whose UUID contains the
    /// given fragment, compared case-insensitively.
    pub fn find_characteristic_matching(
        &self,
        service: &Uuid,
        fragment: &str,
    ) -> Option<&Characteristic> {
        let fragment = fragment.to_lowercase();
        self.service(service)?
            .characteristics
            .iter()
            .find(|c| c.uuid.to_string().contains(&fragment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_snapshot() -> DiscoverySnapshot {
        DiscoverySnapshot::new(vec![Service {
            uuid: bluetooth_uuid(0x180D),
            characteristics: vec![
                Characteristic {
                    uuid: bluetooth_uuid(0x2A37),
                    properties: CharacteristicProperties {
                        notify: true,
                        ..Default::default()
                    },
                    descriptors: vec![bluetooth_uuid(0x2902)],
                },
                Characteristic {
                    uuid: bluetooth_uuid(0x2A39),
                    properties: CharacteristicProperties {
                        write: true,
                        ..Default::default()
                    },
                    descriptors: Vec::new(),
                },
            ],
        }])
    }

    #[test]
    fn expands_short_uuids_against_the_base() {
        assert_eq!(
            bluetooth_uuid(0x180D).to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            bluetooth_uuid(0x2A37).to_string(),
            "00002a37-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn looks_up_services_and_characteristics_by_uuid() {
        let snapshot = sample_snapshot();
        let service = bluetooth_uuid(0x180D);

        assert!(snapshot.service(&service).is_some());
        assert!(snapshot
            .characteristic(&service, &bluetooth_uuid(0x2A37))
            .is_some());
        assert!(snapshot
            .characteristic(&service, &bluetooth_uuid(0x2A38))
            .is_none());
        assert!(snapshot
            .characteristic(&bluetooth_uuid(0x180F), &bluetooth_uuid(0x2A37))
            .is_none());
    }

    #[test]
    fn fragment_search_is_case_insensitive() {
        let snapshot = sample_snapshot();
        let service = snapshot.find_service_matching("180D");
        assert_eq!(service.map(|s| s.uuid), Some(bluetooth_uuid(0x180D)));

        let characteristic =
            snapshot.find_characteristic_matching(&bluetooth_uuid(0x180D), "2a37");
        assert_eq!(
            characteristic.map(|c| c.uuid),
            Some(bluetooth_uuid(0x2A37))
        );

        assert!(snapshot.find_service_matching("ffff").is_none());
    }

    #[test]
    fn subscription_support_requires_notify_or_indicate() {
        let notify_only = CharacteristicProperties {
            notify: true,
            ..Default::default()
        };
        let indicate_only = CharacteristicProperties {
            indicate: true,
            ..Default::default()
        };
        let write_only = CharacteristicProperties {
            write: true,
            ..Default::default()
        };

        assert!(notify_only.supports_subscription());
        assert!(indicate_only.supports_subscription());
        assert!(!write_only.supports_subscription());
        assert!(write_only.supports_write());
    }
}
