//! Runtime permission gating for radio access.
//!
//! Some platforms put BLE behind runtime grants. Newer Android-style API
//! levels carry dedicated scan and connect grants; older levels proxy BLE
//! access through the fine-location grant; desktop platforms have no runtime
//! layer at all. The gate requests the minimal set for the reported level
//! and surfaces refusals as a single error listing every refused grant.

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};

/// First API level with dedicated Bluetooth scan and connect grants.
pub const SPLIT_GRANTS_API_LEVEL: u32 = 31;

/// A runtime permission required for radio operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Grant {
    /// Permission to scan for advertisements.
    BluetoothScan,
    /// Permission to connect to peripherals.
    BluetoothConnect,
    /// Fine-location grant, the BLE proxy on older platform levels.
    FineLocation,
}

/// Outcome of requesting a single grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantDecision {
    /// The grant that was requested.
    pub grant: Grant,
    /// Whether the platform granted it.
    pub granted: bool,
}

/// Platform hook for querying and requesting runtime permissions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PermissionBroker: Send + Sync {
    /// The platform's runtime-grant API level, or `None` when it has no
    /// runtime permission layer for BLE.
    fn api_level(&self) -> Option<u32>;

    /// Prompts for the given grants and reports each decision.
    async fn request(&self, grants: &[Grant]) -> Result<Vec<GrantDecision>>;
}

/// Broker for platforms without a runtime permission layer.
///
/// Reports no API level, so [`PermissionGate::ensure`] never prompts.
#[derive(Debug, Default)]
pub struct SystemBroker;

#[async_trait]
impl PermissionBroker for SystemBroker {
    fn api_level(&self) -> Option<u32> {
        None
    }

    async fn request(&self, grants: &[Grant]) -> Result<Vec<GrantDecision>> {
        Ok(grants
            .iter()
            .map(|&grant| GrantDecision {
                grant,
                granted: true,
            })
            .collect())
    }
}

/// Ensures the required grants are held before radio operations begin.
pub struct PermissionGate {
    broker: Box<dyn PermissionBroker>,
}

impl PermissionGate {
    /// Builds a gate over a platform broker.
    pub fn new(broker: impl PermissionBroker + 'static) -> Self {
        Self {
            broker: Box::new(broker),
        }
    }

    /// The grants required at a given API level.
    pub fn required_grants(api_level: u32) -> &'static [Grant] {
        if api_level >= SPLIT_GRANTS_API_LEVEL {
            &[
                Grant::BluetoothScan,
                Grant::BluetoothConnect,
                Grant::FineLocation,
            ]
        } else {
            &[Grant::FineLocation]
        }
    }

    /// Requests every grant required on this platform.
    ///
    /// Returns [`Error::PermissionDenied`] naming each refused grant. On
    /// platforms with no runtime layer this is a no-op.
    pub async fn ensure(&self) -> Result<()> {
        let Some(api_level) = self.broker.api_level() else {
            debug!("No runtime permission layer, skipping grant requests");
            return Ok(());
        };

        let required = Self::required_grants(api_level);
        debug!(
            "Requesting {} runtime grants at API level {}",
            required.len(),
            api_level
        );

        let decisions = self.broker.request(required).await?;
        let refused: Vec<Grant> = decisions
            .iter()
            .filter(|decision| !decision.granted)
            .map(|decision| decision.grant)
            .collect();

        if refused.is_empty() {
            Ok(())
        } else {
            Err(Error::PermissionDenied { refused })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn granting_all(grants: &[Grant]) -> Result<Vec<GrantDecision>> {
        Ok(grants
            .iter()
            .map(|&grant| GrantDecision {
                grant,
                granted: true,
            })
            .collect())
    }

    #[test]
    fn split_grants_start_at_level_31() {
        assert_eq!(
            PermissionGate::required_grants(33),
            &[
                Grant::BluetoothScan,
                Grant::BluetoothConnect,
                Grant::FineLocation
            ]
        );
        assert_eq!(
            PermissionGate::required_grants(31),
            &[
                Grant::BluetoothScan,
                Grant::BluetoothConnect,
                Grant::FineLocation
            ]
        );
        assert_eq!(
            PermissionGate::required_grants(28),
            &[Grant::FineLocation]
        );
    }

    #[tokio::test]
    async fn requests_the_split_set_on_new_levels() {
        let mut broker = MockPermissionBroker::new();
        broker.expect_api_level().return_const(Some(33u32));
        broker
            .expect_request()
            .withf(|grants| {
                grants
                    == [
                        Grant::BluetoothScan,
                        Grant::BluetoothConnect,
                        Grant::FineLocation,
                    ]
            })
            .times(1)
            .returning(granting_all);

        let gate = PermissionGate::new(broker);
        assert!(gate.ensure().await.is_ok());
    }

    #[tokio::test]
    async fn requests_only_location_on_old_levels() {
        let mut broker = MockPermissionBroker::new();
        broker.expect_api_level().return_const(Some(28u32));
        broker
            .expect_request()
            .withf(|grants| grants == [Grant::FineLocation])
            .times(1)
            .returning(granting_all);

        let gate = PermissionGate::new(broker);
        assert!(gate.ensure().await.is_ok());
    }

    #[tokio::test]
    async fn skips_prompting_without_a_runtime_layer() {
        let mut broker = MockPermissionBroker::new();
        broker.expect_api_level().return_const(None::<u32>);
        broker.expect_request().times(0);

        let gate = PermissionGate::new(broker);
        assert!(gate.ensure().await.is_ok());
    }

    #[tokio::test]
    async fn reports_every_refused_grant() {
        let mut broker = MockPermissionBroker::new();
        broker.expect_api_level().return_const(Some(33u32));
        broker.expect_request().times(1).returning(|grants| {
            Ok(grants
                .iter()
                .map(|&grant| GrantDecision {
                    grant,
                    granted: grant == Grant::FineLocation,
                })
                .collect())
        });

        let gate = PermissionGate::new(broker);
        let error = gate.ensure().await.unwrap_err();
        match error {
            Error::PermissionDenied { refused } => {
                assert_eq!(
                    refused,
                    vec![Grant::BluetoothScan, Grant::BluetoothConnect]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn system_broker_grants_everything() {
        let gate = PermissionGate::new(SystemBroker);
        assert!(gate.ensure().await.is_ok());
    }
}
