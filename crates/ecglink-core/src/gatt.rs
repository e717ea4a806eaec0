//! GATT service and characteristic discovery.
//!
//! Discovery always goes services first, then the characteristics of each
//! service, in the order the peripheral reports them. A service whose
//! characteristics cannot be read does not abort the walk: it stays in the
//! resulting [`GattTree`] with no characteristics and the failure is listed
//! alongside.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::transport::{BleTransport, TransportError};
use crate::types::{AttributeId, Characteristic, DeviceHandle, Service};

/// GATT-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GattError {
    /// A discovery round trip failed.
    #[error("GATT communication with {subject} failed: {reason}")]
    CommunicationFailed {
        /// What was being queried.
        subject: String,
        /// Transport message.
        reason: String,
    },

    /// The characteristic does not declare Notify.
    #[error("Characteristic {0} does not support notifications")]
    NotSupported(AttributeId),

    /// The enable-notifications write was refused.
    #[error("Failed to enable notifications on {characteristic}: {reason}")]
    SubscriptionFailed {
        /// Target characteristic.
        characteristic: AttributeId,
        /// Transport message.
        reason: String,
    },

    /// A round trip exceeded its bound.
    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        /// Operation name.
        operation: &'static str,
        /// Configured bound.
        after: Duration,
    },
}

impl GattError {
    fn communication(subject: impl Into<String>, err: &TransportError) -> Self {
        Self::CommunicationFailed {
            subject: subject.into(),
            reason: err.to_string(),
        }
    }
}

/// Run `fut` under `limit`, mapping expiry to [`GattError::Timeout`].
pub(crate) async fn bounded<T>(
    operation: &'static str,
    limit: Duration,
    fut: impl Future<Output = Result<T, GattError>>,
) -> Result<T, GattError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| GattError::Timeout {
            operation,
            after: limit,
        })?
}

/// A service whose characteristics could not be discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFailure {
    /// The affected service.
    pub service: AttributeId,
    /// What went wrong.
    pub error: GattError,
}

/// Result of a full discovery pass over one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GattTree {
    /// Services in peripheral order, with their characteristics.
    pub services: Vec<Service>,
    /// Services whose characteristic discovery failed.
    pub failures: Vec<ServiceFailure>,
}

impl GattTree {
    /// Every characteristic that declares Notify, in discovery order.
    pub fn notifiable(&self) -> impl Iterator<Item = &Characteristic> {
        self.services.iter().flat_map(|s| s.notifiable())
    }

    /// Total number of characteristics discovered.
    #[must_use]
    pub fn characteristic_count(&self) -> usize {
        self.services.iter().map(|s| s.characteristics.len()).sum()
    }
}

/// Walks the attribute database of a connected peripheral.
pub struct GattExplorer<T: BleTransport> {
    transport: Arc<T>,
    timeout: Duration,
}

impl<T: BleTransport> GattExplorer<T> {
    /// Create an explorer bounding each round trip by `timeout`.
    pub fn new(transport: Arc<T>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Enumerate primary services.
    ///
    /// # Errors
    ///
    /// [`GattError::CommunicationFailed`] or [`GattError::Timeout`].
    pub async fn discover_services(&self, device: &DeviceHandle) -> Result<Vec<Service>, GattError> {
        bounded("discover services", self.timeout, async {
            self.transport
                .services(device)
                .await
                .map_err(|e| GattError::communication(format!("device {}", device.address), &e))
        })
        .await
    }

    /// Enumerate the characteristics of `service`.
    ///
    /// # Errors
    ///
    /// [`GattError::CommunicationFailed`] or [`GattError::Timeout`].
    pub async fn discover_characteristics(
        &self,
        device: &DeviceHandle,
        service: &Service,
    ) -> Result<Vec<Characteristic>, GattError> {
        bounded("discover characteristics", self.timeout, async {
            self.transport
                .characteristics(device, service)
                .await
                .map_err(|e| GattError::communication(format!("service {}", service.uuid), &e))
        })
        .await
    }

    /// Discover services and then the characteristics of each.
    ///
    /// # Errors
    ///
    /// Fails only if the service list itself cannot be obtained.
    #[instrument(skip(self), fields(address = %device.address))]
    pub async fn explore(&self, device: &DeviceHandle) -> Result<GattTree, GattError> {
        let mut tree = GattTree::default();
        for mut service in self.discover_services(device).await? {
            match self.discover_characteristics(device, &service).await {
                Ok(characteristics) => {
                    debug!(
                        service = %service.uuid,
                        count = characteristics.len(),
                        "Discovered characteristics"
                    );
                    service.characteristics = characteristics;
                }
                Err(error) => {
                    warn!(service = %service.uuid, %error, "Characteristic discovery failed");
                    tree.failures.push(ServiceFailure {
                        service: service.uuid,
                        error,
                    });
                }
            }
            tree.services.push(service);
        }
        debug!(
            services = tree.services.len(),
            characteristics = tree.characteristic_count(),
            failures = tree.failures.len(),
            "GATT discovery finished"
        );
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockPeripheral, MockTransport};
    use crate::transport::BleTransport as _;
    use crate::types::{CharacteristicProperties as P, DeviceAddress};

    const ADDRESS: DeviceAddress = DeviceAddress::new(0x0011_2233_4455);

    fn id(short: u16) -> AttributeId {
        AttributeId::from_short(short)
    }

    async fn connected(peripheral: MockPeripheral) -> (Arc<MockTransport>, DeviceHandle) {
        let transport = Arc::new(MockTransport::new());
        transport.add_peripheral(ADDRESS, peripheral);
        let handle = transport.connect(ADDRESS).await.unwrap();
        (transport, handle)
    }

    #[tokio::test]
    async fn test_explore_keeps_peripheral_order() {
        let (transport, device) = connected(
            MockPeripheral::new()
                .with_service(id(0x180F), [(id(0x2A19), P::READ | P::NOTIFY)])
                .with_service(id(0x180D), [(id(0x2A37), P::NOTIFY), (id(0x2A38), P::READ)]),
        )
        .await;
        let explorer = GattExplorer::new(transport, Duration::from_secs(1));

        let tree = explorer.explore(&device).await.unwrap();
        let order: Vec<_> = tree.services.iter().map(|s| s.uuid).collect();
        assert_eq!(order, vec![id(0x180F), id(0x180D)]);
        assert_eq!(tree.characteristic_count(), 3);
        assert_eq!(tree.notifiable().count(), 2);
        assert!(tree.failures.is_empty());
    }

    #[tokio::test]
    async fn test_failing_service_does_not_hide_siblings() {
        let (transport, device) = connected(
            MockPeripheral::new()
                .with_service(id(0x1800), [(id(0x2A00), P::READ)])
                .with_failing_service(id(0x1801), TransportError::Rejected("unreachable".into()))
                .with_service(id(0x180D), [(id(0x2A37), P::NOTIFY)]),
        )
        .await;
        let explorer = GattExplorer::new(transport, Duration::from_secs(1));

        let tree = explorer.explore(&device).await.unwrap();
        assert_eq!(tree.services.len(), 3);
        assert_eq!(tree.services[0].characteristics.len(), 1);
        assert!(tree.services[1].characteristics.is_empty());
        assert_eq!(tree.services[2].characteristics.len(), 1);

        assert_eq!(tree.failures.len(), 1);
        assert_eq!(tree.failures[0].service, id(0x1801));
        assert!(matches!(tree.failures[0].error, GattError::CommunicationFailed { .. }));
    }

    #[tokio::test]
    async fn test_service_enumeration_failure_is_fatal() {
        let (transport, device) = connected(
            MockPeripheral::new().failing_service_discovery(TransportError::Other("lost".into())),
        )
        .await;
        let explorer = GattExplorer::new(transport, Duration::from_secs(1));

        let err = explorer.explore(&device).await.unwrap_err();
        assert!(matches!(err, GattError::CommunicationFailed { ref reason, .. } if reason == "lost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_round_trip_times_out() {
        let (transport, device) =
            connected(MockPeripheral::new().with_service(id(0x180D), [(id(0x2A37), P::NOTIFY)])).await;
        transport.set_round_trip_delay(Duration::from_secs(30));
        let explorer = GattExplorer::new(transport, Duration::from_millis(100));

        let err = explorer.discover_services(&device).await.unwrap_err();
        assert_eq!(
            err,
            GattError::Timeout {
                operation: "discover services",
                after: Duration::from_millis(100)
            }
        );
    }
}
