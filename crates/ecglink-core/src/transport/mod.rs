//! Boundary to the host Bluetooth stack.
//!
//! The core talks to the radio only through [`BleTransport`]. Two backends
//! exist:
//!
//! - [`bluez`] - BlueZ over D-Bus via `bluer` (feature `bluetooth`, Linux)
//! - [`mock`] - scriptable in-memory peripherals (feature `mock-bluetooth`)
//!
//! Events flow back through explicit observer traits rather than closures so
//! that what a callback captures is visible at the type level.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Advertisement, Characteristic, DeviceAddress, DeviceHandle, ScanMode, Service};

#[cfg(all(feature = "bluetooth", target_os = "linux"))]
pub mod bluez;

#[cfg(any(test, feature = "mock-bluetooth"))]
pub mod mock;

/// Failures reported by the host stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No adapter, adapter powered off, or the stack is not running.
    #[error("Bluetooth unavailable: {0}")]
    Unavailable(String),

    /// The process is not allowed to use the radio.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The peripheral answered with a non-success status.
    #[error("peripheral rejected the request: {0}")]
    Rejected(String),

    /// The device handle no longer refers to a live connection.
    #[error("device {0} is not connected")]
    NotConnected(DeviceAddress),

    /// Anything else the stack reported.
    #[error("{0}")]
    Other(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Value written to a characteristic's Client Characteristic Configuration
/// descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientConfiguration {
    /// Stop notifications and indications.
    Disabled,
    /// Ask the peripheral to send notifications.
    Notify,
}

/// Identifies one registered value listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerToken(pub u64);

/// Receives advertisements while a scan is running.
///
/// Called on the transport's dispatch context, concurrently with the rest of
/// the program. Implementations must not block.
pub trait AdvertisementObserver: Send + Sync {
    /// One advertisement was received.
    fn on_advertisement(&self, advertisement: Advertisement);
}

/// Receives characteristic value changes.
///
/// Called on the transport's dispatch context. Deliveries for one
/// characteristic are serialized and in peripheral order.
pub trait ValueListener: Send + Sync {
    /// The characteristic's value changed to `value`.
    fn on_value_changed(&self, value: &[u8]);
}

/// Operations the core needs from the host Bluetooth subsystem.
#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    /// Start continuous scanning, reporting every advertisement to `observer`.
    async fn start_scan(
        &self,
        mode: ScanMode,
        observer: Arc<dyn AdvertisementObserver>,
    ) -> TransportResult<()>;

    /// Stop scanning. Stopping an idle scanner succeeds.
    async fn stop_scan(&self) -> TransportResult<()>;

    /// Connect to the peripheral at `address`.
    async fn connect(&self, address: DeviceAddress) -> TransportResult<DeviceHandle>;

    /// Tear down a connection.
    async fn disconnect(&self, device: &DeviceHandle) -> TransportResult<()>;

    /// Give up on a [`connect`](Self::connect) whose future was dropped.
    ///
    /// The host stack may still be establishing the link, or may have
    /// finished it. Either way `address` must end up disconnected.
    async fn abort_connect(&self, address: DeviceAddress) -> TransportResult<()>;

    /// Enumerate primary services. Returned services have no characteristics.
    async fn services(&self, device: &DeviceHandle) -> TransportResult<Vec<Service>>;

    /// Enumerate the characteristics of one service.
    async fn characteristics(
        &self,
        device: &DeviceHandle,
        service: &Service,
    ) -> TransportResult<Vec<Characteristic>>;

    /// Write the Client Characteristic Configuration descriptor.
    async fn write_client_configuration(
        &self,
        device: &DeviceHandle,
        characteristic: &Characteristic,
        value: ClientConfiguration,
    ) -> TransportResult<()>;

    /// Arm `listener` for value changes on `characteristic`.
    fn register_value_listener(
        &self,
        device: &DeviceHandle,
        characteristic: &Characteristic,
        listener: Arc<dyn ValueListener>,
    ) -> TransportResult<ListenerToken>;

    /// Remove a listener. Unknown tokens are ignored.
    fn unregister_value_listener(&self, token: ListenerToken);
}
