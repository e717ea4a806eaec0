//! # ecglink-core
//!
//! Core logic for ecglink, a BLE central client that finds a sensor by its
//! advertised name, connects, walks its GATT tree and streams notifications.
//!
//! This crate provides:
//! - Scanning and advertisement filtering
//! - GATT service and characteristic discovery
//! - Notification subscription with direct or buffered delivery
//! - The discovery session state machine tying it together
//! - Configuration loading, saving, and validation
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`session`] - Scan, connect, discover, subscribe; start/stop/status
//! - [`scanner`] - Scan lifecycle and the advertisement channel
//! - [`gatt`] - Service then characteristic discovery, tolerant of partial failure
//! - [`subscriber`] - Enabling and disabling notifications
//! - [`sink`] - Notification consumers, fan-out and periodic draining
//! - [`filter`] - Advertisement matching
//! - [`transport`] - The host Bluetooth stack boundary and its backends
//! - [`codec`] - Address and attribute id text forms
//! - [`signal`] - The keep-running flag
//! - [`config`] - Application configuration
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared data model

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod codec;
pub mod config;
pub mod error;
pub mod filter;
pub mod gatt;
pub mod scanner;
pub mod session;
pub mod signal;
pub mod sink;
pub mod subscriber;
pub mod transport;
pub mod types;

// Re-export primary types for convenience
pub use codec::{format_address, format_attribute_id, parse_address, AddressParseError};
pub use config::{
    Config, ConfigError, ConfigResult, ConnectFailurePolicy, DeliveryConfig, DeliveryMode,
    SessionConfig, TargetConfig,
};
pub use error::{LinkError, Result};
pub use filter::AdvertisementFilter;
pub use gatt::{GattError, GattExplorer, GattTree, ServiceFailure};
pub use scanner::{AdvertisementChannel, Scanner};
pub use session::{
    DeviceSession, DiscoverySession, FailureRecord, FailureStage, SessionStatus,
};
pub use signal::StopSignal;
pub use sink::{ChannelSink, LatestValueBuffer, NotificationSink, SinkRegistry};
pub use subscriber::{NotificationSubscriber, SubscriptionHandle};
#[cfg(all(feature = "bluetooth", target_os = "linux"))]
pub use transport::bluez::BluezTransport;
#[cfg(any(test, feature = "mock-bluetooth"))]
pub use transport::mock::{MockPeripheral, MockTransport};
pub use transport::{BleTransport, ClientConfiguration, TransportError};
pub use types::{
    Advertisement, AttributeId, Characteristic, CharacteristicProperties, DeviceAddress,
    DeviceHandle, NotificationEvent, ScanMode, Service, SessionState,
};
