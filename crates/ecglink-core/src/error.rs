//! Unified error types for the ecglink core library.
//!
//! [`LinkError`] covers every failure a caller of the core can see. The
//! lower layers have their own narrower types ([`TransportError`],
//! [`GattError`], [`ConfigError`]) which convert into it.
//!
//! Failures on a single service or characteristic never surface here: the
//! discovery session records them and carries on with the siblings.
//!
//! # Example
//!
//! ```rust
//! use ecglink_core::error::{LinkError, Result};
//!
//! fn claim(busy: bool) -> Result<()> {
//!     if busy {
//!         return Err(LinkError::SessionBusy);
//!     }
//!     Ok(())
//! }
//!
//! assert_eq!(claim(true).unwrap_err().error_code(), "SESSION_BUSY");
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::gatt::GattError;
use crate::transport::TransportError;
use crate::types::{AttributeId, DeviceAddress};

/// The unified error type for all ecglink operations.
#[derive(Debug, Error)]
pub enum LinkError {
    // =========================================================================
    // SCANNING
    // =========================================================================
    /// The radio refused to start scanning.
    #[error("Failed to start BLE scan: {0}. Ensure the adapter is present, powered on and accessible.")]
    ScanStartFailed(String),

    /// The radio did not acknowledge the end of a scan.
    #[error("Failed to stop BLE scan: {0}")]
    ScanStopFailed(String),

    /// A scan or session is already running.
    #[error("Already scanning. Stop the running scan before starting another.")]
    AlreadyScanning,

    // =========================================================================
    // CONNECTION
    // =========================================================================
    /// Connecting to the peripheral failed.
    #[error("Failed to connect to {address}: {reason}")]
    ConnectFailed {
        /// Target address.
        address: DeviceAddress,
        /// Transport message.
        reason: String,
    },

    /// A connection is already established or in progress.
    #[error("Another device session is already active or being established")]
    SessionBusy,

    // =========================================================================
    // GATT
    // =========================================================================
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

    /// Writing the enable-notifications descriptor failed.
    #[error("Failed to enable notifications on {characteristic}: {reason}")]
    SubscriptionFailed {
        /// Target characteristic.
        characteristic: AttributeId,
        /// Transport message.
        reason: String,
    },

    /// A bounded operation did not finish in time.
    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        /// Operation name.
        operation: &'static str,
        /// Configured bound.
        after: Duration,
    },

    // =========================================================================
    // CONFIGURATION
    // =========================================================================
    /// Configuration could not be loaded, saved or validated.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A specialized [`Result`] type for ecglink operations.
pub type Result<T> = std::result::Result<T, LinkError>;

impl LinkError {
    /// Returns `true` for failures on the scan path.
    #[inline]
    #[must_use]
    pub const fn is_scan_error(&self) -> bool {
        matches!(
            self,
            Self::ScanStartFailed(_) | Self::ScanStopFailed(_) | Self::AlreadyScanning
        )
    }

    /// Returns `true` for GATT discovery and subscription failures.
    #[inline]
    #[must_use]
    pub const fn is_gatt_error(&self) -> bool {
        matches!(
            self,
            Self::CommunicationFailed { .. }
                | Self::NotSupported(_)
                | Self::SubscriptionFailed { .. }
        )
    }

    /// Returns `true` if this is an expected outcome rather than a fault.
    ///
    /// A characteristic without Notify is skipped, not broken.
    #[inline]
    #[must_use]
    pub const fn is_expected_state(&self) -> bool {
        matches!(self, Self::NotSupported(_))
    }

    /// Returns `true` if retrying against a later advertisement may succeed.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed { .. }
                | Self::CommunicationFailed { .. }
                | Self::SubscriptionFailed { .. }
                | Self::Timeout { .. }
                | Self::SessionBusy
        )
    }

    /// Returns a machine-readable error code.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::ScanStartFailed(_) => "SCAN_START_FAILED",
            Self::ScanStopFailed(_) => "SCAN_STOP_FAILED",
            Self::AlreadyScanning => "ALREADY_SCANNING",
            Self::ConnectFailed { .. } => "CONNECT_FAILED",
            Self::SessionBusy => "SESSION_BUSY",
            Self::CommunicationFailed { .. } => "COMMUNICATION_FAILED",
            Self::NotSupported(_) => "NOT_SUPPORTED",
            Self::SubscriptionFailed { .. } => "SUBSCRIPTION_FAILED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    pub(crate) fn connect_failed(address: DeviceAddress, err: &TransportError) -> Self {
        Self::ConnectFailed {
            address,
            reason: err.to_string(),
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<GattError> for LinkError {
    fn from(err: GattError) -> Self {
        match err {
            GattError::CommunicationFailed { subject, reason } => {
                Self::CommunicationFailed { subject, reason }
            }
            GattError::NotSupported(characteristic) => Self::NotSupported(characteristic),
            GattError::SubscriptionFailed {
                characteristic,
                reason,
            } => Self::SubscriptionFailed {
                characteristic,
                reason,
            },
            GattError::Timeout { operation, after } => Self::Timeout { operation, after },
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn heart_rate() -> AttributeId {
        AttributeId::from_short(0x2A37)
    }

    #[test]
    fn test_classification() {
        assert!(LinkError::ScanStartFailed("off".into()).is_scan_error());
        assert!(LinkError::AlreadyScanning.is_scan_error());
        assert!(LinkError::ScanStopFailed("gone".into()).is_scan_error());
        assert!(!LinkError::SessionBusy.is_scan_error());

        assert!(LinkError::NotSupported(heart_rate()).is_gatt_error());
        assert!(LinkError::NotSupported(heart_rate()).is_expected_state());
        assert!(!LinkError::SessionBusy.is_expected_state());
    }

    #[test]
    fn test_recoverable_errors() {
        let connect = LinkError::connect_failed(
            DeviceAddress::new(1),
            &TransportError::Rejected("busy".into()),
        );
        assert!(connect.is_recoverable());
        assert!(LinkError::Timeout {
            operation: "connect",
            after: Duration::from_secs(1)
        }
        .is_recoverable());
        assert!(!LinkError::ScanStartFailed("off".into()).is_recoverable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(LinkError::AlreadyScanning.error_code(), "ALREADY_SCANNING");
        assert_eq!(
            LinkError::ScanStopFailed("gone".into()).error_code(),
            "SCAN_STOP_FAILED"
        );
        assert_eq!(LinkError::SessionBusy.error_code(), "SESSION_BUSY");
        assert_eq!(
            LinkError::NotSupported(heart_rate()).error_code(),
            "NOT_SUPPORTED"
        );
    }

    #[test]
    fn test_from_gatt_error() {
        let err: LinkError = GattError::SubscriptionFailed {
            characteristic: heart_rate(),
            reason: "rejected".into(),
        }
        .into();
        assert!(matches!(err, LinkError::SubscriptionFailed { .. }));

        let err: LinkError = GattError::Timeout {
            operation: "discover services",
            after: Duration::from_millis(250),
        }
        .into();
        assert_eq!(err.to_string(), "discover services timed out after 250ms");
    }

    #[test]
    fn test_from_config_error() {
        let err: LinkError = ConfigError::ValidationError {
            field: "target.name".into(),
            message: "must not be empty".into(),
        }
        .into();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
        assert_eq!(err.to_string(), "target.name: must not be empty");
    }

    #[test]
    fn test_error_display_messages() {
        let err = LinkError::connect_failed(
            DeviceAddress::new(0x0011_2233_4455),
            &TransportError::Other("page timeout".into()),
        );
        let text = err.to_string();
        assert!(text.contains("00:11:22:33:44:55"));
        assert!(text.contains("page timeout"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<LinkError>();
        assert_sync::<LinkError>();
    }
}
