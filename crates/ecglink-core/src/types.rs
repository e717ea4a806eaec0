//! Shared data model.
//!
//! Addresses, attribute identifiers, advertisements and the GATT tree
//! snapshot produced for one connection.

use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::{self, AddressParseError};

// ============================================================================
// Identifiers
// ============================================================================

/// 48-bit link-layer address of a BLE peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress(u64);

impl DeviceAddress {
    /// Create an address from its integer form. Bits above 48 are dropped.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value & codec::ADDRESS_MASK)
    }

    /// Create an address from six octets, most significant first.
    #[must_use]
    pub fn from_octets(octets: [u8; 6]) -> Self {
        Self(octets.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    /// The six octets, most significant first.
    #[must_use]
    pub fn octets(self) -> [u8; 6] {
        let mut out = [0u8; 6];
        for (i, octet) in out.iter_mut().enumerate() {
            *octet = ((self.0 >> ((5 - i) * 8)) & 0xFF) as u8;
        }
        out
    }

    /// The integer form.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&codec::format_address(self.0))
    }
}

impl FromStr for DeviceAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        codec::parse_address(s)
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = AddressParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceAddress> for String {
    fn from(address: DeviceAddress) -> Self {
        address.to_string()
    }
}

/// 128-bit identifier of a GATT service or characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AttributeId(Uuid);

impl AttributeId {
    /// Bluetooth SIG base UUID that 16-bit short identifiers expand into.
    pub const BASE: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

    /// Create an identifier from its integer form.
    #[must_use]
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Expand a 16-bit SIG-assigned number, e.g. `0x180D` for Heart Rate.
    #[must_use]
    pub const fn from_short(short: u16) -> Self {
        Self::from_u128(Self::BASE | ((short as u128) << 96))
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn uuid(self) -> Uuid {
        self.0
    }

    /// The integer form.
    #[must_use]
    pub const fn as_u128(self) -> u128 {
        self.0.as_u128()
    }
}

impl From<Uuid> for AttributeId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&codec::format_attribute_id(self.as_u128()))
    }
}

impl TryFrom<String> for AttributeId {
    type Error = uuid::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Uuid::parse_str(&value).map(Self)
    }
}

impl From<AttributeId> for String {
    fn from(id: AttributeId) -> Self {
        id.to_string()
    }
}

// ============================================================================
// Advertisements
// ============================================================================

/// One observed advertising broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    /// Advertiser address.
    pub address: DeviceAddress,

    /// Complete or shortened local name, if the packet carried one.
    pub local_name: Option<String>,

    /// Received signal strength in dBm.
    pub rssi_dbm: Option<i16>,
}

impl Advertisement {
    /// Build an advertisement value.
    #[must_use]
    pub fn new(address: DeviceAddress, local_name: Option<&str>, rssi_dbm: Option<i16>) -> Self {
        Self {
            address,
            local_name: local_name.map(str::to_owned),
            rssi_dbm,
        }
    }
}

/// Whether the scanner sends scan requests or only listens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Send scan requests to collect scan response data (names).
    #[default]
    Active,
    /// Listen only.
    Passive,
}

// ============================================================================
// GATT
// ============================================================================

/// GATT characteristic property bits, using the Bluetooth attribute-protocol values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    /// No properties.
    pub const NONE: Self = Self(0);
    /// Broadcast.
    pub const BROADCAST: Self = Self(0x01);
    /// Read.
    pub const READ: Self = Self(0x02);
    /// Write without response.
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
    /// Write.
    pub const WRITE: Self = Self(0x08);
    /// Notify.
    pub const NOTIFY: Self = Self(0x10);
    /// Indicate.
    pub const INDICATE: Self = Self(0x20);
    /// Authenticated signed writes.
    pub const AUTHENTICATED_SIGNED_WRITES: Self = Self(0x40);
    /// Extended properties descriptor present.
    pub const EXTENDED_PROPERTIES: Self = Self(0x80);

    const NAMES: [(Self, &'static str); 8] = [
        (Self::BROADCAST, "Broadcast"),
        (Self::READ, "Read"),
        (Self::WRITE_WITHOUT_RESPONSE, "WriteWithoutResponse"),
        (Self::WRITE, "Write"),
        (Self::NOTIFY, "Notify"),
        (Self::INDICATE, "Indicate"),
        (Self::AUTHENTICATED_SIGNED_WRITES, "AuthenticatedSignedWrites"),
        (Self::EXTENDED_PROPERTIES, "ExtendedProperties"),
    ];

    /// Build from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// `true` if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// `true` if the Notify bit is set.
    #[must_use]
    pub const fn can_notify(self) -> bool {
        self.contains(Self::NOTIFY)
    }

    /// Names of the set bits in bit order.
    #[must_use]
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for CharacteristicProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join(" "))
    }
}

/// A characteristic discovered on one connection.
///
/// `service_handle` and `handle` are the transport's identifiers and are only
/// meaningful for the connection that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    /// Characteristic UUID.
    pub uuid: AttributeId,
    /// Declared properties.
    pub properties: CharacteristicProperties,
    /// UUID of the owning service.
    pub service: AttributeId,
    /// Transport handle of the owning service.
    pub service_handle: u16,
    /// Transport handle of this characteristic.
    pub handle: u16,
}

/// A primary service and, once discovered, its characteristics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Service UUID.
    pub uuid: AttributeId,
    /// Transport handle of this service.
    pub handle: u16,
    /// Characteristics in peripheral-reported order.
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    /// Iterate characteristics that can notify.
    pub fn notifiable(&self) -> impl Iterator<Item = &Characteristic> {
        self.characteristics
            .iter()
            .filter(|c| c.properties.can_notify())
    }
}

/// A live connection as handed out by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Peer address.
    pub address: DeviceAddress,
    /// Transport-assigned connection number; differs across reconnects.
    pub connection_id: u64,
}

// ============================================================================
// Notifications and session state
// ============================================================================

/// One value pushed by the peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Source characteristic.
    pub characteristic: AttributeId,
    /// Raw value bytes, unmodified.
    pub payload: Vec<u8>,
    /// Local arrival time.
    pub received_at: DateTime<Utc>,
}

/// Discovery session lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, not started.
    #[default]
    Idle,
    /// Waiting for a matching advertisement.
    Scanning,
    /// Connecting to the matched peripheral.
    Connecting,
    /// Walking the GATT tree and enabling notifications.
    Discovering,
    /// Every notify-capable characteristic has been attempted.
    Subscribed,
    /// Connect or discovery failed.
    Error,
    /// Stopped by request.
    Stopped,
}

impl SessionState {
    /// `true` while a worker may be running.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Scanning | Self::Connecting | Self::Discovering | Self::Subscribed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::Discovering => "discovering",
            Self::Subscribed => "subscribed",
            Self::Error => "error",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_octets() {
        let address = DeviceAddress::from_octets([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(address.as_u64(), 0x0011_2233_4455);
        assert_eq!(address.octets(), [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(address.to_string(), "00:11:22:33:44:55");
    }

    #[test]
    fn test_address_serializes_as_string() {
        let address = DeviceAddress::new(0xAABB_CCDD_EEFF);
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, "\"AA:BB:CC:DD:EE:FF\"");
        let back: DeviceAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, address);
        assert!(serde_json::from_str::<DeviceAddress>("\"nope\"").is_err());
    }

    #[test]
    fn test_short_attribute_id() {
        let heart_rate = AttributeId::from_short(0x180D);
        assert_eq!(heart_rate.to_string(), "0000180D-0000-1000-8000-00805F9B34FB");
        let parsed: AttributeId =
            serde_json::from_str("\"0000180d-0000-1000-8000-00805f9b34fb\"").unwrap();
        assert_eq!(parsed, heart_rate);
    }

    #[test]
    fn test_properties() {
        let props = CharacteristicProperties::READ | CharacteristicProperties::NOTIFY;
        assert!(props.can_notify());
        assert!(props.contains(CharacteristicProperties::READ));
        assert!(!props.contains(CharacteristicProperties::WRITE));
        assert!(!CharacteristicProperties::READ.can_notify());
        assert_eq!(props.to_string(), "Read Notify");
        assert_eq!(props.bits(), 0x12);
    }

    #[test]
    fn test_session_state_activity() {
        assert!(SessionState::Scanning.is_active());
        assert!(SessionState::Subscribed.is_active());
        assert!(!SessionState::Idle.is_active());
        assert!(!SessionState::Error.is_active());
        assert!(!SessionState::Stopped.is_active());
    }
}
