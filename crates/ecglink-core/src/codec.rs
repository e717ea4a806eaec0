//! Canonical string forms for device addresses and attribute identifiers.
//!
//! Everything here is pure and used for diagnostics, configuration and
//! display only. Control flow never depends on these strings.

use thiserror::Error;

use crate::types::DeviceAddress;

/// Mask selecting the 48 significant bits of a link-layer address.
pub const ADDRESS_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Errors produced when parsing a textual device address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressParseError {
    /// The input did not consist of exactly six octets.
    #[error("expected 6 colon-separated octets, found {found}")]
    WrongOctetCount {
        /// Number of octets found.
        found: usize,
    },

    /// One of the octets was not a two-digit hex number.
    #[error("invalid octet '{octet}' at position {position}")]
    InvalidOctet {
        /// Zero-based position of the offending octet.
        position: usize,
        /// The offending text.
        octet: String,
    },
}

/// Format a 48-bit device address as `AA:BB:CC:DD:EE:FF`.
///
/// Octets are emitted most significant first. Bits above the low 48 are
/// ignored.
#[must_use]
pub fn format_address(address: u64) -> String {
    let address = address & ADDRESS_MASK;
    let octets: Vec<String> = (0..6)
        .rev()
        .map(|i| format!("{:02X}", (address >> (i * 8)) & 0xFF))
        .collect();
    octets.join(":")
}

/// Format a 128-bit attribute identifier in 8-4-4-4-12 uppercase groups.
#[must_use]
pub fn format_attribute_id(id: u128) -> String {
    format!(
        "{:08X}-{:04X}-{:04X}-{:04X}-{:012X}",
        (id >> 96) as u32,
        ((id >> 80) & 0xFFFF) as u16,
        ((id >> 64) & 0xFFFF) as u16,
        ((id >> 48) & 0xFFFF) as u16,
        (id & 0xFFFF_FFFF_FFFF) as u64,
    )
}

/// Parse `AA:BB:CC:DD:EE:FF` (either case) into a [`DeviceAddress`].
///
/// # Errors
///
/// Returns [`AddressParseError`] if the input does not contain exactly six
/// two-digit hex octets separated by colons.
pub fn parse_address(input: &str) -> Result<DeviceAddress, AddressParseError> {
    let parts: Vec<&str> = input.trim().split(':').collect();
    if parts.len() != 6 {
        return Err(AddressParseError::WrongOctetCount { found: parts.len() });
    }

    let mut value = 0u64;
    for (position, part) in parts.iter().enumerate() {
        if part.len() != 2 {
            return Err(AddressParseError::InvalidOctet {
                position,
                octet: (*part).to_string(),
            });
        }
        let octet = u8::from_str_radix(part, 16).map_err(|_| AddressParseError::InvalidOctet {
            position,
            octet: (*part).to_string(),
        })?;
        value = (value << 8) | u64::from(octet);
    }

    Ok(DeviceAddress::new(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_address_msb_first() {
        assert_eq!(format_address(0x0011_2233_4455), "00:11:22:33:44:55");
        assert_eq!(format_address(0xAABB_CCDD_EEFF), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_format_address_ignores_high_bits() {
        assert_eq!(format_address(0xFFFF_0000_0000_0001), "00:00:00:00:00:01");
    }

    #[test]
    fn test_format_address_shape() {
        for value in [0u64, 1, 0x0A0B_0C0D_0E0F, ADDRESS_MASK, 0x8000_0000_0000] {
            let text = format_address(value);
            assert_eq!(text.matches(':').count(), 5);
            let digits: String = text.chars().filter(|c| *c != ':').collect();
            assert_eq!(digits.len(), 12);
            assert!(digits.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn test_parse_round_trip() {
        for value in [0u64, 0x0011_2233_4455, 0xDEAD_BEEF_0001, ADDRESS_MASK] {
            assert_eq!(parse_address(&format_address(value)).unwrap().as_u64(), value);
        }
    }

    #[test]
    fn test_parse_accepts_lowercase() {
        let address = parse_address("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(address.as_u64(), 0xAABB_CCDD_EEFF);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(
            parse_address("00:11:22"),
            Err(AddressParseError::WrongOctetCount { found: 3 })
        );
        assert!(matches!(
            parse_address("00:11:22:33:44:GG"),
            Err(AddressParseError::InvalidOctet { position: 5, .. })
        ));
        assert!(matches!(
            parse_address("0:11:22:33:44:55"),
            Err(AddressParseError::InvalidOctet { position: 0, .. })
        ));
    }

    #[test]
    fn test_format_attribute_id() {
        let id = 0x0000_180D_0000_1000_8000_0080_5F9B_34FB_u128;
        assert_eq!(format_attribute_id(id), "0000180D-0000-1000-8000-00805F9B34FB");
        assert_eq!(format_attribute_id(1), "00000000-0000-0000-0000-000000000001");
    }
}
