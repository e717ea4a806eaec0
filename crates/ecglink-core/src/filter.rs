//! Advertisement matching.
//!
//! The filter is the only gate that can trigger a connection attempt, and it
//! runs for every advertisement, including repeated broadcasts from the same
//! peripheral.

use crate::types::{Advertisement, DeviceAddress};

/// `true` iff the advertisement carries a local name exactly equal to
/// `target_name` (case-sensitive). An absent name never matches.
#[must_use]
pub fn matches(advertisement: &Advertisement, target_name: &str) -> bool {
    advertisement.local_name.as_deref() == Some(target_name)
}

/// Target selection: a local name, optionally pinned to one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementFilter {
    name: String,
    address: Option<DeviceAddress>,
}

impl AdvertisementFilter {
    /// Match on local name only.
    #[must_use]
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: None,
        }
    }

    /// Additionally require the advertiser address.
    #[must_use]
    pub const fn with_address(mut self, address: DeviceAddress) -> Self {
        self.address = Some(address);
        self
    }

    /// Target name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pinned address, if any.
    #[must_use]
    pub const fn address(&self) -> Option<DeviceAddress> {
        self.address
    }

    /// Apply the filter.
    #[must_use]
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        matches(advertisement, &self.name)
            && self.address.map_or(true, |a| a == advertisement.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adv(name: Option<&str>) -> Advertisement {
        Advertisement::new(DeviceAddress::new(0x0011_2233_4455), name, Some(-60))
    }

    #[test]
    fn test_exact_name_matches() {
        assert!(matches(&adv(Some("ECG-7")), "ECG-7"));
    }

    #[test]
    fn test_absent_or_other_names_do_not_match() {
        assert!(!matches(&adv(None), "ECG-7"));
        assert!(!matches(&adv(Some("")), "ECG-7"));
        assert!(!matches(&adv(Some("ecg-7")), "ECG-7"));
        assert!(!matches(&adv(Some("ECG-7 ")), "ECG-7"));
        assert!(!matches(&adv(Some("ECG-70")), "ECG-7"));
        assert!(!matches(&adv(Some("Other")), "ECG-7"));
    }

    #[test]
    fn test_address_pinning() {
        let filter = AdvertisementFilter::by_name("ECG-7")
            .with_address(DeviceAddress::new(0x0011_2233_4455));
        assert!(filter.matches(&adv(Some("ECG-7"))));

        let elsewhere = Advertisement::new(DeviceAddress::new(0x1), Some("ECG-7"), None);
        assert!(!filter.matches(&elsewhere));
        assert!(AdvertisementFilter::by_name("ECG-7").matches(&elsewhere));
    }
}
