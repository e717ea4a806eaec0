//! Tests against the public, radio-independent API.

use ecglink_core::{
    filter, format_address, format_attribute_id, parse_address, Advertisement,
    AdvertisementFilter, AttributeId, CharacteristicProperties, Config, DeviceAddress,
    LinkError, SessionState,
};

#[test]
fn address_text_round_trips() {
    for value in [0u64, 1, 0x0011_2233_4455, 0xFFFF_FFFF_FFFF, 0xA1B2_C3D4_E5F6] {
        let text = format_address(value);
        assert_eq!(text.len(), 17);
        assert_eq!(parse_address(&text).unwrap().as_u64(), value);
    }
}

#[test]
fn address_ignores_bits_above_48() {
    assert_eq!(format_address(0xFFFF_0011_2233_4455), "00:11:22:33:44:55");
}

#[test]
fn attribute_id_shape() {
    let text = format_attribute_id(AttributeId::from_short(0x2A37).as_u128());
    assert_eq!(text, "00002A37-0000-1000-8000-00805F9B34FB");
    let groups: Vec<usize> = text.split('-').map(str::len).collect();
    assert_eq!(groups, vec![8, 4, 4, 4, 12]);
}

#[test]
fn filter_truth_table() {
    let address = DeviceAddress::new(0x0011_2233_4455);
    let cases = [
        (Some("ECG-7"), true),
        (Some("ecg-7"), false),
        (Some(""), false),
        (Some("ECG-70"), false),
        (None, false),
    ];
    for (name, expected) in cases {
        let advertisement = Advertisement::new(address, name, None);
        assert_eq!(filter::matches(&advertisement, "ECG-7"), expected, "{name:?}");
    }

    let pinned = AdvertisementFilter::by_name("ECG-7").with_address(address);
    assert!(pinned.matches(&Advertisement::new(address, Some("ECG-7"), None)));
    assert!(!pinned.matches(&Advertisement::new(DeviceAddress::new(1), Some("ECG-7"), None)));
}

#[test]
fn notify_gating_follows_properties() {
    assert!(!CharacteristicProperties::READ.can_notify());
    assert!((CharacteristicProperties::READ | CharacteristicProperties::NOTIFY).can_notify());
    assert!(!CharacteristicProperties::INDICATE.can_notify());
}

#[test]
fn default_config_targets_ecg7() {
    let config = Config::default();
    assert_eq!(config.target.name, "ECG-7");
    assert!(config.validate().is_ok());
    assert_eq!(SessionState::default(), SessionState::Idle);
}

#[test]
fn config_errors_convert_into_link_error() {
    let mut config = Config::default();
    config.target.name.clear();
    let err: LinkError = config.validate().unwrap_err().into();
    assert_eq!(err.error_code(), "CONFIG_ERROR");
}
