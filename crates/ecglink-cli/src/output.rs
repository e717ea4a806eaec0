//! Console rendering.

use std::fmt::Write as _;

use ecglink_core::{Advertisement, GattTree, NotificationEvent};
use serde_json::{json, Value};

/// Lowercase, space-separated hex octets: `[0x01, 0xAB]` -> `"01 ab"`.
#[must_use]
pub fn hex_dump(payload: &[u8]) -> String {
    let mut out = String::with_capacity(payload.len() * 3);
    for (i, byte) in payload.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// One scan result: name, address and signal strength.
#[must_use]
pub fn advertisement_line(advertisement: &Advertisement) -> String {
    let name = advertisement.local_name.as_deref().unwrap_or("(unnamed)");
    let rssi = advertisement
        .rssi_dbm
        .map_or_else(|| "n/a".to_string(), |rssi| format!("{rssi} dBm"));
    format!("{name:<24} {}  {rssi}", advertisement.address)
}

/// The discovered GATT tree, one service per block.
#[must_use]
pub fn service_tree(tree: &GattTree) -> String {
    let mut out = String::new();
    for service in &tree.services {
        let _ = writeln!(out, "Service {}", service.uuid);
        for characteristic in &service.characteristics {
            let _ = writeln!(
                out,
                "    Characteristic {}  [{}]",
                characteristic.uuid, characteristic.properties
            );
        }
        if let Some(failure) = tree.failures.iter().find(|f| f.service == service.uuid) {
            let _ = writeln!(out, "    (characteristics unavailable: {})", failure.error);
        }
    }
    out
}

/// Human-readable notification line.
#[must_use]
pub fn notification_line(event: &NotificationEvent) -> String {
    format!(
        "{} {} {}",
        event.received_at.format("%H:%M:%S%.3f"),
        event.characteristic,
        hex_dump(&event.payload)
    )
}

/// Notification as a JSON object for line-delimited output.
#[must_use]
pub fn notification_json(event: &NotificationEvent) -> Value {
    json!({
        "characteristic": event.characteristic,
        "payload": hex_dump(&event.payload),
        "received_at": event.received_at,
    })
}
