//! In-process simulated ECG peripheral.
//!
//! Drives a [`MockTransport`] the way a real sensor would: it re-advertises
//! every 100 ms alongside two unrelated neighbours and, once notifications
//! are enabled, pushes a 50 Hz waveform on the Heart Rate Measurement
//! characteristic and a battery level once per second.

use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use ecglink_core::{
    Advertisement, AttributeId, CharacteristicProperties as P, DeviceAddress, MockPeripheral,
    MockTransport,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Address of the simulated sensor.
pub const SENSOR_ADDRESS: DeviceAddress = DeviceAddress::new(0xC4_7E_0C_00_00_07);

const NEIGHBOUR_ADDRESS: DeviceAddress = DeviceAddress::new(0x5A_11_22_33_44_55);
const ANONYMOUS_ADDRESS: DeviceAddress = DeviceAddress::new(0x7F_00_00_00_A0_01);

/// Heart Rate service.
pub const HEART_RATE_SERVICE: AttributeId = AttributeId::from_short(0x180D);
/// Heart Rate Measurement characteristic, the waveform stream.
pub const HEART_RATE_MEASUREMENT: AttributeId = AttributeId::from_short(0x2A37);
/// Battery service.
pub const BATTERY_SERVICE: AttributeId = AttributeId::from_short(0x180F);
/// Battery Level characteristic.
pub const BATTERY_LEVEL: AttributeId = AttributeId::from_short(0x2A19);

const SAMPLE_PERIOD: Duration = Duration::from_millis(20);
const SAMPLES_PER_ADVERTISEMENT: u64 = 5;
const SAMPLES_PER_BATTERY_REPORT: u64 = 50;

/// GATT database of the simulated sensor.
#[must_use]
pub fn sensor() -> MockPeripheral {
    MockPeripheral::new()
        .with_service(
            HEART_RATE_SERVICE,
            [
                (HEART_RATE_MEASUREMENT, P::NOTIFY),
                (AttributeId::from_short(0x2A38), P::READ),
            ],
        )
        .with_service(BATTERY_SERVICE, [(BATTERY_LEVEL, P::READ | P::NOTIFY)])
        .with_service(
            AttributeId::from_short(0x180A),
            [
                (AttributeId::from_short(0x2A29), P::READ),
                (AttributeId::from_short(0x2A24), P::READ),
            ],
        )
}

/// One waveform sample: sequence number then a signed 16-bit little-endian
/// amplitude, one full cycle per second.
#[must_use]
pub fn waveform_sample(sequence: u64) -> [u8; 3] {
    let phase = (sequence % SAMPLES_PER_BATTERY_REPORT) as f64 / SAMPLES_PER_BATTERY_REPORT as f64;
    let amplitude = ((phase * TAU).sin() * 512.0).round() as i16;
    let [lo, hi] = amplitude.to_le_bytes();
    [(sequence & 0xFF) as u8, lo, hi]
}

/// Running simulation. Dropping it stops the simulated sensor.
pub struct Simulator {
    task: JoinHandle<()>,
}

impl Simulator {
    /// Install the sensor on `transport`, advertising as `name`, and start it.
    pub fn spawn(transport: Arc<MockTransport>, name: &str) -> Self {
        transport.add_peripheral(SENSOR_ADDRESS, sensor());
        transport.add_peripheral(NEIGHBOUR_ADDRESS, MockPeripheral::new());
        let name = name.to_string();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SAMPLE_PERIOD);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!(address = %SENSOR_ADDRESS, %name, "Simulated sensor running");

            let mut sequence = 0u64;
            loop {
                ticker.tick().await;
                if sequence % SAMPLES_PER_ADVERTISEMENT == 0 {
                    transport.advertise(Advertisement::new(SENSOR_ADDRESS, Some(&name), Some(-48)));
                    transport.advertise(Advertisement::new(NEIGHBOUR_ADDRESS, Some("THERMO-1"), Some(-77)));
                    transport.advertise(Advertisement::new(ANONYMOUS_ADDRESS, None, None));
                }
                transport.notify(SENSOR_ADDRESS, HEART_RATE_MEASUREMENT, &waveform_sample(sequence));
                if sequence % SAMPLES_PER_BATTERY_REPORT == 0 {
                    let level = 100 - u8::try_from((sequence / SAMPLES_PER_BATTERY_REPORT) % 100).unwrap_or(0);
                    transport.notify(SENSOR_ADDRESS, BATTERY_LEVEL, &[level]);
                }
                sequence = sequence.wrapping_add(1);
            }
        });

        Self { task }
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecglink_core::{ChannelSink, DiscoverySession, SessionConfig, SessionState};

    #[test]
    fn test_waveform_sample_layout() {
        assert_eq!(waveform_sample(0), [0, 0, 0]);
        let quarter = waveform_sample(SAMPLES_PER_BATTERY_REPORT / 4 + 1);
        assert_eq!(quarter[0], 13);
        assert!(i16::from_le_bytes([quarter[1], quarter[2]]) > 500);
        assert_eq!(waveform_sample(256)[0], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_streams_from_simulator() {
        let transport = Arc::new(MockTransport::new());
        let _simulator = Simulator::spawn(Arc::clone(&transport), "ECG-7");
        let session = DiscoverySession::new(Arc::clone(&transport), SessionConfig::default());
        let (sink, mut events) = ChannelSink::new(64);
        session.on_notification(Arc::new(sink));

        session.start("ECG-7").await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(event.characteristic == HEART_RATE_MEASUREMENT || event.characteristic == BATTERY_LEVEL);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.state(), SessionState::Subscribed);
        assert!(!transport.is_scanning());
        assert_eq!(session.status().subscriptions, vec![HEART_RATE_MEASUREMENT, BATTERY_LEVEL]);

        session.stop().await;
        assert!(!transport.is_connected(SENSOR_ADDRESS));
    }
}
