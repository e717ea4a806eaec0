//! In-memory transport with scriptable peripherals.
//!
//! Used by the unit tests and by the CLI simulator. Peripherals are described
//! with [`MockPeripheral`], advertisements and notifications are injected by
//! the caller, and every interaction is recorded for later assertions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{
    AdvertisementObserver, BleTransport, ClientConfiguration, ListenerToken, TransportError,
    TransportResult, ValueListener,
};
use crate::types::{
    Advertisement, AttributeId, Characteristic, CharacteristicProperties, DeviceAddress,
    DeviceHandle, ScanMode, Service,
};

#[derive(Debug, Clone)]
struct MockService {
    uuid: AttributeId,
    characteristics: Vec<(AttributeId, CharacteristicProperties)>,
    error: Option<TransportError>,
}

/// Description of a simulated peripheral's GATT database and failure modes.
#[derive(Debug, Clone, Default)]
pub struct MockPeripheral {
    services: Vec<MockService>,
    connect_error: Option<TransportError>,
    services_error: Option<TransportError>,
    rejected_subscriptions: HashSet<AttributeId>,
}

impl MockPeripheral {
    /// A peripheral with no services.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service with the given characteristics, in order.
    #[must_use]
    pub fn with_service(
        mut self,
        uuid: AttributeId,
        characteristics: impl IntoIterator<Item = (AttributeId, CharacteristicProperties)>,
    ) -> Self {
        self.services.push(MockService {
            uuid,
            characteristics: characteristics.into_iter().collect(),
            error: None,
        });
        self
    }

    /// Add a service whose characteristic discovery fails.
    #[must_use]
    pub fn with_failing_service(mut self, uuid: AttributeId, error: TransportError) -> Self {
        self.services.push(MockService {
            uuid,
            characteristics: Vec::new(),
            error: Some(error),
        });
        self
    }

    /// Make every connection attempt fail.
    #[must_use]
    pub fn failing_connect(mut self, error: TransportError) -> Self {
        self.connect_error = Some(error);
        self
    }

    /// Make service enumeration fail.
    #[must_use]
    pub fn failing_service_discovery(mut self, error: TransportError) -> Self {
        self.services_error = Some(error);
        self
    }

    /// Reject the enable-notifications write for `characteristic`.
    #[must_use]
    pub fn rejecting_subscription(mut self, characteristic: AttributeId) -> Self {
        self.rejected_subscriptions.insert(characteristic);
        self
    }

    fn service_handle(index: usize) -> u16 {
        u16::try_from(index + 1).map_or(u16::MAX, |i| i.saturating_mul(0x100))
    }

    fn characteristic_handle(service_handle: u16, index: usize) -> u16 {
        service_handle.saturating_add(u16::try_from(index + 1).unwrap_or(u16::MAX))
    }

    fn find_characteristic(&self, uuid: AttributeId) -> Option<u16> {
        self.services.iter().enumerate().find_map(|(i, service)| {
            let service_handle = Self::service_handle(i);
            service
                .characteristics
                .iter()
                .position(|(c, _)| *c == uuid)
                .map(|j| Self::characteristic_handle(service_handle, j))
        })
    }
}

struct Registration {
    address: DeviceAddress,
    handle: u16,
    listener: Arc<dyn ValueListener>,
}

#[derive(Default)]
struct MockState {
    observer: Option<Arc<dyn AdvertisementObserver>>,
    scan_mode: Option<ScanMode>,
    scan_start_error: Option<TransportError>,
    scan_stop_error: Option<TransportError>,
    peripherals: HashMap<DeviceAddress, MockPeripheral>,
    connections: HashMap<DeviceAddress, u64>,
    connect_attempts: Vec<DeviceAddress>,
    disconnects: Vec<DeviceAddress>,
    aborted_connects: Vec<DeviceAddress>,
    listeners: BTreeMap<ListenerToken, Registration>,
    enabled: Vec<(DeviceAddress, u16, AttributeId)>,
    configuration_writes: Vec<(AttributeId, ClientConfiguration)>,
}

impl MockState {
    fn peripheral_for(&self, device: &DeviceHandle) -> TransportResult<&MockPeripheral> {
        match self.connections.get(&device.address) {
            Some(id) if *id == device.connection_id => self
                .peripherals
                .get(&device.address)
                .ok_or(TransportError::NotConnected(device.address)),
            _ => Err(TransportError::NotConnected(device.address)),
        }
    }
}

/// Scriptable [`BleTransport`].
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    next_id: AtomicU64,
    connect_delay: Mutex<Duration>,
    round_trip_delay: Mutex<Duration>,
}

impl MockTransport {
    /// An empty radio environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peripheral reachable at `address`.
    pub fn add_peripheral(&self, address: DeviceAddress, peripheral: MockPeripheral) {
        self.state.lock().peripherals.insert(address, peripheral);
    }

    /// Make the next scan start fail.
    pub fn fail_scan_start(&self, error: TransportError) {
        self.state.lock().scan_start_error = Some(error);
    }

    /// Make the next scan stop report `error`. The scan still ends.
    pub fn fail_scan_stop(&self, error: TransportError) {
        self.state.lock().scan_stop_error = Some(error);
    }

    /// Delay every connect by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    /// Delay every discovery and descriptor round trip by `delay`.
    pub fn set_round_trip_delay(&self, delay: Duration) {
        *self.round_trip_delay.lock() = delay;
    }

    /// Deliver an advertisement to the observer if a scan is running.
    ///
    /// Returns `true` if it was delivered.
    pub fn advertise(&self, advertisement: Advertisement) -> bool {
        let observer = self.state.lock().observer.clone();
        match observer {
            Some(observer) => {
                observer.on_advertisement(advertisement);
                true
            }
            None => false,
        }
    }

    /// Push a value change for `characteristic` on `address`.
    ///
    /// Only delivered while connected and after notifications were enabled on
    /// the peripheral. Returns the number of listeners invoked.
    pub fn notify(&self, address: DeviceAddress, characteristic: AttributeId, payload: &[u8]) -> usize {
        let listeners: Vec<Arc<dyn ValueListener>> = {
            let state = self.state.lock();
            let enabled = state
                .enabled
                .iter()
                .any(|(a, _, c)| *a == address && *c == characteristic);
            let handle = state
                .peripherals
                .get(&address)
                .and_then(|p| p.find_characteristic(characteristic));
            match (enabled, handle) {
                (true, Some(handle)) if state.connections.contains_key(&address) => state
                    .listeners
                    .values()
                    .filter(|r| r.address == address && r.handle == handle)
                    .map(|r| Arc::clone(&r.listener))
                    .collect(),
                _ => Vec::new(),
            }
        };

        for listener in &listeners {
            listener.on_value_changed(payload);
        }
        listeners.len()
    }

    /// Addresses passed to `connect`, in call order.
    #[must_use]
    pub fn connect_attempts(&self) -> Vec<DeviceAddress> {
        self.state.lock().connect_attempts.clone()
    }

    /// Addresses passed to `disconnect`, in call order.
    #[must_use]
    pub fn disconnects(&self) -> Vec<DeviceAddress> {
        self.state.lock().disconnects.clone()
    }

    /// Addresses passed to `abort_connect`, in call order.
    #[must_use]
    pub fn aborted_connects(&self) -> Vec<DeviceAddress> {
        self.state.lock().aborted_connects.clone()
    }

    /// Characteristics with notifications currently enabled on the peripheral.
    #[must_use]
    pub fn enabled_characteristics(&self) -> Vec<AttributeId> {
        self.state.lock().enabled.iter().map(|(_, _, c)| *c).collect()
    }

    /// Every descriptor write, in order.
    #[must_use]
    pub fn configuration_writes(&self) -> Vec<(AttributeId, ClientConfiguration)> {
        self.state.lock().configuration_writes.clone()
    }

    /// Number of registered value listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// `true` while a scan is running.
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.state.lock().observer.is_some()
    }

    /// Mode of the running scan.
    #[must_use]
    pub fn scan_mode(&self) -> Option<ScanMode> {
        self.state.lock().scan_mode
    }

    /// `true` while connected to `address`.
    #[must_use]
    pub fn is_connected(&self, address: DeviceAddress) -> bool {
        self.state.lock().connections.contains_key(&address)
    }

    async fn round_trip(&self) {
        let delay = *self.round_trip_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn start_scan(
        &self,
        mode: ScanMode,
        observer: Arc<dyn AdvertisementObserver>,
    ) -> TransportResult<()> {
        let mut state = self.state.lock();
        if let Some(error) = state.scan_start_error.take() {
            return Err(error);
        }
        state.observer = Some(observer);
        state.scan_mode = Some(mode);
        Ok(())
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.observer = None;
        state.scan_mode = None;
        state.scan_stop_error.take().map_or(Ok(()), Err)
    }

    async fn connect(&self, address: DeviceAddress) -> TransportResult<DeviceHandle> {
        self.state.lock().connect_attempts.push(address);

        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let peripheral = state
            .peripherals
            .get(&address)
            .ok_or_else(|| TransportError::Other(format!("no device at {address}")))?;
        if let Some(error) = &peripheral.connect_error {
            return Err(error.clone());
        }

        let connection_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        state.connections.insert(address, connection_id);
        trace!(%address, connection_id, "mock connected");
        Ok(DeviceHandle {
            address,
            connection_id,
        })
    }

    async fn disconnect(&self, device: &DeviceHandle) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.disconnects.push(device.address);
        if state.connections.get(&device.address) == Some(&device.connection_id) {
            state.connections.remove(&device.address);
            state.enabled.retain(|(a, _, _)| *a != device.address);
        }
        Ok(())
    }

    async fn abort_connect(&self, address: DeviceAddress) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.aborted_connects.push(address);
        if state.connections.remove(&address).is_some() {
            state.enabled.retain(|(a, _, _)| *a != address);
        }
        Ok(())
    }

    async fn services(&self, device: &DeviceHandle) -> TransportResult<Vec<Service>> {
        self.round_trip().await;
        let state = self.state.lock();
        let peripheral = state.peripheral_for(device)?;
        if let Some(error) = &peripheral.services_error {
            return Err(error.clone());
        }
        Ok(peripheral
            .services
            .iter()
            .enumerate()
            .map(|(i, s)| Service {
                uuid: s.uuid,
                handle: MockPeripheral::service_handle(i),
                characteristics: Vec::new(),
            })
            .collect())
    }

    async fn characteristics(
        &self,
        device: &DeviceHandle,
        service: &Service,
    ) -> TransportResult<Vec<Characteristic>> {
        self.round_trip().await;
        let state = self.state.lock();
        let peripheral = state.peripheral_for(device)?;
        let (index, mock) = peripheral
            .services
            .iter()
            .enumerate()
            .find(|(i, _)| MockPeripheral::service_handle(*i) == service.handle)
            .ok_or_else(|| TransportError::Rejected(format!("unknown service {}", service.uuid)))?;
        if let Some(error) = &mock.error {
            return Err(error.clone());
        }

        let service_handle = MockPeripheral::service_handle(index);
        Ok(mock
            .characteristics
            .iter()
            .enumerate()
            .map(|(j, (uuid, properties))| Characteristic {
                uuid: *uuid,
                properties: *properties,
                service: mock.uuid,
                service_handle,
                handle: MockPeripheral::characteristic_handle(service_handle, j),
            })
            .collect())
    }

    async fn write_client_configuration(
        &self,
        device: &DeviceHandle,
        characteristic: &Characteristic,
        value: ClientConfiguration,
    ) -> TransportResult<()> {
        self.round_trip().await;
        let mut state = self.state.lock();
        let rejected = state
            .peripheral_for(device)?
            .rejected_subscriptions
            .contains(&characteristic.uuid);
        if rejected && value == ClientConfiguration::Notify {
            return Err(TransportError::Rejected("write not permitted".into()));
        }

        state.configuration_writes.push((characteristic.uuid, value));
        state
            .enabled
            .retain(|(a, h, _)| !(*a == device.address && *h == characteristic.handle));
        if value == ClientConfiguration::Notify {
            state
                .enabled
                .push((device.address, characteristic.handle, characteristic.uuid));
        }
        Ok(())
    }

    fn register_value_listener(
        &self,
        device: &DeviceHandle,
        characteristic: &Characteristic,
        listener: Arc<dyn ValueListener>,
    ) -> TransportResult<ListenerToken> {
        let token = ListenerToken(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.state.lock().listeners.insert(
            token,
            Registration {
                address: device.address,
                handle: characteristic.handle,
                listener,
            },
        );
        Ok(token)
    }

    fn unregister_value_listener(&self, token: ListenerToken) {
        self.state.lock().listeners.remove(&token);
    }
}
