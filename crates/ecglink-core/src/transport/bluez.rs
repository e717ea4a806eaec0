//! BlueZ backend.
//!
//! Talks to `bluetoothd` over D-Bus through `bluer`. Discovery runs as a
//! background task that turns adapter events into [`Advertisement`]s, and
//! each enabled notification gets its own forwarding task. Dropping a
//! `bluer` notify stream stops notifications on the peripheral, so disabling
//! a subscription is implemented by aborting its task.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::CharacteristicFlags;
use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session};
use futures::{pin_mut, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{
    AdvertisementObserver, BleTransport, ClientConfiguration, ListenerToken, TransportError,
    TransportResult, ValueListener,
};
use crate::types::{
    Advertisement, Characteristic, CharacteristicProperties, DeviceAddress, DeviceHandle,
    ScanMode, Service,
};

/// Interval between checks of the `ServicesResolved` property.
const SERVICES_RESOLVED_POLL: Duration = Duration::from_millis(50);

type CharacteristicKey = (DeviceAddress, u16, u16);

struct Registration {
    key: CharacteristicKey,
    listener: Arc<dyn ValueListener>,
}

/// [`BleTransport`] backed by the system's default BlueZ adapter.
pub struct BluezTransport {
    _session: Session,
    adapter: Adapter,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    listeners: Arc<Mutex<BTreeMap<ListenerToken, Registration>>>,
    notify_tasks: Mutex<HashMap<CharacteristicKey, JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl BluezTransport {
    /// Open a D-Bus session and bind to the default adapter.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Unavailable`] if `bluetoothd` is not
    /// reachable, there is no adapter, or the adapter is powered off.
    pub async fn new() -> TransportResult<Self> {
        let session = Session::new().await.map_err(map_error)?;
        let adapter = session.default_adapter().await.map_err(map_error)?;
        if !adapter.is_powered().await.map_err(map_error)? {
            return Err(TransportError::Unavailable(format!(
                "adapter {} is powered off. Run 'bluetoothctl power on' to enable.",
                adapter.name()
            )));
        }
        info!(adapter = adapter.name(), "Using Bluetooth adapter");

        Ok(Self {
            _session: session,
            adapter,
            scan_task: Mutex::new(None),
            listeners: Arc::new(Mutex::new(BTreeMap::new())),
            notify_tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn device(&self, address: DeviceAddress) -> TransportResult<bluer::Device> {
        self.adapter
            .device(Address(address.octets()))
            .map_err(map_error)
    }

    async fn remote_characteristic(
        &self,
        device: &DeviceHandle,
        characteristic: &Characteristic,
    ) -> TransportResult<bluer::gatt::remote::Characteristic> {
        let service = self
            .device(device.address)?
            .service(characteristic.service_handle)
            .await
            .map_err(map_error)?;
        service
            .characteristic(characteristic.handle)
            .await
            .map_err(map_error)
    }

    fn abort_notify_tasks(&self, address: DeviceAddress) {
        self.notify_tasks.lock().retain(|key, task| {
            if key.0 == address {
                task.abort();
                false
            } else {
                true
            }
        });
    }
}

impl Drop for BluezTransport {
    fn drop(&mut self) {
        if let Some(task) = self.scan_task.lock().take() {
            task.abort();
        }
        for (_, task) in self.notify_tasks.lock().drain() {
            task.abort();
        }
    }
}

#[async_trait]
impl BleTransport for BluezTransport {
    async fn start_scan(
        &self,
        mode: ScanMode,
        observer: Arc<dyn AdvertisementObserver>,
    ) -> TransportResult<()> {
        if mode == ScanMode::Passive {
            warn!("BlueZ discovery is always active; ignoring passive scan mode");
        }

        let mut filter = DiscoveryFilter::default();
        filter.transport = DiscoveryTransport::Le;
        filter.duplicate_data = true;
        self.adapter
            .set_discovery_filter(filter)
            .await
            .map_err(map_error)?;

        let events = self
            .adapter
            .discover_devices_with_changes()
            .await
            .map_err(map_error)?;
        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            pin_mut!(events);
            while let Some(event) = events.next().await {
                if let AdapterEvent::DeviceAdded(address) = event {
                    match advertisement_for(&adapter, address).await {
                        Ok(advertisement) => observer.on_advertisement(advertisement),
                        Err(err) => trace!(%address, error = %err, "Skipping device"),
                    }
                }
            }
            debug!("Discovery event stream ended");
        });

        if let Some(previous) = self.scan_task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        if let Some(task) = self.scan_task.lock().take() {
            task.abort();
        }
        Ok(())
    }

    async fn connect(&self, address: DeviceAddress) -> TransportResult<DeviceHandle> {
        let device = self.device(address)?;
        if !device.is_connected().await.map_err(map_error)? {
            device.connect().await.map_err(map_error)?;
        }
        Ok(DeviceHandle {
            address,
            connection_id: self.next_id.fetch_add(1, Ordering::Relaxed),
        })
    }

    async fn disconnect(&self, device: &DeviceHandle) -> TransportResult<()> {
        self.abort_notify_tasks(device.address);
        let remote = self.device(device.address)?;
        if remote.is_connected().await.map_err(map_error)? {
            remote.disconnect().await.map_err(map_error)?;
        }
        Ok(())
    }

    async fn abort_connect(&self, address: DeviceAddress) -> TransportResult<()> {
        self.abort_notify_tasks(address);
        let remote = self.device(address)?;
        // Disconnect also cancels a connection bluetoothd is still setting up.
        if let Err(err) = remote.disconnect().await {
            if remote.is_connected().await.map_err(map_error)? {
                return Err(map_error(err));
            }
            trace!(%address, error = %err, "No connection to abort");
        }
        Ok(())
    }

    async fn services(&self, device: &DeviceHandle) -> TransportResult<Vec<Service>> {
        let remote = self.device(device.address)?;
        while !remote.is_services_resolved().await.map_err(map_error)? {
            if !remote.is_connected().await.map_err(map_error)? {
                return Err(TransportError::NotConnected(device.address));
            }
            tokio::time::sleep(SERVICES_RESOLVED_POLL).await;
        }

        let mut services = Vec::new();
        for service in remote.services().await.map_err(map_error)? {
            services.push(Service {
                uuid: service.uuid().await.map_err(map_error)?.into(),
                handle: service.id(),
                characteristics: Vec::new(),
            });
        }
        Ok(services)
    }

    async fn characteristics(
        &self,
        device: &DeviceHandle,
        service: &Service,
    ) -> TransportResult<Vec<Characteristic>> {
        let remote = self
            .device(device.address)?
            .service(service.handle)
            .await
            .map_err(map_error)?;

        let mut characteristics = Vec::new();
        for characteristic in remote.characteristics().await.map_err(map_error)? {
            let flags = characteristic.flags().await.map_err(map_error)?;
            characteristics.push(Characteristic {
                uuid: characteristic.uuid().await.map_err(map_error)?.into(),
                properties: properties_from(&flags),
                service: service.uuid,
                service_handle: service.handle,
                handle: characteristic.id(),
            });
        }
        Ok(characteristics)
    }

    async fn write_client_configuration(
        &self,
        device: &DeviceHandle,
        characteristic: &Characteristic,
        value: ClientConfiguration,
    ) -> TransportResult<()> {
        let key = (device.address, characteristic.service_handle, characteristic.handle);
        match value {
            ClientConfiguration::Disabled => {
                if let Some(task) = self.notify_tasks.lock().remove(&key) {
                    task.abort();
                }
                Ok(())
            }
            ClientConfiguration::Notify => {
                let remote = self.remote_characteristic(device, characteristic).await?;
                let values = remote.notify().await.map_err(map_error)?;
                let listeners = Arc::clone(&self.listeners);
                let task = tokio::spawn(async move {
                    pin_mut!(values);
                    while let Some(value) = values.next().await {
                        let targets: Vec<Arc<dyn ValueListener>> = listeners
                            .lock()
                            .values()
                            .filter(|r| r.key == key)
                            .map(|r| Arc::clone(&r.listener))
                            .collect();
                        for listener in targets {
                            listener.on_value_changed(&value);
                        }
                    }
                    debug!(address = %key.0, handle = key.2, "Notification stream ended");
                });
                if let Some(previous) = self.notify_tasks.lock().insert(key, task) {
                    previous.abort();
                }
                Ok(())
            }
        }
    }

    fn register_value_listener(
        &self,
        device: &DeviceHandle,
        characteristic: &Characteristic,
        listener: Arc<dyn ValueListener>,
    ) -> TransportResult<ListenerToken> {
        let token = ListenerToken(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().insert(
            token,
            Registration {
                key: (device.address, characteristic.service_handle, characteristic.handle),
                listener,
            },
        );
        Ok(token)
    }

    fn unregister_value_listener(&self, token: ListenerToken) {
        self.listeners.lock().remove(&token);
    }
}

async fn advertisement_for(adapter: &Adapter, address: Address) -> bluer::Result<Advertisement> {
    let device = adapter.device(address)?;
    Ok(Advertisement {
        address: DeviceAddress::from_octets(address.0),
        local_name: device.name().await?,
        rssi_dbm: device.rssi().await?,
    })
}

fn properties_from(flags: &CharacteristicFlags) -> CharacteristicProperties {
    [
        (flags.broadcast, CharacteristicProperties::BROADCAST),
        (flags.read, CharacteristicProperties::READ),
        (
            flags.write_without_response,
            CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
        ),
        (flags.write, CharacteristicProperties::WRITE),
        (flags.notify, CharacteristicProperties::NOTIFY),
        (flags.indicate, CharacteristicProperties::INDICATE),
        (
            flags.authenticated_signed_writes,
            CharacteristicProperties::AUTHENTICATED_SIGNED_WRITES,
        ),
        (
            flags.extended_properties,
            CharacteristicProperties::EXTENDED_PROPERTIES,
        ),
    ]
    .into_iter()
    .filter(|(set, _)| *set)
    .fold(CharacteristicProperties::NONE, |acc, (_, flag)| acc | flag)
}

fn map_error(err: bluer::Error) -> TransportError {
    match err.kind {
        bluer::ErrorKind::NotAuthorized | bluer::ErrorKind::NotPermitted => {
            TransportError::PermissionDenied(err.message)
        }
        bluer::ErrorKind::NotReady => TransportError::Unavailable(err.message),
        bluer::ErrorKind::Failed => TransportError::Rejected(err.message),
        _ => TransportError::Other(err.to_string()),
    }
}
