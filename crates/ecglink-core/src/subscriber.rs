//! Enabling and disabling characteristic notifications.
//!
//! The listener for a characteristic is always registered before the
//! enable-notifications descriptor is written, so a value sent right after
//! the peripheral accepts the write is not lost. If the write fails the
//! listener stays registered but disarmed; it is removed on
//! [`disable_all`](NotificationSubscriber::disable_all).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use crate::gatt::{bounded, GattError};
use crate::sink::NotificationSink;
use crate::transport::{BleTransport, ClientConfiguration, ListenerToken, ValueListener};
use crate::types::{AttributeId, Characteristic, DeviceHandle, NotificationEvent};

/// An enabled notification subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    /// Connection the subscription belongs to.
    pub device: DeviceHandle,
    /// Subscribed characteristic.
    pub characteristic: AttributeId,
    /// Service containing the characteristic.
    pub service: AttributeId,
    token: ListenerToken,
}

/// Bridges transport value changes into [`NotificationEvent`]s.
struct Forwarder {
    characteristic: AttributeId,
    armed: AtomicBool,
    sink: Arc<dyn NotificationSink>,
}

impl Forwarder {
    fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }
}

impl ValueListener for Forwarder {
    fn on_value_changed(&self, value: &[u8]) {
        if !self.armed.load(Ordering::Acquire) {
            trace!(characteristic = %self.characteristic, "Ignoring value on disarmed listener");
            return;
        }
        let event = NotificationEvent {
            characteristic: self.characteristic,
            payload: value.to_vec(),
            received_at: Utc::now(),
        };
        trace!(characteristic = %event.characteristic, len = value.len(), "Notification");
        self.sink.deliver(&event);
    }
}

struct Active {
    handle: SubscriptionHandle,
    characteristic: Characteristic,
    forwarder: Arc<Forwarder>,
}

#[derive(Default)]
struct Subscriptions {
    active: HashMap<(DeviceHandle, u16), Active>,
    /// Registered listeners whose descriptor write has not finished.
    pending: HashMap<ListenerToken, Arc<Forwarder>>,
    inert: Vec<(ListenerToken, Arc<Forwarder>)>,
}

/// Manages notification subscriptions for one session.
pub struct NotificationSubscriber<T: BleTransport> {
    transport: Arc<T>,
    sink: Arc<dyn NotificationSink>,
    timeout: Duration,
    subscriptions: Mutex<Subscriptions>,
}

impl<T: BleTransport> NotificationSubscriber<T> {
    /// Create a subscriber delivering to `sink`, bounding each descriptor
    /// write by `timeout`.
    pub fn new(transport: Arc<T>, sink: Arc<dyn NotificationSink>, timeout: Duration) -> Self {
        Self {
            transport,
            sink,
            timeout,
            subscriptions: Mutex::new(Subscriptions::default()),
        }
    }

    /// Enable notifications on `characteristic`.
    ///
    /// Enabling an already enabled characteristic returns the existing handle
    /// without touching the peripheral.
    ///
    /// # Errors
    ///
    /// - [`GattError::NotSupported`] if the characteristic lacks Notify. No
    ///   listener is registered in that case.
    /// - [`GattError::SubscriptionFailed`] if the listener cannot be
    ///   registered or the peripheral rejects the write.
    /// - [`GattError::Timeout`] if the write does not complete in time.
    #[instrument(skip_all, fields(characteristic = %characteristic.uuid))]
    pub async fn enable(
        &self,
        device: &DeviceHandle,
        characteristic: &Characteristic,
    ) -> Result<SubscriptionHandle, GattError> {
        if !characteristic.properties.can_notify() {
            return Err(GattError::NotSupported(characteristic.uuid));
        }
        if let Some(existing) = self
            .subscriptions
            .lock()
            .active
            .get(&(*device, characteristic.handle))
        {
            return Ok(existing.handle);
        }

        let forwarder = Arc::new(Forwarder {
            characteristic: characteristic.uuid,
            armed: AtomicBool::new(true),
            sink: Arc::clone(&self.sink),
        });
        let token = self
            .transport
            .register_value_listener(device, characteristic, Arc::clone(&forwarder) as Arc<dyn ValueListener>)
            .map_err(|e| GattError::SubscriptionFailed {
                characteristic: characteristic.uuid,
                reason: e.to_string(),
            })?;
        self.subscriptions
            .lock()
            .pending
            .insert(token, Arc::clone(&forwarder));

        let written = bounded("enable notifications", self.timeout, async {
            self.transport
                .write_client_configuration(device, characteristic, ClientConfiguration::Notify)
                .await
                .map_err(|e| GattError::SubscriptionFailed {
                    characteristic: characteristic.uuid,
                    reason: e.to_string(),
                })
        })
        .await;

        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.pending.remove(&token).is_none() {
            // Released by disable_all while the write was in flight.
            return Err(GattError::SubscriptionFailed {
                characteristic: characteristic.uuid,
                reason: "subscriptions released during enable".into(),
            });
        }
        if let Err(error) = written {
            forwarder.disarm();
            subscriptions.inert.push((token, forwarder));
            return Err(error);
        }

        let handle = SubscriptionHandle {
            device: *device,
            characteristic: characteristic.uuid,
            service: characteristic.service,
            token,
        };
        subscriptions.active.insert(
            (*device, characteristic.handle),
            Active {
                handle,
                characteristic: characteristic.clone(),
                forwarder,
            },
        );
        info!(characteristic = %characteristic.uuid, "Notifications enabled");
        Ok(handle)
    }

    /// Disable one subscription. Unknown or already disabled handles succeed.
    ///
    /// The listener is disarmed and unregistered even if the peripheral
    /// does not acknowledge the descriptor write.
    ///
    /// # Errors
    ///
    /// Returns the descriptor write failure, after local cleanup.
    pub async fn disable(&self, handle: &SubscriptionHandle) -> Result<(), GattError> {
        let entry = {
            let mut subscriptions = self.subscriptions.lock();
            let key = subscriptions
                .active
                .iter()
                .find(|(_, a)| a.handle == *handle)
                .map(|(k, _)| *k);
            key.and_then(|k| subscriptions.active.remove(&k))
        };
        match entry {
            Some(entry) => self.teardown(entry).await,
            None => Ok(()),
        }
    }

    /// Disable every subscription and drop listeners left by failed or
    /// interrupted enables.
    pub async fn disable_all(&self) {
        let (active, inert) = {
            let mut subscriptions = self.subscriptions.lock();
            let active: Vec<Active> = subscriptions.active.drain().map(|(_, a)| a).collect();
            let mut inert = std::mem::take(&mut subscriptions.inert);
            inert.extend(subscriptions.pending.drain());
            (active, inert)
        };

        for entry in active {
            let characteristic = entry.handle.characteristic;
            if let Err(error) = self.teardown(entry).await {
                warn!(%characteristic, %error, "Failed to disable notifications");
            }
        }
        for (token, forwarder) in inert {
            forwarder.disarm();
            self.transport.unregister_value_listener(token);
        }
        debug!("All subscriptions released");
    }

    /// Currently enabled subscriptions.
    #[must_use]
    pub fn active(&self) -> Vec<SubscriptionHandle> {
        self.subscriptions
            .lock()
            .active
            .values()
            .map(|a| a.handle)
            .collect()
    }

    async fn teardown(&self, entry: Active) -> Result<(), GattError> {
        entry.forwarder.disarm();
        let written = bounded("disable notifications", self.timeout, async {
            self.transport
                .write_client_configuration(
                    &entry.handle.device,
                    &entry.characteristic,
                    ClientConfiguration::Disabled,
                )
                .await
                .map_err(|e| GattError::CommunicationFailed {
                    subject: format!("characteristic {}", entry.handle.characteristic),
                    reason: e.to_string(),
                })
        })
        .await;
        self.transport.unregister_value_listener(entry.handle.token);
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::ChannelSink;
    use crate::transport::mock::{MockPeripheral, MockTransport};
    use crate::types::{CharacteristicProperties as P, DeviceAddress};
    use tokio::sync::mpsc;

    const ADDRESS: DeviceAddress = DeviceAddress::new(0x0011_2233_4455);

    fn id(short: u16) -> AttributeId {
        AttributeId::from_short(short)
    }

    struct Fixture {
        transport: Arc<MockTransport>,
        device: DeviceHandle,
        characteristics: Vec<Characteristic>,
        subscriber: Arc<NotificationSubscriber<MockTransport>>,
        events: mpsc::Receiver<NotificationEvent>,
    }

    async fn fixture(peripheral: MockPeripheral) -> Fixture {
        let transport = Arc::new(MockTransport::new());
        transport.add_peripheral(ADDRESS, peripheral);
        let device = transport.connect(ADDRESS).await.unwrap();
        let mut characteristics = Vec::new();
        for service in transport.services(&device).await.unwrap() {
            characteristics.extend(transport.characteristics(&device, &service).await.unwrap());
        }
        let (sink, events) = ChannelSink::new(16);
        let subscriber = Arc::new(NotificationSubscriber::new(
            Arc::clone(&transport),
            Arc::new(sink),
            Duration::from_secs(1),
        ));
        Fixture {
            transport,
            device,
            characteristics,
            subscriber,
            events,
        }
    }

    fn ecg() -> MockPeripheral {
        MockPeripheral::new().with_service(
            id(0x180D),
            [(id(0x2A37), P::NOTIFY), (id(0x2A38), P::READ)],
        )
    }

    #[tokio::test]
    async fn test_read_only_characteristic_is_not_supported() {
        let f = fixture(ecg()).await;
        let err = f
            .subscriber
            .enable(&f.device, &f.characteristics[1])
            .await
            .unwrap_err();

        assert_eq!(err, GattError::NotSupported(id(0x2A38)));
        assert_eq!(f.transport.listener_count(), 0);
        assert!(f.transport.configuration_writes().is_empty());
    }

    #[tokio::test]
    async fn test_enabled_characteristic_delivers_in_order() {
        let mut f = fixture(ecg()).await;
        let handle = f.subscriber.enable(&f.device, &f.characteristics[0]).await.unwrap();
        assert_eq!(handle.characteristic, id(0x2A37));
        assert_eq!(handle.service, id(0x180D));

        assert_eq!(f.transport.notify(ADDRESS, id(0x2A37), &[0x01]), 1);
        assert_eq!(f.transport.notify(ADDRESS, id(0x2A37), &[0x02]), 1);
        assert_eq!(f.events.recv().await.unwrap().payload, vec![0x01]);
        assert_eq!(f.events.recv().await.unwrap().payload, vec![0x02]);
    }

    #[tokio::test]
    async fn test_enable_is_monotonic() {
        let f = fixture(ecg()).await;
        let first = f.subscriber.enable(&f.device, &f.characteristics[0]).await.unwrap();
        let second = f.subscriber.enable(&f.device, &f.characteristics[0]).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(f.transport.configuration_writes().len(), 1);
        assert_eq!(f.transport.listener_count(), 1);
        assert_eq!(f.subscriber.active().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_registered_before_descriptor_write() {
        let f = fixture(ecg()).await;
        f.transport.set_round_trip_delay(Duration::from_millis(50));

        let subscriber = Arc::clone(&f.subscriber);
        let device = f.device;
        let characteristic = f.characteristics[0].clone();
        let task = tokio::spawn(async move { subscriber.enable(&device, &characteristic).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.transport.listener_count(), 1);
        assert!(f.transport.configuration_writes().is_empty());

        task.await.unwrap().unwrap();
        assert_eq!(f.transport.configuration_writes().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_write_leaves_inert_listener() {
        let mut f = fixture(ecg().rejecting_subscription(id(0x2A37))).await;
        let err = f
            .subscriber
            .enable(&f.device, &f.characteristics[0])
            .await
            .unwrap_err();

        assert!(matches!(err, GattError::SubscriptionFailed { characteristic, .. } if characteristic == id(0x2A37)));
        assert!(f.subscriber.active().is_empty());
        assert_eq!(f.transport.listener_count(), 1);
        f.transport.notify(ADDRESS, id(0x2A37), &[0xFF]);
        assert!(f.events.try_recv().is_err());

        f.subscriber.disable_all().await;
        assert_eq!(f.transport.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_enable_is_released() {
        let mut f = fixture(ecg()).await;
        f.transport.set_round_trip_delay(Duration::from_millis(100));

        let interrupted = tokio::time::timeout(
            Duration::from_millis(10),
            f.subscriber.enable(&f.device, &f.characteristics[0]),
        )
        .await;
        assert!(interrupted.is_err());
        assert_eq!(f.transport.listener_count(), 1);
        assert!(f.subscriber.active().is_empty());

        f.subscriber.disable_all().await;
        assert_eq!(f.transport.listener_count(), 0);

        f.transport.set_round_trip_delay(Duration::ZERO);
        f.subscriber.enable(&f.device, &f.characteristics[0]).await.unwrap();
        assert_eq!(f.transport.notify(ADDRESS, id(0x2A37), &[0x01]), 1);
        assert_eq!(f.events.recv().await.unwrap().payload, vec![0x01]);
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disable_is_idempotent_and_silences_listener() {
        let mut f = fixture(ecg()).await;
        let handle = f.subscriber.enable(&f.device, &f.characteristics[0]).await.unwrap();

        f.subscriber.disable(&handle).await.unwrap();
        f.subscriber.disable(&handle).await.unwrap();

        assert_eq!(
            f.transport.configuration_writes(),
            vec![
                (id(0x2A37), ClientConfiguration::Notify),
                (id(0x2A37), ClientConfiguration::Disabled),
            ]
        );
        assert_eq!(f.transport.listener_count(), 0);
        assert_eq!(f.transport.notify(ADDRESS, id(0x2A37), &[0x01]), 0);
        assert!(f.events.try_recv().is_err());
    }
}
