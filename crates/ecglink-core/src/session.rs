//! Discovery session.
//!
//! [`DiscoverySession`] drives the whole client:
//!
//! ```text
//! Idle -> Scanning -> Connecting -> Discovering -> Subscribed -> Stopped
//!                         |              |
//!                         +--> Error <---+
//! ```
//!
//! A single worker task consumes advertisements, so matches are handled one
//! at a time. The active device lives in a [`Link`] slot that must be claimed
//! before connecting; a second claim fails with [`LinkError::SessionBusy`],
//! which is how duplicate advertisements are ignored once a connection is
//! underway. Stopping is signalled through a [`StopSignal`] that every
//! suspension point of the worker selects on.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{ConnectFailurePolicy, DeliveryMode, SessionConfig};
use crate::error::{LinkError, Result};
use crate::filter::AdvertisementFilter;
use crate::gatt::GattExplorer;
use crate::scanner::{AdvertisementChannel, Scanner};
use crate::signal::StopSignal;
use crate::sink::{self, LatestValueBuffer, NotificationSink, SinkRegistry};
use crate::subscriber::{NotificationSubscriber, SubscriptionHandle};
use crate::transport::BleTransport;
use crate::types::{Advertisement, AttributeId, DeviceAddress, DeviceHandle, Service, SessionState};

// =============================================================================
// PUBLIC TYPES
// =============================================================================

/// The connected peripheral and what was set up on it.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    /// Peripheral address.
    pub address: DeviceAddress,
    /// Live connection.
    pub handle: DeviceHandle,
    /// Discovered services, in peripheral order.
    pub services: Vec<Service>,
    /// Enabled subscriptions.
    pub subscriptions: Vec<SubscriptionHandle>,
}

/// Where in the pipeline a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// Starting or resuming the scan.
    Scan,
    /// Connecting.
    Connect,
    /// Enumerating services.
    Discovery,
    /// Enumerating one service's characteristics.
    Characteristics,
    /// Enabling notifications on one characteristic.
    Subscribe,
}

/// A failure the session recovered from or stopped on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Pipeline stage.
    pub stage: FailureStage,
    /// Affected device, service or characteristic.
    pub subject: String,
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub error: String,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// Snapshot of a session, as returned by [`DiscoverySession::status`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Current state.
    pub state: SessionState,
    /// Advertised name being searched for.
    pub target_name: Option<String>,
    /// Device being connected to or connected.
    pub device: Option<DeviceAddress>,
    /// Services of the connected device.
    pub services: Vec<Service>,
    /// Characteristics with notifications enabled.
    pub subscriptions: Vec<AttributeId>,
    /// Failures recorded since the session was started.
    pub failures: Vec<FailureRecord>,
    /// Connection attempts since the session was started.
    pub connect_attempts: u32,
}

// =============================================================================
// INTERNAL STATE
// =============================================================================

/// Ownership slot for the one device a session may talk to.
enum Link {
    Vacant,
    Pending(DeviceAddress),
    Connected(DeviceHandle),
    Live(DeviceSession),
}

struct Inner<T: BleTransport> {
    transport: Arc<T>,
    config: SessionConfig,
    sinks: Arc<SinkRegistry>,
    buffer: Option<Arc<LatestValueBuffer>>,
    explorer: GattExplorer<T>,
    subscriber: NotificationSubscriber<T>,
    stop: Arc<StopSignal>,
    status: Mutex<SessionStatus>,
    link: Mutex<Link>,
    backoff: Mutex<HashMap<DeviceAddress, Instant>>,
    scanner: Mutex<Option<Arc<Scanner<T>>>>,
    finished: watch::Sender<bool>,
}

#[derive(Default)]
struct Tasks {
    worker: Option<JoinHandle<()>>,
    drain: Option<JoinHandle<()>>,
}

impl<T: BleTransport> Inner<T> {
    fn state(&self) -> SessionState {
        self.status.lock().state
    }

    fn set_state(&self, state: SessionState) {
        let mut status = self.status.lock();
        if status.state != state {
            debug!(from = %status.state, to = %state, "Session state changed");
            status.state = state;
        }
    }

    fn record(&self, stage: FailureStage, subject: impl Into<String>, error: &LinkError) {
        let subject = subject.into();
        warn!(?stage, %subject, %error, "Recorded failure");
        self.status.lock().failures.push(FailureRecord {
            stage,
            subject,
            code: error.error_code().to_string(),
            error: error.to_string(),
            at: Utc::now(),
        });
    }

    fn claim(&self, address: DeviceAddress) -> Result<()> {
        let mut link = self.link.lock();
        match *link {
            Link::Vacant => {
                *link = Link::Pending(address);
                Ok(())
            }
            _ => Err(LinkError::SessionBusy),
        }
    }

    fn is_vacant(&self) -> bool {
        matches!(*self.link.lock(), Link::Vacant)
    }

    fn backing_off(&self, address: DeviceAddress) -> bool {
        let mut backoff = self.backoff.lock();
        match backoff.get(&address) {
            Some(until) if Instant::now() < *until => true,
            Some(_) => {
                backoff.remove(&address);
                false
            }
            None => false,
        }
    }

    fn current_scanner(&self) -> Option<Arc<Scanner<T>>> {
        self.scanner.lock().clone()
    }

    fn spawn_drain(&self) -> Option<JoinHandle<()>> {
        self.buffer.as_ref().map(|buffer| {
            sink::spawn_drain(
                Arc::clone(buffer),
                self.config.delivery.drain_interval(),
                Arc::clone(&self.sinks) as Arc<dyn NotificationSink>,
                Arc::clone(&self.stop),
            )
        })
    }

    /// Record `error`, give up the claim and enter `Error`.
    fn fail(&self, stage: FailureStage, address: DeviceAddress, error: LinkError) -> LinkError {
        self.record(stage, format!("device {address}"), &error);
        *self.link.lock() = Link::Vacant;
        self.set_state(SessionState::Error);
        error
    }

    /// Connect to a claimed address, discover it and subscribe.
    #[instrument(skip(self), fields(%address))]
    async fn establish(&self, address: DeviceAddress) -> Result<()> {
        {
            let mut status = self.status.lock();
            status.state = SessionState::Connecting;
            status.device = Some(address);
            status.connect_attempts += 1;
            status.services.clear();
            status.subscriptions.clear();
        }
        info!("Connecting");

        let limit = self.config.connect_timeout();
        let handle = match tokio::time::timeout(limit, self.transport.connect(address)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => {
                let error = LinkError::connect_failed(address, &err);
                return Err(self.fail(FailureStage::Connect, address, error));
            }
            Err(_) => {
                let error = LinkError::Timeout {
                    operation: "connect",
                    after: limit,
                };
                return Err(self.fail(FailureStage::Connect, address, error));
            }
        };
        *self.link.lock() = Link::Connected(handle);
        info!(connection_id = handle.connection_id, "Connected");

        if self.config.stop_scan_after_connect {
            if let Some(scanner) = self.current_scanner() {
                if let Err(error) = scanner.stop().await {
                    warn!(%error, "Failed to stop scanning after connect");
                }
            }
        }

        self.set_state(SessionState::Discovering);
        let tree = match self.explorer.explore(&handle).await {
            Ok(tree) => tree,
            Err(error) => {
                if let Err(err) = self.transport.disconnect(&handle).await {
                    warn!(error = %err, "Disconnect after failed discovery failed");
                }
                return Err(self.fail(FailureStage::Discovery, address, error.into()));
            }
        };
        for failure in &tree.failures {
            self.record(
                FailureStage::Characteristics,
                format!("service {}", failure.service),
                &failure.error.clone().into(),
            );
        }

        let mut subscriptions = Vec::new();
        for characteristic in tree.notifiable() {
            match self.subscriber.enable(&handle, characteristic).await {
                Ok(subscription) => subscriptions.push(subscription),
                Err(error) => self.record(
                    FailureStage::Subscribe,
                    format!("characteristic {}", characteristic.uuid),
                    &error.into(),
                ),
            }
        }

        let subscribed: Vec<AttributeId> = subscriptions.iter().map(|s| s.characteristic).collect();
        info!(
            services = tree.services.len(),
            subscriptions = subscribed.len(),
            "Streaming notifications"
        );
        *self.link.lock() = Link::Live(DeviceSession {
            address,
            handle,
            services: tree.services.clone(),
            subscriptions,
        });
        let mut status = self.status.lock();
        status.services = tree.services;
        status.subscriptions = subscribed;
        status.state = SessionState::Subscribed;
        Ok(())
    }

    /// Apply the connect-failure policy. Returns `false` if the worker should
    /// only wait for a stop from now on.
    async fn recover(&self, address: DeviceAddress) -> bool {
        match self.config.on_connect_failure {
            ConnectFailurePolicy::Abort => {
                info!("Connect failure policy is abort; waiting for stop");
                false
            }
            ConnectFailurePolicy::Retry => {
                self.backoff
                    .lock()
                    .insert(address, Instant::now() + self.config.retry_backoff());
                if let Some(scanner) = self.current_scanner() {
                    if !scanner.is_scanning() {
                        if let Err(error) = scanner.start(self.config.scan_mode).await {
                            self.record(FailureStage::Scan, "adapter", &error);
                            return false;
                        }
                    }
                }
                self.set_state(SessionState::Scanning);
                true
            }
        }
    }

    /// Disable subscriptions and drop the connection, whatever stage it is at.
    async fn release_device(&self) {
        self.subscriber.disable_all().await;
        let link = std::mem::replace(&mut *self.link.lock(), Link::Vacant);
        let handle = match link {
            Link::Live(session) => Some(session.handle),
            Link::Connected(handle) => Some(handle),
            Link::Pending(address) => {
                match self.transport.abort_connect(address).await {
                    Ok(()) => debug!(%address, "Connect attempt abandoned"),
                    Err(error) => warn!(%address, %error, "Failed to abandon connect attempt"),
                }
                None
            }
            Link::Vacant => None,
        };
        if let Some(handle) = handle {
            match self.transport.disconnect(&handle).await {
                Ok(()) => info!(address = %handle.address, "Disconnected"),
                Err(error) => warn!(address = %handle.address, %error, "Disconnect failed"),
            }
        }
    }
}

async fn run_worker<T: BleTransport>(
    inner: Arc<Inner<T>>,
    mut advertisements: mpsc::Receiver<Advertisement>,
    filter: AdvertisementFilter,
) {
    loop {
        let advertisement = tokio::select! {
            biased;
            () = inner.stop.cancelled() => break,
            next = advertisements.recv() => match next {
                Some(advertisement) => advertisement,
                None => break,
            },
        };

        if !filter.matches(&advertisement) {
            continue;
        }
        let address = advertisement.address;
        if inner.backing_off(address) {
            trace!(%address, "Ignoring match during retry backoff");
            continue;
        }
        if inner.claim(address).is_err() {
            trace!(%address, "Session busy, ignoring match");
            continue;
        }
        info!(%address, rssi = ?advertisement.rssi_dbm, "Found target");

        let outcome = tokio::select! {
            biased;
            () = inner.stop.cancelled() => break,
            result = inner.establish(address) => result,
        };
        if outcome.is_err() && !inner.recover(address).await {
            inner.stop.cancelled().await;
            break;
        }
    }

    inner.release_device().await;
    let scanner = inner.scanner.lock().take();
    if let Some(scanner) = scanner {
        if let Err(error) = scanner.stop().await {
            warn!(%error, "Failed to stop scanning");
        }
    }
    debug!("Session worker exited");
}

// =============================================================================
// DISCOVERY SESSION
// =============================================================================

/// Scan, connect, discover and subscribe to one peripheral.
pub struct DiscoverySession<T: BleTransport> {
    inner: Arc<Inner<T>>,
    tasks: tokio::sync::Mutex<Tasks>,
}

impl<T: BleTransport> DiscoverySession<T> {
    /// Create an idle session.
    pub fn new(transport: Arc<T>, config: SessionConfig) -> Self {
        let sinks = Arc::new(SinkRegistry::new());
        let buffer = (config.delivery.mode == DeliveryMode::Buffered)
            .then(|| Arc::new(LatestValueBuffer::new()));
        let delivery: Arc<dyn NotificationSink> = match &buffer {
            Some(buffer) => Arc::clone(buffer) as Arc<dyn NotificationSink>,
            None => Arc::clone(&sinks) as Arc<dyn NotificationSink>,
        };
        let (finished, _) = watch::channel(true);

        let inner = Inner {
            explorer: GattExplorer::new(Arc::clone(&transport), config.discovery_timeout()),
            subscriber: NotificationSubscriber::new(
                Arc::clone(&transport),
                delivery,
                config.subscribe_timeout(),
            ),
            transport,
            config,
            sinks,
            buffer,
            stop: Arc::new(StopSignal::new()),
            status: Mutex::new(SessionStatus::default()),
            link: Mutex::new(Link::Vacant),
            backoff: Mutex::new(HashMap::new()),
            scanner: Mutex::new(None),
            finished,
        };
        Self {
            inner: Arc::new(inner),
            tasks: tokio::sync::Mutex::new(Tasks::default()),
        }
    }

    /// Create an idle session after checking `config`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Config`] if a setting is out of range.
    pub fn try_new(transport: Arc<T>, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(transport, config))
    }

    /// The session's settings.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Start scanning for a peripheral advertising `target_name`.
    ///
    /// # Errors
    ///
    /// See [`start_with_filter`](Self::start_with_filter).
    pub async fn start(&self, target_name: &str) -> Result<()> {
        self.start_with_filter(AdvertisementFilter::by_name(target_name))
            .await
    }

    /// Start scanning for a peripheral matching `filter`.
    ///
    /// Returns once the scan is running; the rest happens on a worker task.
    ///
    /// # Errors
    ///
    /// - [`LinkError::AlreadyScanning`] if the session is running.
    /// - [`LinkError::SessionBusy`] if a manual connection is held.
    /// - [`LinkError::ScanStartFailed`] if the radio refused.
    pub async fn start_with_filter(&self, filter: AdvertisementFilter) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.worker.is_some() {
            return Err(LinkError::AlreadyScanning);
        }
        if !self.inner.is_vacant() {
            return Err(LinkError::SessionBusy);
        }

        self.inner.stop.reset();
        self.inner.finished.send_replace(false);
        self.inner.backoff.lock().clear();
        *self.inner.status.lock() = SessionStatus {
            state: SessionState::Scanning,
            target_name: Some(filter.name().to_string()),
            ..SessionStatus::default()
        };

        let (observer, advertisements) = AdvertisementChannel::new(self.inner.config.channel_capacity);
        let scanner = Arc::new(Scanner::new(
            Arc::clone(&self.inner.transport),
            Arc::new(observer),
        ));
        if let Err(error) = scanner.start(self.inner.config.scan_mode).await {
            self.inner.record(FailureStage::Scan, "adapter", &error);
            self.inner.set_state(SessionState::Error);
            self.inner.finished.send_replace(true);
            return Err(error);
        }
        *self.inner.scanner.lock() = Some(scanner);

        info!(name = filter.name(), "Discovery session started");
        tasks.drain = self.inner.spawn_drain();
        tasks.worker = Some(tokio::spawn(run_worker(
            Arc::clone(&self.inner),
            advertisements,
            filter,
        )));
        Ok(())
    }

    /// Connect to `address` directly, without scanning.
    ///
    /// # Errors
    ///
    /// - [`LinkError::SessionBusy`] if a device is already claimed.
    /// - [`LinkError::ConnectFailed`], [`LinkError::Timeout`] or a GATT
    ///   error if the connection could not be set up.
    pub async fn connect_to(&self, address: DeviceAddress) -> Result<()> {
        self.inner.claim(address)?;
        {
            let mut tasks = self.tasks.lock().await;
            if tasks.worker.is_none() {
                self.inner.stop.reset();
                self.inner.finished.send_replace(false);
            }
            if tasks.drain.is_none() {
                tasks.drain = self.inner.spawn_drain();
            }
        }

        tokio::select! {
            biased;
            () = self.inner.stop.cancelled() => Ok(()),
            result = self.inner.establish(address) => result,
        }
    }

    /// Stop everything: subscriptions, connection, scan and worker.
    ///
    /// Does nothing on an idle session. Safe to call from any state.
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        if tasks.worker.is_none() && tasks.drain.is_none() && self.inner.is_vacant() {
            return;
        }

        info!("Stopping discovery session");
        self.inner.stop.trigger();
        if let Some(worker) = tasks.worker.take() {
            if let Err(error) = worker.await {
                warn!(%error, "Session worker panicked");
            }
        }
        self.inner.release_device().await;
        if let Some(drain) = tasks.drain.take() {
            if let Err(error) = drain.await {
                warn!(%error, "Notification drain panicked");
            }
        }
        self.inner.set_state(SessionState::Stopped);
        self.inner.finished.send_replace(true);
    }

    /// Resolve once the session has been stopped.
    pub async fn wait(&self) {
        let mut finished = self.inner.finished.subscribe();
        let _ = finished.wait_for(|done| *done).await;
    }

    /// Register a consumer for notification events.
    pub fn on_notification(&self, sink: Arc<dyn NotificationSink>) {
        self.inner.sinks.register(sink);
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Snapshot of the session.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.inner.status.lock().clone()
    }

    /// The connected device, once subscribed.
    #[must_use]
    pub fn device(&self) -> Option<DeviceSession> {
        match &*self.inner.link.lock() {
            Link::Live(session) => Some(session.clone()),
            _ => None,
        }
    }
}

impl<T: BleTransport> Drop for DiscoverySession<T> {
    fn drop(&mut self) {
        self.inner.stop.trigger();
    }
}

// =============================================================================
// TESTS
// =============================================================================
