//! Scan lifecycle.
//!
//! [`Scanner`] owns starting and stopping the radio scan. The observer is
//! fixed at construction; [`AdvertisementChannel`] is the observer the
//! discovery session uses to move advertisements off the transport's
//! dispatch context and into its worker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace};

use crate::error::{LinkError, Result};
use crate::transport::{AdvertisementObserver, BleTransport};
use crate::types::{Advertisement, ScanMode};

/// Observer that forwards advertisements into a bounded channel.
///
/// Full channel means the consumer is behind; the advertisement is dropped,
/// since the peripheral will broadcast again.
pub struct AdvertisementChannel {
    tx: mpsc::Sender<Advertisement>,
    dropped: AtomicU64,
}

impl AdvertisementChannel {
    /// Create the observer and its receiving half.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Advertisement>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Advertisements dropped so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AdvertisementObserver for AdvertisementChannel {
    fn on_advertisement(&self, advertisement: Advertisement) {
        if let Err(err) = self.tx.try_send(advertisement) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(error = %err, "Advertisement channel unavailable, dropping");
        }
    }
}

/// Starts and stops scanning on a transport.
pub struct Scanner<T: BleTransport> {
    transport: Arc<T>,
    observer: Arc<dyn AdvertisementObserver>,
    scanning: AtomicBool,
    // Serializes start/stop so the flag and the radio agree.
    lifecycle: Mutex<()>,
}

impl<T: BleTransport> Scanner<T> {
    /// Create a scanner reporting to `observer`.
    pub fn new(transport: Arc<T>, observer: Arc<dyn AdvertisementObserver>) -> Self {
        Self {
            transport,
            observer,
            scanning: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        }
    }

    /// Begin continuous scanning and return immediately.
    ///
    /// # Errors
    ///
    /// - [`LinkError::AlreadyScanning`] if a scan is running.
    /// - [`LinkError::ScanStartFailed`] if the radio refused.
    pub async fn start(&self, mode: ScanMode) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.scanning.load(Ordering::Acquire) {
            return Err(LinkError::AlreadyScanning);
        }

        self.transport
            .start_scan(mode, Arc::clone(&self.observer))
            .await
            .map_err(|e| LinkError::ScanStartFailed(e.to_string()))?;
        self.scanning.store(true, Ordering::Release);
        info!(?mode, "Scanning for BLE devices");
        Ok(())
    }

    /// Stop scanning. Does nothing if no scan is running.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ScanStopFailed`] if the transport fails to stop;
    /// the scanner is considered stopped regardless.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if !self.scanning.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        self.transport
            .stop_scan()
            .await
            .map_err(|e| LinkError::ScanStopFailed(e.to_string()))?;
        debug!("Scan stopped");
        Ok(())
    }

    /// `true` while a scan is running.
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use crate::transport::TransportError;
    use crate::types::DeviceAddress;

    fn scanner(transport: &Arc<MockTransport>) -> (Scanner<MockTransport>, mpsc::Receiver<Advertisement>) {
        let (observer, rx) = AdvertisementChannel::new(8);
        (Scanner::new(Arc::clone(transport), Arc::new(observer)), rx)
    }

    #[tokio::test]
    async fn test_start_delivers_advertisements() {
        let transport = Arc::new(MockTransport::new());
        let (scanner, mut rx) = scanner(&transport);

        scanner.start(ScanMode::Active).await.unwrap();
        assert!(scanner.is_scanning());
        assert_eq!(transport.scan_mode(), Some(ScanMode::Active));

        let adv = Advertisement::new(DeviceAddress::new(7), Some("ECG-7"), Some(-48));
        assert!(transport.advertise(adv.clone()));
        assert_eq!(rx.recv().await.unwrap(), adv);
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let transport = Arc::new(MockTransport::new());
        let (scanner, _rx) = scanner(&transport);

        scanner.start(ScanMode::Active).await.unwrap();
        let err = scanner.start(ScanMode::Active).await.unwrap_err();
        assert!(matches!(err, LinkError::AlreadyScanning));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let transport = Arc::new(MockTransport::new());
        let (scanner, _rx) = scanner(&transport);

        scanner.stop().await.unwrap();
        scanner.start(ScanMode::Passive).await.unwrap();
        scanner.stop().await.unwrap();
        scanner.stop().await.unwrap();
        assert!(!scanner.is_scanning());
        assert!(!transport.is_scanning());
    }

    #[tokio::test]
    async fn test_radio_failure_surfaces_as_scan_start_failed() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_scan_start(TransportError::PermissionDenied("no capability".into()));
        let (scanner, _rx) = scanner(&transport);

        let err = scanner.start(ScanMode::Active).await.unwrap_err();
        assert!(matches!(err, LinkError::ScanStartFailed(ref m) if m.contains("no capability")));
        assert!(!scanner.is_scanning());
    }

    #[tokio::test]
    async fn test_stop_failure_is_reported_as_stop_failure() {
        let transport = Arc::new(MockTransport::new());
        let (scanner, _rx) = scanner(&transport);
        scanner.start(ScanMode::Active).await.unwrap();
        transport.fail_scan_stop(TransportError::Other("adapter removed".into()));

        let err = scanner.stop().await.unwrap_err();
        assert!(matches!(err, LinkError::ScanStopFailed(ref m) if m.contains("adapter removed")));
        assert!(!scanner.is_scanning());
        scanner.start(ScanMode::Active).await.unwrap();
    }

    #[test]
    fn test_full_channel_drops() {
        let (observer, _rx) = AdvertisementChannel::new(1);
        let adv = Advertisement::new(DeviceAddress::new(1), None, None);
        observer.on_advertisement(adv.clone());
        observer.on_advertisement(adv);
        assert_eq!(observer.dropped(), 1);
    }
}
