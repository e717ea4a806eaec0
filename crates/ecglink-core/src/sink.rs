//! Notification sinks.
//!
//! A sink receives [`NotificationEvent`]s on the transport's dispatch context,
//! so `deliver` must return quickly. Two delivery designs are supported:
//!
//! - **Direct**: the subscriber calls the [`SinkRegistry`] inline.
//! - **Buffered**: the subscriber writes into a [`LatestValueBuffer`] and a
//!   drain task started with [`spawn_drain`] forwards the buffered values at
//!   a fixed cadence. Unread values are overwritten by newer ones.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::signal::StopSignal;
use crate::types::{AttributeId, NotificationEvent};

/// Consumer of notification events.
pub trait NotificationSink: Send + Sync {
    /// Handle one event. Must not block.
    fn deliver(&self, event: &NotificationEvent);
}

impl<F> NotificationSink for F
where
    F: Fn(&NotificationEvent) + Send + Sync,
{
    fn deliver(&self, event: &NotificationEvent) {
        self(event);
    }
}

/// Fan-out to every registered sink.
#[derive(Default)]
pub struct SinkRegistry {
    sinks: RwLock<Vec<Arc<dyn NotificationSink>>>,
}

impl SinkRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink. Sinks are invoked in registration order.
    pub fn register(&self, sink: Arc<dyn NotificationSink>) {
        self.sinks.write().push(sink);
    }

    /// Number of registered sinks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.read().len()
    }

    /// `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.read().is_empty()
    }
}

impl NotificationSink for SinkRegistry {
    fn deliver(&self, event: &NotificationEvent) {
        let sinks = self.sinks.read().clone();
        for sink in &sinks {
            sink.deliver(event);
        }
    }
}

/// Forwards events into a bounded channel.
///
/// When the receiver falls behind the event is dropped and counted rather
/// than blocking the dispatch context.
pub struct ChannelSink {
    tx: mpsc::Sender<NotificationEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Create a sink and the receiving half.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<NotificationEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events dropped because the channel was full or closed.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl NotificationSink for ChannelSink {
    fn deliver(&self, event: &NotificationEvent) {
        if self.tx.try_send(event.clone()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(characteristic = %event.characteristic, "Notification channel full, dropping event");
        }
    }
}

/// Latest value per characteristic under a single mutex.
///
/// Writers overwrite, [`take`](Self::take) reads and clears. An empty buffer
/// is the normal state between notifications.
#[derive(Default)]
pub struct LatestValueBuffer {
    latest: Mutex<BTreeMap<AttributeId, NotificationEvent>>,
    overwritten: AtomicU64,
}

impl LatestValueBuffer {
    /// An empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain every buffered value.
    pub fn take(&self) -> Vec<NotificationEvent> {
        let drained = std::mem::take(&mut *self.latest.lock());
        drained.into_values().collect()
    }

    /// Values replaced before they were drained.
    #[must_use]
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }
}

impl NotificationSink for LatestValueBuffer {
    fn deliver(&self, event: &NotificationEvent) {
        let previous = self
            .latest
            .lock()
            .insert(event.characteristic, event.clone());
        if previous.is_some() {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Periodically move buffered values into `target` until `stop` fires.
///
/// Whatever is still buffered when the stop arrives is flushed once.
pub fn spawn_drain(
    buffer: Arc<LatestValueBuffer>,
    interval: Duration,
    target: Arc<dyn NotificationSink>,
    stop: Arc<StopSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(interval_ms = interval.as_millis(), "Buffered notification drain started");

        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                _ = ticker.tick() => {
                    for event in buffer.take() {
                        target.deliver(&event);
                    }
                }
            }
        }

        for event in buffer.take() {
            target.deliver(&event);
        }
        debug!("Buffered notification drain stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(id: u16, payload: &[u8]) -> NotificationEvent {
        NotificationEvent {
            characteristic: AttributeId::from_short(id),
            payload: payload.to_vec(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_registry_fans_out_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = SinkRegistry::new();
        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            registry.register(Arc::new(move |_: &NotificationEvent| seen.lock().push(tag)));
        }
        assert_eq!(registry.len(), 2);

        registry.deliver(&event(0x2A37, &[1]));
        assert_eq!(*seen.lock(), vec!["a", "b"]);
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelSink::new(1);
        sink.deliver(&event(0x2A37, &[1]));
        sink.deliver(&event(0x2A37, &[2]));
        assert_eq!(sink.dropped(), 1);
        assert_eq!(rx.try_recv().unwrap().payload, vec![1]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_buffer_keeps_latest_and_clears() {
        let buffer = LatestValueBuffer::new();
        assert!(buffer.take().is_empty());

        buffer.deliver(&event(0x2A37, &[1]));
        buffer.deliver(&event(0x2A37, &[2]));
        buffer.deliver(&event(0x2A19, &[90]));
        assert_eq!(buffer.overwritten(), 1);

        let drained = buffer.take();
        assert_eq!(drained.len(), 2);
        let heart = drained
            .iter()
            .find(|e| e.characteristic == AttributeId::from_short(0x2A37))
            .unwrap();
        assert_eq!(heart.payload, vec![2]);
        assert!(buffer.take().is_empty());
    }

    #[tokio::test]
    async fn test_drain_forwards_and_flushes_on_stop() {
        let buffer = Arc::new(LatestValueBuffer::new());
        let (sink, mut rx) = ChannelSink::new(16);
        let stop = Arc::new(StopSignal::new());
        let task = spawn_drain(
            Arc::clone(&buffer),
            Duration::from_millis(5),
            Arc::new(sink),
            Arc::clone(&stop),
        );

        buffer.deliver(&event(0x2A37, &[7]));
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.payload, vec![7]);

        buffer.deliver(&event(0x2A37, &[8]));
        stop.trigger();
        task.await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, vec![8]);
    }
}
