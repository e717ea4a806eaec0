//! Keep-running flag shared between the controlling task and the worker.
//!
//! The flag is an atomic so it can be read from any context, and waiters are
//! woken through [`tokio::sync::Notify`] the moment it flips, so the worker
//! never polls.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// One-shot stop request that can be re-armed between runs.
#[derive(Debug)]
pub struct StopSignal {
    running: AtomicBool,
    notify: Notify,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    /// A signal in the running state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            notify: Notify::new(),
        }
    }

    /// `true` until [`trigger`](Self::trigger) is called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Request a stop and wake every waiter.
    pub fn trigger(&self) {
        self.running.store(false, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Re-arm after a completed stop.
    pub fn reset(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Resolve once a stop has been requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a trigger in between is not lost.
            notified.as_mut().enable();
            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_trigger_wakes_waiter() {
        let signal = StopSignal::new();
        let mut waiter = task::spawn(signal.cancelled());
        assert_pending!(waiter.poll());

        signal.trigger();
        assert!(waiter.is_woken());
        assert_ready!(waiter.poll());
    }

    #[test]
    fn test_already_stopped_resolves_immediately() {
        let signal = StopSignal::new();
        signal.trigger();
        let mut waiter = task::spawn(signal.cancelled());
        assert_ready!(waiter.poll());
    }

    #[test]
    fn test_reset_rearms() {
        let signal = StopSignal::new();
        signal.trigger();
        assert!(!signal.is_running());
        signal.reset();
        assert!(signal.is_running());
        let mut waiter = task::spawn(signal.cancelled());
        assert_pending!(waiter.poll());
    }
}
