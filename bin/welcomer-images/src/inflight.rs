//! In-flight write tracking for graceful shutdown

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Counts generations in progress and refuses new ones once closed
#[derive(Debug, Default)]
pub struct InFlightTracker {
    count: AtomicUsize,
    closing: AtomicBool,
    idle: Notify,
}

impl InFlightTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request, or `None` once [`close`](Self::close) was called.
    pub fn try_enter(&self) -> Option<InFlightGuard<'_>> {
        // Increment before checking so a concurrent drain always sees us
        self.count.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard { tracker: self };
        if self.closing.load(Ordering::SeqCst) {
            return None;
        }
        Some(guard)
    }

    /// Stop admitting new requests.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until no request is in flight or `timeout` elapses.
    ///
    /// Returns `true` if the tracker drained in time.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.count() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

/// Held for the duration of one tracked request
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    tracker: &'a InFlightTracker,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.tracker.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}
