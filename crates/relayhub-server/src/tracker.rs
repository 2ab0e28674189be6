//! In-flight work tracking.
//!
//! Every unit of lifecycle-tracked work holds a [`RequestGuard`] for its whole
//! duration. The guard releases on drop, so early returns, `?` and panics
//! unwinding through the handler all count as "done".

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Atomic counter of outstanding work with an idle notification.
#[derive(Debug, Default)]
pub struct InFlightTracker {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlightTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of held guards.
    pub fn in_flight(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Acquire a guard. `draining` is handed to the work so it can notice
    /// shutdown and bail out early.
    pub fn acquire(self: &Arc<Self>, draining: CancellationToken) -> RequestGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        RequestGuard { tracker: Arc::clone(self), draining }
    }

    fn release(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "released more guards than acquired");
        if prev == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Resolve once no guards are held.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Scoped acquisition of one unit of in-flight work.
#[derive(Debug)]
#[must_use = "work is only tracked while the guard is held"]
pub struct RequestGuard {
    tracker: Arc<InFlightTracker>,
    draining: CancellationToken,
}

impl RequestGuard {
    /// Whether shutdown has started. Long-running work should wind down.
    pub fn is_draining(&self) -> bool {
        self.draining.is_cancelled()
    }

    /// Token cancelled when draining begins.
    pub fn draining_token(&self) -> &CancellationToken {
        &self.draining
    }

    /// Resolve when draining begins.
    pub async fn draining(&self) {
        self.draining.cancelled().await;
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.tracker.release();
    }
}
