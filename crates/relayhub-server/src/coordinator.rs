//! Shutdown coordinator.
//!
//! Owns the process lifecycle. Request handlers hold a [`RequestGuard`] from
//! [`ShutdownCoordinator::track`] while they work; signal handlers call
//! [`ShutdownCoordinator::trigger`]. The first trigger starts the drain
//! sequence on its own task:
//!
//! 1. cancel the draining token so tracked work can wind down
//! 2. wait for in-flight work to reach zero, up to the deadline minus a
//!    reserve kept back for cleanup
//! 3. run cleanup tasks in registration order, each clamped to the deadline
//! 4. close every hub connection with whatever time is left
//! 5. publish the [`ShutdownReport`] and move to `Stopped`
//!
//! The reserve is the sum of the cleanup budgets, capped at a quarter of the
//! total, so a forced drain still leaves cleanup tasks time to run. The total
//! budget bounds trigger-to-`Stopped` latency; a hub close reached at the
//! deadline runs with no flush time.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use relayhub_core::{Lifecycle, LifecycleError, LifecycleState};
use thiserror::Error;
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    cleanup::{CleanupRecord, CleanupRegistry, CleanupTask},
    hub::Hub,
    tracker::{InFlightTracker, RequestGuard},
};

/// Default total time between trigger and `Stopped`.
pub const DEFAULT_DRAIN_BUDGET: Duration = Duration::from_secs(30);

/// At most `1 / CLEANUP_RESERVE_DIVISOR` of the budget is held back from the
/// in-flight wait for cleanup tasks.
pub const CLEANUP_RESERVE_DIVISOR: u32 = 4;

/// Shutdown configuration
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Budget used by [`ShutdownCoordinator::shutdown`]
    pub drain_budget: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { drain_budget: DEFAULT_DRAIN_BUDGET }
    }
}

/// Errors returned by coordinator operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownError {
    /// Shutdown already completed.
    #[error("shutdown already completed")]
    AlreadyStopped,

    /// Draining has begun and the operation is only valid while running.
    #[error("shutdown in progress")]
    Draining,
}

impl From<LifecycleError> for ShutdownError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::AlreadyStopped => Self::AlreadyStopped,
            LifecycleError::Draining => Self::Draining,
        }
    }
}

/// How the in-flight wait ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every guard was released before the deadline
    #[default]
    Idle,
    /// The deadline passed with work still holding guards
    TimedOut {
        /// Guards still held at the deadline
        remaining: usize,
    },
}

/// Summary of a completed shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Result of waiting for in-flight work
    pub drain: DrainOutcome,
    /// One record per registered cleanup task, in execution order
    pub cleanup: Vec<CleanupRecord>,
    /// Connections closed by the hub
    pub connections_closed: usize,
    /// Time from trigger to `Stopped`
    pub elapsed: Duration,
}

/// Published coordinator status.
#[derive(Debug, Clone, Default)]
pub struct ShutdownStatus {
    lifecycle: Lifecycle,
    report: Option<Arc<ShutdownReport>>,
}

impl ShutdownStatus {
    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Final report, present once `Stopped`.
    pub fn report(&self) -> Option<&Arc<ShutdownReport>> {
        self.report.as_ref()
    }
}

/// Snapshot for health endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthStatus {
    /// Lifecycle state
    pub state: LifecycleState,
    /// Held request guards
    pub in_flight: usize,
    /// Registered hub connections
    pub connections: usize,
}

impl HealthStatus {
    /// Whether new traffic should be routed here.
    pub fn is_healthy(&self) -> bool {
        self.state.is_healthy()
    }
}

#[derive(Debug)]
struct Inner {
    config: ShutdownConfig,
    hub: Hub,
    tracker: Arc<InFlightTracker>,
    draining: CancellationToken,
    cleanup: Mutex<Option<CleanupRegistry>>,
    status: watch::Sender<ShutdownStatus>,
}

impl Inner {
    fn cleanup(&self) -> MutexGuard<'_, Option<CleanupRegistry>> {
        self.cleanup.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> LifecycleState {
        self.status.borrow().state()
    }
}

/// Process-wide shutdown coordinator.
///
/// Cheap to clone; all clones share one lifecycle.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    /// Create a coordinator in `Running` that will close `hub` on shutdown.
    pub fn new(hub: Hub, config: ShutdownConfig) -> Self {
        let (status, _) = watch::channel(ShutdownStatus::default());
        Self {
            inner: Arc::new(Inner {
                config,
                hub,
                tracker: Arc::new(InFlightTracker::new()),
                draining: CancellationToken::new(),
                cleanup: Mutex::new(Some(CleanupRegistry::new())),
                status,
            }),
        }
    }

    /// Start tracking one unit of work.
    ///
    /// Allowed while running or draining, so work already accepted can spawn
    /// follow-ups. Hold the guard for the whole duration of the work.
    ///
    /// # Errors
    ///
    /// - `ShutdownError::AlreadyStopped` once shutdown has completed
    pub fn track(&self) -> Result<RequestGuard, ShutdownError> {
        if self.inner.state() == LifecycleState::Stopped {
            return Err(ShutdownError::AlreadyStopped);
        }
        Ok(self.inner.tracker.acquire(self.inner.draining.clone()))
    }

    /// Append a cleanup task to run during shutdown.
    ///
    /// # Errors
    ///
    /// - `ShutdownError::Draining` once shutdown has been triggered
    /// - `ShutdownError::AlreadyStopped` once shutdown has completed
    pub fn register_cleanup_task(
        &self,
        name: impl Into<String>,
        max_duration: Duration,
        task: impl CleanupTask,
    ) -> Result<(), ShutdownError> {
        let mut slot = self.inner.cleanup();
        if let Some(err) = LifecycleError::for_state(self.inner.state()) {
            return Err(err.into());
        }
        match slot.as_mut() {
            Some(registry) => {
                registry.push(name, max_duration, task);
                Ok(())
            },
            None => Err(ShutdownError::Draining),
        }
    }

    /// Begin shutdown with `budget` without waiting for it to finish.
    ///
    /// Returns `true` for the call that started the drain; later calls are
    /// no-ops and return `false`.
    pub fn initiate(&self, budget: Duration) -> bool {
        let started = Instant::now();
        if !self.inner.status.send_if_modified(|status| status.lifecycle.begin_drain()) {
            return false;
        }

        self.inner.draining.cancel();
        tracing::info!(?budget, in_flight = self.in_flight(), "shutdown triggered, draining");
        tokio::spawn(run_drain(Arc::clone(&self.inner), started + budget, started));
        true
    }

    /// Begin shutdown with `budget` and wait until `Stopped`.
    ///
    /// Every caller receives the same report, whichever call started the
    /// drain. Dropping the returned future does not cancel the shutdown.
    pub async fn trigger(&self, budget: Duration) -> Arc<ShutdownReport> {
        self.initiate(budget);
        self.wait_stopped().await
    }

    /// [`ShutdownCoordinator::trigger`] with the configured drain budget.
    pub async fn shutdown(&self) -> Arc<ShutdownReport> {
        self.trigger(self.inner.config.drain_budget).await
    }

    /// Wait until `Stopped` and return the final report.
    pub async fn wait_stopped(&self) -> Arc<ShutdownReport> {
        let mut rx = self.inner.status.subscribe();
        match rx.wait_for(|status| status.report.is_some()).await {
            Ok(status) => status.report.clone().unwrap_or_default(),
            // The sender lives in `inner`, which `self` keeps alive
            Err(_) => Arc::default(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.inner.state()
    }

    /// Number of held request guards.
    pub fn in_flight(&self) -> usize {
        self.inner.tracker.in_flight()
    }

    /// Token cancelled when draining begins.
    pub fn draining_token(&self) -> CancellationToken {
        self.inner.draining.clone()
    }

    /// Watch the coordinator status.
    pub fn subscribe(&self) -> watch::Receiver<ShutdownStatus> {
        self.inner.status.subscribe()
    }

    /// Health snapshot.
    pub async fn health(&self) -> HealthStatus {
        HealthStatus {
            state: self.state(),
            in_flight: self.in_flight(),
            connections: self.inner.hub.count().await,
        }
    }
}

async fn run_drain(inner: Arc<Inner>, deadline: Instant, started: Instant) {
    // Registration is refused once draining, so the registry is final here
    let registry = inner.cleanup().take().unwrap_or_default();
    let reserve = cleanup_reserve(&registry, deadline.saturating_duration_since(started));
    let drain_deadline = deadline.checked_sub(reserve).unwrap_or(started).max(started);

    let drain = match tokio::time::timeout_at(drain_deadline, inner.tracker.wait_idle()).await {
        Ok(()) => {
            tracing::info!(elapsed = ?started.elapsed(), "in-flight work drained");
            DrainOutcome::Idle
        },
        Err(_) => {
            let remaining = inner.tracker.in_flight();
            tracing::warn!(remaining, ?reserve, "drain deadline reached, forcing shutdown");
            DrainOutcome::TimedOut { remaining }
        },
    };

    let cleanup = registry.run_all(deadline).await;

    let connections_closed = close_hub(&inner.hub, deadline).await;

    let report = Arc::new(ShutdownReport {
        drain,
        cleanup,
        connections_closed,
        elapsed: started.elapsed(),
    });
    tracing::info!(
        elapsed = ?report.elapsed,
        connections_closed,
        cleanup_tasks = report.cleanup.len(),
        "shutdown complete"
    );

    inner.status.send_modify(|status| {
        status.lifecycle.stop();
        status.report = Some(report);
    });
}

/// Time held back from the in-flight wait so cleanup can still run.
fn cleanup_reserve(registry: &CleanupRegistry, budget: Duration) -> Duration {
    registry.total_budget().min(budget / CLEANUP_RESERVE_DIVISOR)
}

/// Close the hub with whatever time remains.
///
/// The close runs on its own task with its flush clamped to the remaining
/// time. Past the deadline the flush time is zero, so waiting for the result
/// only covers the hub marking its connections closed.
async fn close_hub(hub: &Hub, deadline: Instant) -> usize {
    let remaining = deadline.saturating_duration_since(Instant::now());
    let hub = hub.clone();
    let mut close = tokio::spawn(async move { hub.close_all_within(remaining).await });

    let result = match tokio::time::timeout_at(deadline, &mut close).await {
        Ok(result) => result,
        Err(_) => {
            tracing::debug!("drain deadline reached, waiting for hub close without flush");
            close.await
        },
    };

    result.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "hub close task failed");
        0
    })
}
