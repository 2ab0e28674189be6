//! Cleanup task registry.
//!
//! Application code registers named shutdown actions, each with its own time
//! budget. During drain they run one at a time in registration order. A task
//! that overruns is cancelled and abandoned so the next one can start.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Error type cleanup actions may return.
pub type CleanupError = Box<dyn std::error::Error + Send + Sync>;

/// A shutdown action.
///
/// The token is cancelled when the task's budget or the overall drain
/// deadline runs out, whichever comes first. Tasks that ignore it are
/// abandoned at that point anyway.
#[async_trait]
pub trait CleanupTask: Send + 'static {
    /// Run the action once.
    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<(), CleanupError>;
}

#[async_trait]
impl<F, Fut> CleanupTask for F
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), CleanupError>> + Send + 'static,
{
    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<(), CleanupError> {
        (*self)(cancel).await
    }
}

/// How a single cleanup task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Returned `Ok` within budget
    Completed,
    /// Returned an error or panicked
    Failed(String),
    /// Budget ran out; the task was cancelled and abandoned
    TimedOut,
    /// Never started because the drain deadline had already passed
    Skipped,
}

/// Diagnostic record for one executed (or skipped) task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupRecord {
    /// Name given at registration
    pub name: String,
    /// How it ended
    pub outcome: CleanupOutcome,
    /// Wall time spent on it
    pub elapsed: Duration,
}

struct Registered {
    name: String,
    max_duration: Duration,
    task: Box<dyn CleanupTask>,
}

/// Ordered collection of cleanup tasks.
#[derive(Default)]
pub struct CleanupRegistry {
    tasks: Vec<Registered>,
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.tasks.iter().map(|t| (&t.name, t.max_duration)))
            .finish()
    }
}

impl CleanupRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task.
    pub fn push(&mut self, name: impl Into<String>, max_duration: Duration, task: impl CleanupTask) {
        let name = name.into();
        tracing::debug!(%name, ?max_duration, "cleanup task registered");
        self.tasks.push(Registered { name, max_duration, task: Box::new(task) });
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no tasks are registered.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Sum of every task's own budget.
    pub fn total_budget(&self) -> Duration {
        self.tasks.iter().fold(Duration::ZERO, |sum, t| sum.saturating_add(t.max_duration))
    }

    /// Run every task in order, none of them past `deadline`.
    pub async fn run_all(self, deadline: Instant) -> Vec<CleanupRecord> {
        let mut records = Vec::with_capacity(self.tasks.len());

        for Registered { name, max_duration, task } in self.tasks {
            let started = Instant::now();
            let remaining = deadline.saturating_duration_since(started);

            if remaining.is_zero() {
                tracing::warn!(%name, "drain deadline passed, skipping cleanup task");
                records.push(CleanupRecord {
                    name,
                    outcome: CleanupOutcome::Skipped,
                    elapsed: Duration::ZERO,
                });
                continue;
            }

            let budget = max_duration.min(remaining);
            let cancel = CancellationToken::new();
            let mut handle = tokio::spawn(task.run(cancel.clone()));

            let outcome = match tokio::time::timeout(budget, &mut handle).await {
                Ok(Ok(Ok(()))) => CleanupOutcome::Completed,
                Ok(Ok(Err(e))) => CleanupOutcome::Failed(e.to_string()),
                Ok(Err(join_err)) => CleanupOutcome::Failed(join_err.to_string()),
                Err(_) => {
                    cancel.cancel();
                    handle.abort();
                    CleanupOutcome::TimedOut
                },
            };

            let elapsed = started.elapsed();
            match &outcome {
                CleanupOutcome::Completed => {
                    tracing::info!(%name, ?elapsed, "cleanup task completed");
                },
                CleanupOutcome::Failed(reason) => {
                    tracing::warn!(%name, %reason, ?elapsed, "cleanup task failed");
                },
                CleanupOutcome::TimedOut => {
                    tracing::warn!(%name, ?budget, "cleanup task exceeded its budget");
                },
                CleanupOutcome::Skipped => {},
            }

            records.push(CleanupRecord { name, outcome, elapsed });
        }

        records
    }
}
