//! Process lifecycle state machine.
//!
//! ```text
//! ┌─────────┐ begin_drain ┌──────────┐   stop   ┌─────────┐
//! │ Running │────────────>│ Draining │─────────>│ Stopped │
//! └─────────┘             └──────────┘          └─────────┘
//! ```
//!
//! The state is monotonic. Repeated `begin_drain` or `stop` calls report
//! `false` and leave the state untouched, so every signal path can call them
//! without coordinating with the others.

/// Process lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LifecycleState {
    /// Serving traffic
    #[default]
    Running,
    /// Shutdown triggered; in-flight work is finishing
    Draining,
    /// Cleanup finished and all connections closed
    Stopped,
}

impl LifecycleState {
    /// Whether a health check should report this process as able to take new
    /// traffic.
    pub fn is_healthy(self) -> bool {
        self == Self::Running
    }

    /// Short lowercase label for logs and health payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monotonic lifecycle tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lifecycle {
    state: LifecycleState,
}

impl Lifecycle {
    /// Start in [`LifecycleState::Running`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Move `Running -> Draining`.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn begin_drain(&mut self) -> bool {
        if self.state != LifecycleState::Running {
            return false;
        }
        self.state = LifecycleState::Draining;
        true
    }

    /// Move `Draining -> Stopped`.
    ///
    /// Returns `false` if not draining. Stopping straight from `Running` is
    /// refused: the drain sequence must have run.
    pub fn stop(&mut self) -> bool {
        if self.state != LifecycleState::Draining {
            return false;
        }
        self.state = LifecycleState::Stopped;
        true
    }
}
