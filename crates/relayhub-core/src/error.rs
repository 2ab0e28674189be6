//! Error types for the relayhub state machines.
//!
//! Both state machines only move forward. Every rejected transition is
//! reported with the state it was attempted from so the runtime can log it
//! without having to re-query.

use thiserror::Error;

use crate::{connection::ConnectionState, lifecycle::LifecycleState};

/// Errors from the per-connection state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Transition would move the connection backwards or skip a state.
    #[error("invalid connection transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// State the connection was in
        from: ConnectionState,
        /// State that was requested
        to: ConnectionState,
    },
}

/// Errors from the process lifecycle state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// The process already reached `Stopped`; nothing may be mutated.
    #[error("lifecycle already stopped")]
    AlreadyStopped,

    /// Draining has begun and the operation is only allowed while running.
    #[error("lifecycle is draining")]
    Draining,
}

impl LifecycleError {
    /// Map the current state to the error reported for a rejected mutation.
    ///
    /// Returns `None` when the state is `Running` and the mutation is allowed.
    pub fn for_state(state: LifecycleState) -> Option<Self> {
        match state {
            LifecycleState::Running => None,
            LifecycleState::Draining => Some(Self::Draining),
            LifecycleState::Stopped => Some(Self::AlreadyStopped),
        }
    }
}
