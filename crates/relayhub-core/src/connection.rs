//! Per-connection lifecycle state machine.
//!
//! Tracks where a single duplex peer is in its lifetime. The machine is pure:
//! methods take time as input and return whether the transition happened. The
//! hub owns one of these per registered connection and consults it before
//! enqueueing anything.
//!
//! # State Machine
//!
//! ```text
//! ┌────────────┐ activate ┌────────┐ begin_close ┌─────────┐ finish_close ┌────────┐
//! │ Connecting │─────────>│ Active │────────────>│ Closing │─────────────>│ Closed │
//! └────────────┘          └────────┘             └─────────┘              └────────┘
//!       │                                             ↑
//!       └──────────────── begin_close ────────────────┘
//! ```
//!
//! Transitions only move right. Nothing re-enters `Active` once closing has
//! begun.

use std::{fmt, ops::Sub, time::Duration};

use crate::error::ConnectionError;

/// Opaque, process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value (for logging and wire use).
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for ConnectionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// Transport accepted, handshake not finished
    Connecting,
    /// Registered and receiving broadcasts
    Active,
    /// No new messages accepted; pending outbound is being flushed
    Closing,
    /// Transport released
    Closed,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal forward transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Active | Self::Closing)
                | (Self::Active, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }

    /// States in which a connection is present in the hub registry.
    pub fn is_registered(self) -> bool {
        matches!(self, Self::Active | Self::Closing)
    }
}

/// Connection state machine.
///
/// Generic over `Instant` so tests can drive it with a virtual clock.
#[derive(Debug, Clone)]
pub struct Connection<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    id: ConnectionId,
    state: ConnectionState,
    /// When the connection became `Active`
    activated_at: Option<I>,
    /// When the connection reached `Closed`
    closed_at: Option<I>,
    /// Set once any outbound message had to be discarded
    degraded: bool,
}

impl<I> Connection<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Create a new connection in [`ConnectionState::Connecting`].
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            state: ConnectionState::Connecting,
            activated_at: None,
            closed_at: None,
            degraded: false,
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether outbound messages have been dropped for this peer.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Record that at least one outbound message was discarded.
    pub fn mark_degraded(&mut self) {
        self.degraded = true;
    }

    /// Handshake finished; the connection may receive messages.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::InvalidTransition` unless in `Connecting`
    pub fn activate(&mut self, now: I) -> Result<(), ConnectionError> {
        self.transition(ConnectionState::Active)?;
        self.activated_at = Some(now);
        Ok(())
    }

    /// Stop accepting messages and start flushing.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::InvalidTransition` from `Closing` or `Closed`
    pub fn begin_close(&mut self) -> Result<(), ConnectionError> {
        self.transition(ConnectionState::Closing)
    }

    /// Transport released.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::InvalidTransition` unless in `Closing`
    pub fn finish_close(&mut self, now: I) -> Result<(), ConnectionError> {
        self.transition(ConnectionState::Closed)?;
        self.closed_at = Some(now);
        Ok(())
    }

    /// How long the connection has been (or was) active. `None` if it never
    /// became active.
    pub fn active_for(&self, now: I) -> Option<Duration> {
        let start = self.activated_at?;
        let end = self.closed_at.unwrap_or(now);
        Some(end - start)
    }

    fn transition(&mut self, to: ConnectionState) -> Result<(), ConnectionError> {
        if !self.state.can_transition_to(to) {
            return Err(ConnectionError::InvalidTransition { from: self.state, to });
        }
        self.state = to;
        Ok(())
    }
}
