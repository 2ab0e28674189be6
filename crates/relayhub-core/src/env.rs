//! Environment abstraction for deterministic testing.
//!
//! Decouples hub bookkeeping from system resources (clock, randomness). The
//! production runtime uses the OS clock and RNG; tests substitute a counter
//! based environment so connection ids and timestamps are reproducible.

use std::time::Duration;

use crate::connection::ConnectionId;

/// Abstract environment providing time and randomness.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses OS entropy in production
/// - Methods are infallible except in exceptional circumstances (e.g., OS
///   entropy exhaustion)
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    type Instant: Copy + Ord + Send + Sync + std::fmt::Debug + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    ///
    /// # Invariants
    ///
    /// - Subsequent calls must return times >= previous calls.
    fn now(&self) -> Self::Instant;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a fresh connection id.
    ///
    /// Ids are random so they stay opaque to peers. The hub draws again when a
    /// generated id is already live.
    fn connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.random_u64())
    }
}
