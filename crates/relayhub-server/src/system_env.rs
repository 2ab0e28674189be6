//! Production Environment implementation using system time and RNG.
//!
//! `SystemEnv` backs the hub in the server binary: connection timestamps come
//! from `std::time::Instant` and connection ids from the OS RNG via getrandom.
//! Nothing here is reproducible; tests that need determinism supply their own
//! [`Environment`].

use relayhub_core::Environment;

/// Production environment using system time and OS randomness.
///
/// # Panics
///
/// Panics if the OS RNG fails. Connection ids would otherwise stop being
/// unpredictable, and OS RNG failure indicates a broken host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }
}
