//! Relayhub core.
//!
//! Pure state machines shared by the hub and the shutdown coordinator. Nothing
//! in this crate performs I/O or spawns tasks; the runtime in
//! `relayhub-server` drives these types and executes the effects.
//!
//! # Components
//!
//! - [`connection::Connection`]: forward-only lifecycle of one duplex peer
//! - [`lifecycle::Lifecycle`]: monotonic process lifecycle (Running, Draining,
//!   Stopped)
//! - [`env::Environment`]: time and randomness abstraction

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod connection;
pub mod env;
pub mod error;
pub mod lifecycle;

pub use connection::{Connection, ConnectionId, ConnectionState};
pub use env::Environment;
pub use error::{ConnectionError, LifecycleError};
pub use lifecycle::{Lifecycle, LifecycleState};
