//! Server error types.

use std::fmt;

use crate::{coordinator::ShutdownError, hub::HubError};

/// Errors that can occur in the server.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error (invalid bind address, missing TLS certs, etc.).
    ///
    /// Fatal: prevents server startup.
    Config(String),

    /// Transport/network error (connection failure, I/O error, etc.).
    ///
    /// May be transient (network issues) or fatal (bind address in use).
    Transport(String),

    /// Protocol error (oversized or truncated message).
    ///
    /// Fatal for that connection; the server keeps serving other clients.
    Protocol(String),

    /// Hub rejected an operation.
    Hub(HubError),

    /// Coordinator rejected an operation.
    Shutdown(ShutdownError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Hub(err) => write!(f, "hub error: {err}"),
            Self::Shutdown(err) => write!(f, "shutdown error: {err}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Hub(err) => Some(err),
            Self::Shutdown(err) => Some(err),
            _ => None,
        }
    }
}

impl From<HubError> for ServerError {
    fn from(err: HubError) -> Self {
        Self::Hub(err)
    }
}

impl From<ShutdownError> for ServerError {
    fn from(err: ShutdownError) -> Self {
        Self::Shutdown(err)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
