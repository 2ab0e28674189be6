//! Relayhub server.
//!
//! Connection hub and shutdown coordinator, plus the production glue that
//! runs them behind a QUIC endpoint.
//!
//! # Architecture
//!
//! The hub and the coordinator are transport-agnostic. The hub only sees
//! [`MessageSink`] implementations and opaque [`bytes::Bytes`] payloads; the
//! coordinator only sees [`RequestGuard`]s and [`CleanupTask`]s. [`Server`]
//! wires both to Quinn:
//!
//! - every accepted connection opens one unidirectional stream that becomes
//!   its [`QuinnSink`] and is registered with the hub
//! - every client-opened bidirectional stream is one tracked unit of work; each
//!   length-prefixed message on it is relayed to every other connection
//! - when the coordinator starts draining, the endpoint stops accepting
//!
//! # Components
//!
//! - [`Hub`]: connection registry and broadcast fan-out
//! - [`ShutdownCoordinator`]: Running, Draining, Stopped lifecycle
//! - [`InFlightTracker`]: in-flight counter behind [`RequestGuard`]
//! - [`CleanupRegistry`]: ordered, time-boxed shutdown actions
//! - [`QuinnTransport`]: QUIC transport via Quinn library
//! - [`SystemEnv`]: Production environment (real time, OS RNG)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cleanup;
pub mod codec;
pub mod coordinator;
mod error;
pub mod hub;
mod outbound;
pub mod sink;
mod system_env;
pub mod tracker;
mod transport;

use std::{net::SocketAddr, time::Duration};

pub use cleanup::{CleanupError, CleanupOutcome, CleanupRecord, CleanupRegistry, CleanupTask};
pub use codec::{CodecError, DEFAULT_MAX_MESSAGE_SIZE};
pub use coordinator::{
    DrainOutcome, HealthStatus, ShutdownConfig, ShutdownCoordinator, ShutdownError,
    ShutdownReport, ShutdownStatus,
};
pub use error::ServerError;
pub use hub::{Hub, HubConfig, HubError, HubStats};
pub use outbound::OverflowPolicy;
pub use relayhub_core::{ConnectionId, ConnectionState, Environment, LifecycleState};
pub use sink::{ChannelSink, MessageSink, SinkError};
pub use system_env::SystemEnv;
pub use tracker::{InFlightTracker, RequestGuard};
pub use transport::{ALPN_PROTOCOL, QuinnConnection, QuinnSink, QuinnTransport, read_message};

/// Time given to peers to acknowledge the endpoint close after `Stopped`.
const ENDPOINT_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:4433")
    pub bind_address: String,
    /// Path to TLS certificate (PEM format)
    pub cert_path: Option<String>,
    /// Path to TLS private key (PEM format)
    pub key_path: Option<String>,
    /// Hub configuration (queue sizes, overflow policy, flush timeout)
    pub hub: HubConfig,
    /// Shutdown configuration (drain budget)
    pub shutdown: ShutdownConfig,
    /// Largest accepted or sent message payload
    pub max_message_size: usize,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4433".to_string(),
            cert_path: None,
            key_path: None,
            hub: HubConfig::default(),
            shutdown: ShutdownConfig::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Production relayhub server.
pub struct Server {
    transport: QuinnTransport,
    hub: Hub,
    coordinator: ShutdownCoordinator,
    max_message_size: usize,
}

impl Server {
    /// Create and bind a new server.
    ///
    /// Must be called from within a Tokio runtime: the hub owner task is
    /// spawned here.
    pub fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        let transport =
            QuinnTransport::bind(&config.bind_address, config.cert_path, config.key_path)?;
        let hub = Hub::spawn(config.hub, SystemEnv::new());
        let coordinator = ShutdownCoordinator::new(hub.clone(), config.shutdown);

        Ok(Self { transport, hub, coordinator, max_message_size: config.max_message_size })
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.transport.local_addr()
    }

    /// Handle to the connection hub.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Handle to the shutdown coordinator.
    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.coordinator
    }

    /// Accept connections until the coordinator starts draining, then wait
    /// for `Stopped` and close the endpoint.
    pub async fn run(self) -> Result<std::sync::Arc<ShutdownReport>, ServerError> {
        tracing::info!("Server starting on {}", self.transport.local_addr()?);

        let draining = self.coordinator.draining_token();

        loop {
            let incoming = tokio::select! {
                () = draining.cancelled() => break,
                incoming = self.transport.accept() => incoming,
            };

            let Some(incoming) = incoming else {
                tracing::warn!("endpoint stopped accepting");
                break;
            };

            let hub = self.hub.clone();
            let coordinator = self.coordinator.clone();
            let max = self.max_message_size;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(incoming, hub, coordinator, max).await {
                    tracing::error!("Connection error: {}", e);
                }
            });
        }

        self.transport.stop_accepting();
        tracing::info!("no longer accepting connections");

        let report = self.coordinator.wait_stopped().await;

        if tokio::time::timeout(ENDPOINT_CLOSE_GRACE, self.transport.shutdown()).await.is_err() {
            tracing::debug!("peers did not acknowledge endpoint close in time");
        }

        Ok(report)
    }
}

/// Handle a single QUIC connection from handshake to close.
async fn handle_connection(
    incoming: quinn::Incoming,
    hub: Hub,
    coordinator: ShutdownCoordinator,
    max_message_size: usize,
) -> Result<(), ServerError> {
    let conn = QuinnConnection::handshake(incoming).await?;
    let outbound = conn.open_uni().await?;

    let id = hub.register(QuinnSink::new(outbound, max_message_size)).await?;
    tracing::debug!(%id, remote = %conn.remote_addr(), "connection accepted");

    loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                let hub = hub.clone();
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        handle_stream(id, send, recv, hub, coordinator, max_message_size).await
                    {
                        tracing::debug!(%id, "Stream error: {}", e);
                    }
                });
            },
            Err(e) => {
                tracing::debug!(%id, "Connection closed: {}", e);
                break;
            },
        }
    }

    hub.unregister(id).await;
    Ok(())
}

/// Relay every message on one inbound stream to all other connections.
///
/// The stream is tracked work: it holds a guard until the peer finishes it,
/// it fails, or draining begins.
async fn handle_stream(
    id: ConnectionId,
    send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    hub: Hub,
    coordinator: ShutdownCoordinator,
    max_message_size: usize,
) -> Result<(), ServerError> {
    drop(send); // replies go out on the connection's outbound stream

    let guard = coordinator.track()?;

    loop {
        let message = tokio::select! {
            biased;
            () = guard.draining() => break,
            message = read_message(&mut recv, max_message_size) => message?,
        };

        let Some(message) = message else {
            break;
        };

        let relayed = hub.broadcast_except(id, message).await?;
        tracing::debug!(%id, relayed, "message relayed");
    }

    Ok(())
}
