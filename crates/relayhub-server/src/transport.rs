//! Quinn-based QUIC transport implementation.
//!
//! Production QUIC transport using the Quinn library. Provides encrypted,
//! multiplexed streams over UDP with TLS 1.3. Supports both production TLS
//! certificates (via PEM files) and self-signed certificates for testing.
//!
//! # Capabilities
//!
//! - UDP-based transport with packet loss recovery
//! - TLS 1.3 encryption and authentication
//! - Stream multiplexing (multiple logical streams over one connection)
//! - Connection migration support (IP address changes)
//!
//! # Security
//!
//! The transport enforces TLS 1.3 via the `rustls` crate. ALPN
//! (Application-Layer Protocol Negotiation) is set to [`ALPN_PROTOCOL`] so
//! only relayhub clients complete the handshake. Self-signed certificates are only suitable for local
//! testing - production deployments MUST use proper TLS certificates from a
//! trusted CA.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use quinn::{Endpoint, RecvStream, SendStream, ServerConfig};

use crate::{
    codec::{self, HEADER_SIZE},
    error::ServerError,
    sink::{MessageSink, SinkError},
};

/// ALPN identifier negotiated during the QUIC handshake.
pub const ALPN_PROTOCOL: &[u8] = b"relayhub";

/// QUIC transport using Quinn.
///
/// Provides a QUIC endpoint that can accept incoming connections. The endpoint
/// is configured with TLS 1.3 and ALPN protocol "relayhub".
///
/// # Security
///
/// TLS certificates must be valid and trusted in production. Self-signed
/// certificates (generated via `bind(addr, None, None)`) are only for testing
/// and will log a warning. Production deployments MUST use certificates from a
/// trusted CA to prevent MITM attacks.
pub struct QuinnTransport {
    /// Quinn endpoint
    endpoint: Endpoint,
}

impl QuinnTransport {
    /// Create and bind a new QUIC transport.
    ///
    /// If `cert_path` and `key_path` are provided, they will be used for TLS.
    /// Otherwise, a self-signed certificate will be generated for testing.
    pub fn bind(
        address: &str,
        cert_path: Option<String>,
        key_path: Option<String>,
    ) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid bind address '{address}': {e}")))?;

        let server_config = match (cert_path, key_path) {
            (Some(cert), Some(key)) => load_tls_config(&cert, &key)?,
            _ => generate_self_signed_config()?,
        };

        let endpoint = Endpoint::server(server_config, addr)
            .map_err(|e| ServerError::Transport(format!("failed to create endpoint: {e}")))?;

        tracing::info!("QUIC transport bound to {}", addr);

        Ok(Self { endpoint })
    }

    /// Wait for the next incoming connection attempt.
    ///
    /// Returns `None` once the endpoint stops accepting.
    pub async fn accept(&self) -> Option<quinn::Incoming> {
        self.endpoint.accept().await
    }

    /// Refuse new connections. Established connections are unaffected.
    pub fn stop_accepting(&self) {
        self.endpoint.set_server_config(None);
    }

    /// Close every connection and wait for the peers to be notified.
    pub async fn shutdown(&self) {
        self.endpoint.close(0u32.into(), b"server shutting down");
        self.endpoint.wait_idle().await;
    }

    /// Local address the transport is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.endpoint
            .local_addr()
            .map_err(|e| ServerError::Transport(format!("failed to get local address: {e}")))
    }
}

/// A QUIC connection wrapper.
///
/// Wraps Quinn's connection type and provides stream operations. Supports both
/// bidirectional streams (`accept_bi` for server-initiated) and unidirectional
/// streams (`open_uni` for server-to-client sends).
///
/// # Cloning
///
/// Clones are cheap and share the same underlying QUIC connection and can be
/// used concurrently. This enables passing the connection to multiple tasks for
/// parallel stream handling.
///
/// # Security
///
/// The connection is TLS-encrypted. All data sent over streams is authenticated
/// and encrypted. The remote peer's certificate is validated during the QUIC
/// handshake before this connection object is created.
#[derive(Clone)]
pub struct QuinnConnection {
    connection: quinn::Connection,
}

impl QuinnConnection {
    /// Complete the handshake of an incoming connection.
    pub async fn handshake(incoming: quinn::Incoming) -> Result<Self, ServerError> {
        let connection = incoming
            .await
            .map_err(|e| ServerError::Transport(format!("connection failed: {e}")))?;
        Ok(Self { connection })
    }

    /// Accept a bidirectional stream.
    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), ServerError> {
        self.connection
            .accept_bi()
            .await
            .map_err(|e| ServerError::Transport(format!("accept_bi failed: {e}")))
    }

    /// Open a unidirectional stream for sending.
    pub async fn open_uni(&self) -> Result<SendStream, ServerError> {
        self.connection
            .open_uni()
            .await
            .map_err(|e| ServerError::Transport(format!("open_uni failed: {e}")))
    }

    /// Remote peer address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }
}

/// Outbound half of a connection: one unidirectional stream carrying
/// length-prefixed messages.
pub struct QuinnSink {
    stream: SendStream,
    max_message_size: usize,
}

impl QuinnSink {
    /// Wrap a server-opened unidirectional stream.
    pub fn new(stream: SendStream, max_message_size: usize) -> Self {
        Self { stream, max_message_size }
    }
}

#[async_trait]
impl MessageSink for QuinnSink {
    async fn send(&mut self, message: Bytes) -> Result<(), SinkError> {
        let frame = codec::encode_to_bytes(&message, self.max_message_size)
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        self.stream.write_all(&frame).await.map_err(|e| match e {
            quinn::WriteError::ConnectionLost(_) | quinn::WriteError::ClosedStream => {
                SinkError::Closed
            },
            other => SinkError::Transport(other.to_string()),
        })
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.finish() {
            tracing::debug!(error = %e, "outbound stream already closed");
        }
    }
}

/// Read one length-prefixed message from `recv`.
///
/// Returns `Ok(None)` when the peer finished the stream cleanly between
/// messages.
///
/// # Errors
///
/// - `ServerError::Protocol` if the prefix claims more than `max` bytes
/// - `ServerError::Transport` if the stream fails or ends mid-message
pub async fn read_message(recv: &mut RecvStream, max: usize) -> Result<Option<Bytes>, ServerError> {
    let mut header = [0u8; HEADER_SIZE];
    match recv.read_exact(&mut header).await {
        Ok(()) => {},
        Err(quinn::ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(e) => return Err(ServerError::Transport(format!("read failed: {e}"))),
    }

    let size = codec::payload_len(header, max).map_err(|e| ServerError::Protocol(e.to_string()))?;

    let mut payload = BytesMut::zeroed(size);
    recv.read_exact(&mut payload)
        .await
        .map_err(|e| ServerError::Transport(format!("payload read failed: {e}")))?;
    Ok(Some(payload.freeze()))
}

/// Load TLS configuration from certificate and key files.
fn load_tls_config(cert_path: &str, key_path: &str) -> Result<ServerConfig, ServerError> {
    use std::fs;

    let cert_pem = fs::read(cert_path)
        .map_err(|e| ServerError::Config(format!("failed to read cert '{cert_path}': {e}")))?;

    let key_pem = fs::read(key_path)
        .map_err(|e| ServerError::Config(format!("failed to read key '{key_path}': {e}")))?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Config(format!("failed to parse certificates: {e}")))?;

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| ServerError::Config(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| ServerError::Config("no private key found".to_string()))?;

    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Config(format!("invalid TLS config: {e}")))?;

    tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
            .map_err(|e| ServerError::Config(format!("QUIC config error: {e}")))?,
    ));

    Ok(server_config)
}

/// Generate a self-signed certificate for testing.
fn generate_self_signed_config() -> Result<ServerConfig, ServerError> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| ServerError::Config(format!("failed to generate self-signed cert: {e}")))?;

    let cert_der = cert.cert.der().clone();
    let key_der = cert.key_pair.serialize_der();

    let cert_chain = vec![cert_der];
    let key = rustls::pki_types::PrivatePkcs8KeyDer::from(key_der);

    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key.into())
        .map_err(|e| ServerError::Config(format!("invalid TLS config: {e}")))?;

    tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
            .map_err(|e| ServerError::Config(format!("QUIC config error: {e}")))?,
    ));

    tracing::warn!("Using self-signed certificate - not for production use!");

    Ok(server_config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transport_binds_with_self_signed() {
        let transport = QuinnTransport::bind("127.0.0.1:0", None, None);
        assert!(transport.is_ok(), "Transport should bind with self-signed cert");

        let transport = transport.unwrap();
        let addr = transport.local_addr().unwrap();
        assert_ne!(addr.port(), 0, "Should have assigned a port");
    }

    #[tokio::test]
    async fn transport_rejects_invalid_address() {
        let result = QuinnTransport::bind("invalid:address:format", None, None);
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn transport_rejects_missing_cert_files() {
        let result = QuinnTransport::bind(
            "127.0.0.1:0",
            Some("/nonexistent/cert.pem".to_string()),
            Some("/nonexistent/key.pem".to_string()),
        );
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn stopped_transport_still_reports_address() {
        let transport = QuinnTransport::bind("127.0.0.1:0", None, None).unwrap();
        transport.stop_accepting();
        assert!(transport.local_addr().is_ok());
    }
}
