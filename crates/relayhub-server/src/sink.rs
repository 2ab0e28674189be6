//! Transport seam for outbound delivery.
//!
//! The hub never touches a transport directly. Each registered connection
//! hands over a [`MessageSink`], which is then owned exclusively by that
//! connection's delivery task. When the task exits the sink is dropped, so
//! nothing can write to a closed connection's transport.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors a sink can report while writing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The remote side is gone.
    #[error("sink closed")]
    Closed,

    /// The transport failed mid-write.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Write half of a duplex connection.
///
/// Implementations may suspend in `send` (slow peer, full socket buffer).
/// That only stalls the owning connection's delivery task.
#[async_trait]
pub trait MessageSink: Send + 'static {
    /// Write one opaque message to the peer.
    async fn send(&mut self, message: Bytes) -> Result<(), SinkError>;

    /// Flush and release the transport. Called once, after the last `send`.
    async fn close(&mut self) {}
}

/// In-process sink backed by a bounded channel.
///
/// Useful for embedding the hub behind a transport that already exposes a
/// channel, and for tests. A receiver that stops reading behaves exactly like
/// a slow network peer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    /// Create a sink and the receiver that observes delivered messages.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send(&mut self, message: Bytes) -> Result<(), SinkError> {
        self.tx.send(message).await.map_err(|_| SinkError::Closed)
    }
}
