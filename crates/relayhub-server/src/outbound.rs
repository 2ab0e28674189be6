//! Per-connection outbound queue and delivery task.
//!
//! The hub owner is the only producer of a queue; the connection's delivery
//! task is the only consumer. Pushing never suspends, so a slow peer can only
//! ever fill its own queue. What happens when it is full is decided by the
//! hub-wide [`OverflowPolicy`].

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use bytes::Bytes;
use relayhub_core::ConnectionId;
use tokio::sync::{Notify, mpsc};

use crate::sink::MessageSink;

/// What to do when a connection's outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Treat the overflow as a delivery failure and close the connection.
    #[default]
    Disconnect,
    /// Discard the oldest pending message and mark the connection degraded.
    DropOldest,
}

/// Result of offering a message to a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    /// Appended without loss
    Queued,
    /// Appended after evicting the oldest message
    DroppedOldest,
    /// Rejected: queue full under [`OverflowPolicy::Disconnect`]
    Overflow,
    /// Rejected: queue already closed
    Closed,
}

/// Why a connection's delivery failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeliveryFailure {
    /// Outbound queue overflowed
    Overflow,
    /// Sink returned an error
    Transport(String),
}

impl std::fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Overflow => f.write_str("outbound queue overflow"),
            Self::Transport(reason) => write!(f, "transport: {reason}"),
        }
    }
}

/// Failure notice sent from a delivery task back to the hub owner.
#[derive(Debug)]
pub(crate) struct DeliveryReport {
    pub id: ConnectionId,
    /// Registration epoch, so a stale report never closes a re-registered id
    pub epoch: u64,
    pub failure: DeliveryFailure,
}

#[derive(Debug, Default)]
struct QueueInner {
    messages: VecDeque<Bytes>,
    closed: bool,
}

/// Bounded message queue with one producer and one consumer.
///
/// A short-held mutex around a `VecDeque` rather than `tokio::sync::mpsc`:
/// `DropOldest` has to evict from the head of the queue, which a channel
/// sender cannot do.
#[derive(Debug)]
pub(crate) struct OutboundQueue {
    inner: Mutex<QueueInner>,
    ready: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            ready: Notify::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer a message without suspending.
    pub fn push(&self, message: Bytes) -> PushOutcome {
        let outcome = {
            let mut inner = self.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }

            if inner.messages.len() < self.capacity {
                inner.messages.push_back(message);
                PushOutcome::Queued
            } else {
                match self.policy {
                    OverflowPolicy::Disconnect => return PushOutcome::Overflow,
                    OverflowPolicy::DropOldest => {
                        inner.messages.pop_front();
                        inner.messages.push_back(message);
                        PushOutcome::DroppedOldest
                    },
                }
            }
        };

        self.ready.notify_one();
        outcome
    }

    /// Stop accepting messages. Already queued messages are still delivered.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_one();
    }

    /// Stop accepting messages and throw away everything pending.
    ///
    /// Returns the number of messages discarded.
    pub fn discard(&self) -> usize {
        let dropped = {
            let mut inner = self.lock();
            inner.closed = true;
            let dropped = inner.messages.len();
            inner.messages.clear();
            dropped
        };
        self.ready.notify_one();
        dropped
    }

    /// Next message, or `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<Bytes> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(message) = inner.messages.pop_front() {
                    return Some(message);
                }
                if inner.closed {
                    return None;
                }
            }
            // notify_one stores a permit, so a push between the check above
            // and this await is not lost.
            self.ready.notified().await;
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }
}

/// Delivery task body: drain `queue` into `sink` until the queue closes or
/// the sink fails.
///
/// On failure the queue is discarded and the hub owner is told, which moves
/// the connection to `Closing`. The sink is closed and dropped on every exit
/// path.
pub(crate) async fn deliver(
    id: ConnectionId,
    epoch: u64,
    queue: Arc<OutboundQueue>,
    mut sink: Box<dyn MessageSink>,
    failures: mpsc::UnboundedSender<DeliveryReport>,
) {
    let mut delivered: u64 = 0;

    while let Some(message) = queue.pop().await {
        if let Err(e) = sink.send(message).await {
            let dropped = queue.discard();
            tracing::warn!(%id, error = %e, dropped, "delivery failed");
            // Hub owner gone means close_all already took this connection.
            let _ = failures.send(DeliveryReport {
                id,
                epoch,
                failure: DeliveryFailure::Transport(e.to_string()),
            });
            break;
        }
        delivered += 1;
    }

    sink.close().await;
    tracing::debug!(%id, delivered, "delivery task finished");
}
