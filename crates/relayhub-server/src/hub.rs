//! Connection hub: registry and broadcast fan-out.
//!
//! All registry mutations go through one owner task consuming an ordered
//! command channel. [`Hub`] is the cheap, cloneable handle callers use; the
//! owner (`HubWorker`) is the only code that ever touches the map.
//!
//! # Ordering
//!
//! Commands are processed in submission order. A `register` that completes
//! before a `broadcast` is submitted is included in it; an `unregister` that
//! completes first is excluded.
//!
//! # Backpressure
//!
//! Broadcast enqueues onto each connection's [`OutboundQueue`] without
//! suspending. Each connection drains its own queue on its own task, so a
//! stalled peer never holds up the owner or other peers. Overflow is handled
//! per [`OverflowPolicy`].

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use relayhub_core::{Connection, ConnectionError, ConnectionId, Environment};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    outbound::{
        DeliveryFailure, DeliveryReport, OutboundQueue, OverflowPolicy, PushOutcome, deliver,
    },
    sink::MessageSink,
};

/// Pending commands the owner task will buffer before submitters suspend.
pub const DEFAULT_COMMAND_CAPACITY: usize = 1024;

/// Messages buffered per connection before the overflow policy applies.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Time allowed for pending outbound messages to drain when closing.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Hub configuration
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the owner's command channel
    pub command_capacity: usize,
    /// Capacity of each connection's outbound queue
    pub outbound_capacity: usize,
    /// What to do when an outbound queue is full
    pub overflow_policy: OverflowPolicy,
    /// Upper bound on flushing a closing connection
    pub flush_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_capacity: DEFAULT_COMMAND_CAPACITY,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }
}

/// Errors returned by hub operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    /// Duplicate connection id. Indicates broken id generation.
    #[error("connection already registered: {0}")]
    AlreadyRegistered(ConnectionId),

    /// The hub was closed and its owner task has exited.
    #[error("hub closed")]
    Closed,

    /// Connection state machine rejected a transition.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Point-in-time hub counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Registered connections
    pub connections: usize,
    /// Registered connections that have lost at least one message
    pub degraded: usize,
    /// Messages discarded under [`OverflowPolicy::DropOldest`]
    pub messages_dropped: u64,
    /// Connections closed because they could not keep up or their transport
    /// failed
    pub delivery_failures: u64,
}

/// Which registered connections a broadcast targets.
#[derive(Debug)]
enum Target {
    All,
    Except(ConnectionId),
    Only(HashSet<ConnectionId>),
}

impl Target {
    fn includes(&self, id: ConnectionId) -> bool {
        match self {
            Self::All => true,
            Self::Except(excluded) => *excluded != id,
            Self::Only(ids) => ids.contains(&id),
        }
    }
}

enum Command {
    Register {
        id: Option<ConnectionId>,
        sink: Box<dyn MessageSink>,
        reply: oneshot::Sender<Result<ConnectionId, HubError>>,
    },
    Unregister {
        id: ConnectionId,
        reply: oneshot::Sender<()>,
    },
    Broadcast {
        message: Bytes,
        target: Target,
        reply: oneshot::Sender<usize>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
    CloseAll {
        flush_timeout: Duration,
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to a running hub.
///
/// Clones share the same owner task. When the last handle is dropped the owner
/// closes every connection and exits.
#[derive(Clone, Debug)]
pub struct Hub {
    commands: mpsc::Sender<Command>,
}

impl Hub {
    /// Spawn the owner task on the current Tokio runtime.
    pub fn spawn<E: Environment>(config: HubConfig, env: E) -> Self {
        let (commands, rx) = mpsc::channel(config.command_capacity.max(1));
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();

        let worker = HubWorker {
            env,
            config,
            commands: rx,
            failures_tx,
            failures_rx,
            entries: HashMap::new(),
            order: Vec::new(),
            next_epoch: 0,
            messages_dropped: 0,
            delivery_failures: 0,
        };
        tokio::spawn(worker.run());

        Self { commands }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, HubError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(command(reply)).await.map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Register a connection under a freshly generated id.
    pub async fn register(&self, sink: impl MessageSink) -> Result<ConnectionId, HubError> {
        let sink: Box<dyn MessageSink> = Box::new(sink);
        self.request(|reply| Command::Register { id: None, sink, reply }).await?
    }

    /// Register a connection under an id chosen by the caller.
    ///
    /// # Errors
    ///
    /// - `HubError::AlreadyRegistered` if `id` is live
    /// - `HubError::Closed` after [`Hub::close_all`]
    pub async fn register_with_id(
        &self,
        id: ConnectionId,
        sink: impl MessageSink,
    ) -> Result<(), HubError> {
        let sink: Box<dyn MessageSink> = Box::new(sink);
        self.request(|reply| Command::Register { id: Some(id), sink, reply }).await?.map(|_| ())
    }

    /// Remove a connection. Pending messages are still flushed.
    ///
    /// Unknown ids, repeated calls and calls after the hub closed are all
    /// no-ops.
    pub async fn unregister(&self, id: ConnectionId) {
        let _ = self.request(|reply| Command::Unregister { id, reply }).await;
    }

    /// Enqueue `message` for every registered connection.
    ///
    /// Returns how many connections accepted it. Per-connection failures
    /// close that connection and are not reported here.
    pub async fn broadcast(&self, message: impl Into<Bytes>) -> Result<usize, HubError> {
        self.fan_out(message.into(), Target::All).await
    }

    /// Broadcast to everyone except `exclude` (usually the sender).
    pub async fn broadcast_except(
        &self,
        exclude: ConnectionId,
        message: impl Into<Bytes>,
    ) -> Result<usize, HubError> {
        self.fan_out(message.into(), Target::Except(exclude)).await
    }

    /// Broadcast to the listed connections. Unknown ids are skipped.
    pub async fn broadcast_to(
        &self,
        ids: impl IntoIterator<Item = ConnectionId>,
        message: impl Into<Bytes>,
    ) -> Result<usize, HubError> {
        self.fan_out(message.into(), Target::Only(ids.into_iter().collect())).await
    }

    /// Send to a single connection. Returns `false` if it is not registered
    /// or could not accept the message.
    pub async fn send(
        &self,
        id: ConnectionId,
        message: impl Into<Bytes>,
    ) -> Result<bool, HubError> {
        let target = Target::Only(HashSet::from([id]));
        Ok(self.fan_out(message.into(), target).await? == 1)
    }

    async fn fan_out(&self, message: Bytes, target: Target) -> Result<usize, HubError> {
        self.request(|reply| Command::Broadcast { message, target, reply }).await
    }

    /// Number of registered connections. Zero once the hub is closed.
    pub async fn count(&self) -> usize {
        self.request(|reply| Command::Count { reply }).await.unwrap_or(0)
    }

    /// Snapshot of hub counters.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Close every connection, flushing for at most the configured flush
    /// timeout, and stop the owner task.
    ///
    /// Returns the number of connections closed. Calling it again returns 0.
    pub async fn close_all(&self) -> usize {
        self.close_all_within(Duration::MAX).await
    }

    /// Like [`Hub::close_all`], with the flush bounded by
    /// `min(limit, flush_timeout)`.
    pub async fn close_all_within(&self, limit: Duration) -> usize {
        self.request(|reply| Command::CloseAll { flush_timeout: limit, reply }).await.unwrap_or(0)
    }

    /// Whether the owner task has exited.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Registry entry for one live connection.
struct Entry<I>
where
    I: Copy + Ord + std::ops::Sub<Output = Duration>,
{
    conn: Connection<I>,
    queue: Arc<OutboundQueue>,
    delivery: JoinHandle<()>,
    epoch: u64,
}

/// The single owner of the registry.
struct HubWorker<E: Environment> {
    env: E,
    config: HubConfig,
    commands: mpsc::Receiver<Command>,
    failures_tx: mpsc::UnboundedSender<DeliveryReport>,
    failures_rx: mpsc::UnboundedReceiver<DeliveryReport>,
    entries: HashMap<ConnectionId, Entry<E::Instant>>,
    /// Registration order, for deterministic fan-out
    order: Vec<ConnectionId>,
    next_epoch: u64,
    messages_dropped: u64,
    delivery_failures: u64,
}

impl<E: Environment> HubWorker<E> {
    async fn run(mut self) {
        tracing::debug!("hub started");

        loop {
            tokio::select! {
                biased;

                Some(report) = self.failures_rx.recv() => self.handle_failure(report),

                command = self.commands.recv() => match command {
                    Some(Command::CloseAll { flush_timeout, reply }) => {
                        let closed = self.close_all(flush_timeout).await;
                        let _ = reply.send(closed);
                        break;
                    },
                    Some(command) => self.handle(command),
                    None => {
                        self.close_all(self.config.flush_timeout).await;
                        break;
                    },
                },
            }
        }

        tracing::debug!("hub stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register { id, sink, reply } => {
                let _ = reply.send(self.register(id, sink));
            },
            Command::Unregister { id, reply } => {
                if self.remove(id, false) {
                    tracing::debug!(%id, "connection unregistered");
                }
                let _ = reply.send(());
            },
            Command::Broadcast { message, target, reply } => {
                let _ = reply.send(self.broadcast(&message, &target));
            },
            Command::Count { reply } => {
                let _ = reply.send(self.entries.len());
            },
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            },
            // Handled in run(): it ends the loop
            Command::CloseAll { reply, .. } => {
                let _ = reply.send(0);
            },
        }
    }

    /// Generate an id not held by any live connection.
    fn fresh_id(&self) -> ConnectionId {
        loop {
            let id = self.env.connection_id();
            if !self.entries.contains_key(&id) {
                return id;
            }
            tracing::debug!(%id, "generated connection id collided, retrying");
        }
    }

    fn register(
        &mut self,
        id: Option<ConnectionId>,
        sink: Box<dyn MessageSink>,
    ) -> Result<ConnectionId, HubError> {
        let id = match id {
            Some(id) if self.entries.contains_key(&id) => {
                tracing::warn!(%id, "duplicate connection id");
                return Err(HubError::AlreadyRegistered(id));
            },
            Some(id) => id,
            None => self.fresh_id(),
        };

        let now = self.env.now();
        let mut conn = Connection::new(id);
        conn.activate(now)?;

        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let queue =
            Arc::new(OutboundQueue::new(self.config.outbound_capacity, self.config.overflow_policy));
        let delivery =
            tokio::spawn(deliver(id, epoch, Arc::clone(&queue), sink, self.failures_tx.clone()));

        self.entries.insert(id, Entry { conn, queue, delivery, epoch });
        self.order.push(id);

        tracing::debug!(%id, connections = self.entries.len(), "connection registered");
        Ok(id)
    }

    fn broadcast(&mut self, message: &Bytes, target: &Target) -> usize {
        let mut accepted = 0;
        let mut overflowed = Vec::new();

        for id in &self.order {
            if !target.includes(*id) {
                continue;
            }
            let Some(entry) = self.entries.get_mut(id) else {
                continue;
            };

            match entry.queue.push(message.clone()) {
                PushOutcome::Queued => accepted += 1,
                PushOutcome::DroppedOldest => {
                    accepted += 1;
                    self.messages_dropped += 1;
                    if !entry.conn.is_degraded() {
                        tracing::warn!(%id, "outbound queue full, dropping oldest messages");
                        entry.conn.mark_degraded();
                    }
                },
                PushOutcome::Overflow => overflowed.push(*id),
                // Delivery task already failed; its report is on the way
                PushOutcome::Closed => {},
            }
        }

        for id in overflowed {
            tracing::warn!(%id, failure = %DeliveryFailure::Overflow, "closing slow connection");
            self.delivery_failures += 1;
            self.remove(id, true);
        }

        accepted
    }

    fn handle_failure(&mut self, report: DeliveryReport) {
        let current = self.entries.get(&report.id).is_some_and(|e| e.epoch == report.epoch);
        if !current {
            return;
        }
        tracing::warn!(id = %report.id, failure = %report.failure, "closing failed connection");
        self.delivery_failures += 1;
        self.remove(report.id, true);
    }

    /// Take a connection out of the registry and move it to `Closing`.
    ///
    /// With `discard`, pending messages are dropped; otherwise they are
    /// flushed within the flush timeout. The transition to `Closed` happens
    /// on a separate task once delivery finishes.
    fn remove(&mut self, id: ConnectionId, discard: bool) -> bool {
        let Some(mut entry) = self.entries.remove(&id) else {
            return false;
        };
        self.order.retain(|other| *other != id);

        if let Err(e) = entry.conn.begin_close() {
            tracing::warn!(%id, error = %e, "unexpected state on removal");
        }
        if discard {
            entry.queue.discard();
        } else {
            entry.queue.close();
        }

        let env = self.env.clone();
        let flush_timeout = self.config.flush_timeout;
        tokio::spawn(async move { finalize(entry, &env, flush_timeout).await });
        true
    }

    async fn close_all(&mut self, limit: Duration) -> usize {
        let flush_timeout = limit.min(self.config.flush_timeout);
        let mut closing = Vec::with_capacity(self.order.len());

        for id in self.order.drain(..) {
            let Some(mut entry) = self.entries.remove(&id) else {
                continue;
            };
            if let Err(e) = entry.conn.begin_close() {
                tracing::warn!(%id, error = %e, "unexpected state on close");
            }
            entry.queue.close();
            closing.push(entry);
        }

        let count = closing.len();
        tracing::info!(connections = count, ?flush_timeout, "closing all connections");

        let env = &self.env;
        futures::future::join_all(
            closing.into_iter().map(|entry| finalize(entry, env, flush_timeout)),
        )
        .await;

        count
    }

    fn stats(&self) -> HubStats {
        HubStats {
            connections: self.entries.len(),
            degraded: self.entries.values().filter(|e| e.conn.is_degraded()).count(),
            messages_dropped: self.messages_dropped,
            delivery_failures: self.delivery_failures,
        }
    }
}

/// Wait for a closing connection's delivery task, then mark it `Closed`.
///
/// A task still running after `flush_timeout` is aborted, which drops its
/// sink.
async fn finalize<E: Environment>(mut entry: Entry<E::Instant>, env: &E, flush_timeout: Duration) {
    let id = entry.conn.id();

    if tokio::time::timeout(flush_timeout, &mut entry.delivery).await.is_err() {
        tracing::warn!(%id, ?flush_timeout, "flush timed out, abandoning pending messages");
        entry.delivery.abort();
    }

    let now = env.now();
    match entry.conn.finish_close(now) {
        Ok(()) => tracing::debug!(
            %id,
            active_for = ?entry.conn.active_for(now),
            "connection closed"
        ),
        Err(e) => tracing::warn!(%id, error = %e, "unexpected state on finish"),
    }
}
