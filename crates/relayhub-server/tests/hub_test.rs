//! Hub integration tests.
//!
//! Connections are in-process [`ChannelSink`]s, so a receiver that is never
//! read behaves exactly like a stalled network peer.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use relayhub_server::{
    ChannelSink, ConnectionId, Environment, Hub, HubConfig, HubError, OverflowPolicy,
};
use tokio::{sync::mpsc, time::timeout};

/// Deterministic environment: sequential connection ids, real clock.
#[derive(Clone, Default)]
struct SeqEnv {
    next: Arc<AtomicU64>,
}

impl Environment for SeqEnv {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        buffer.fill(0);
    }

    fn connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

fn hub() -> Hub {
    Hub::spawn(HubConfig::default(), SeqEnv::default())
}

fn hub_with(outbound_capacity: usize, overflow_policy: OverflowPolicy) -> Hub {
    let config = HubConfig {
        outbound_capacity,
        overflow_policy,
        flush_timeout: Duration::from_millis(100),
        ..HubConfig::default()
    };
    Hub::spawn(config, SeqEnv::default())
}

async fn recv(rx: &mut mpsc::Receiver<Bytes>) -> Option<Bytes> {
    timeout(Duration::from_secs(1), rx.recv()).await.expect("receive timed out")
}

#[tokio::test]
async fn hello_world_scenario() {
    let hub = hub();
    let (a_sink, mut a) = ChannelSink::new(8);
    let (b_sink, mut b) = ChannelSink::new(8);
    let (c_sink, mut c) = ChannelSink::new(8);

    let a_id = hub.register(a_sink).await.unwrap();
    hub.register(b_sink).await.unwrap();
    hub.register(c_sink).await.unwrap();

    assert_eq!(hub.broadcast("hello").await.unwrap(), 3);
    hub.unregister(a_id).await;
    assert_eq!(hub.broadcast("world").await.unwrap(), 2);

    assert_eq!(recv(&mut a).await, Some(Bytes::from("hello")));
    assert_eq!(recv(&mut a).await, None, "A was unregistered before world");

    for rx in [&mut b, &mut c] {
        assert_eq!(recv(rx).await, Some(Bytes::from("hello")));
        assert_eq!(recv(rx).await, Some(Bytes::from("world")));
    }
}

#[tokio::test]
async fn count_tracks_registrations() {
    let hub = hub();
    assert_eq!(hub.count().await, 0);

    let (s1, _r1) = ChannelSink::new(1);
    let (s2, _r2) = ChannelSink::new(1);
    let id1 = hub.register(s1).await.unwrap();
    hub.register(s2).await.unwrap();
    assert_eq!(hub.count().await, 2);

    hub.unregister(id1).await;
    assert_eq!(hub.count().await, 1);
}

#[tokio::test]
async fn duplicate_id_is_rejected() {
    let hub = hub();
    let id = ConnectionId::new(7);
    let (s1, _r1) = ChannelSink::new(1);
    let (s2, _r2) = ChannelSink::new(1);

    hub.register_with_id(id, s1).await.unwrap();
    assert_eq!(hub.register_with_id(id, s2).await, Err(HubError::AlreadyRegistered(id)));
    assert_eq!(hub.count().await, 1);
}

#[tokio::test]
async fn generated_id_skips_live_ids() {
    let hub = hub();
    let (s1, _r1) = ChannelSink::new(1);
    let (s2, _r2) = ChannelSink::new(1);

    hub.register_with_id(ConnectionId::new(1), s1).await.unwrap();
    let id = hub.register(s2).await.unwrap();

    assert_eq!(id, ConnectionId::new(2));
    assert_eq!(hub.count().await, 2);
}

#[tokio::test]
async fn unregister_is_idempotent() {
    let hub = hub();
    let (sink, _rx) = ChannelSink::new(1);
    let id = hub.register(sink).await.unwrap();

    hub.unregister(id).await;
    hub.unregister(id).await;
    hub.unregister(ConnectionId::new(9999)).await;
    assert_eq!(hub.count().await, 0);
}

#[tokio::test]
async fn subset_and_unicast_delivery() {
    let hub = hub();
    let (a_sink, mut a) = ChannelSink::new(8);
    let (b_sink, mut b) = ChannelSink::new(8);
    let (c_sink, mut c) = ChannelSink::new(8);
    let a_id = hub.register(a_sink).await.unwrap();
    hub.register(b_sink).await.unwrap();
    let c_id = hub.register(c_sink).await.unwrap();

    assert_eq!(hub.broadcast_except(a_id, "relay").await.unwrap(), 2);
    assert_eq!(hub.broadcast_to([a_id, ConnectionId::new(4242)], "subset").await.unwrap(), 1);
    assert!(hub.send(c_id, "direct").await.unwrap());
    assert!(!hub.send(ConnectionId::new(4242), "nobody").await.unwrap());

    hub.close_all().await;

    assert_eq!(recv(&mut a).await, Some(Bytes::from("subset")));
    assert_eq!(recv(&mut a).await, None);
    assert_eq!(recv(&mut b).await, Some(Bytes::from("relay")));
    assert_eq!(recv(&mut b).await, None);
    assert_eq!(recv(&mut c).await, Some(Bytes::from("relay")));
    assert_eq!(recv(&mut c).await, Some(Bytes::from("direct")));
    assert_eq!(recv(&mut c).await, None);
}

#[tokio::test]
async fn slow_consumer_is_disconnected_without_delaying_others() {
    let hub = hub_with(4, OverflowPolicy::Disconnect);
    let (slow_sink, _slow_rx) = ChannelSink::new(1);
    let (fast_sink, mut fast) = ChannelSink::new(64);
    hub.register(slow_sink).await.unwrap();
    hub.register(fast_sink).await.unwrap();

    for i in 0..8u8 {
        hub.broadcast(vec![i]).await.unwrap();
        tokio::task::yield_now().await;
    }

    for i in 0..8u8 {
        assert_eq!(recv(&mut fast).await, Some(Bytes::from(vec![i])));
    }

    let stats = hub.stats().await.unwrap();
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.delivery_failures, 1);
}

#[tokio::test]
async fn drop_oldest_keeps_slow_consumer_registered() {
    let hub = hub_with(2, OverflowPolicy::DropOldest);
    let (slow_sink, _slow_rx) = ChannelSink::new(1);
    let (fast_sink, _fast_rx) = ChannelSink::new(64);
    hub.register(slow_sink).await.unwrap();
    hub.register(fast_sink).await.unwrap();

    for i in 0..8u8 {
        assert_eq!(hub.broadcast(vec![i]).await.unwrap(), 2);
    }

    let stats = hub.stats().await.unwrap();
    assert_eq!(stats.connections, 2);
    assert_eq!(stats.degraded, 1);
    assert!(stats.messages_dropped > 0);
    assert_eq!(stats.delivery_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn full_queue_does_not_delay_new_registrations() {
    let hub = hub_with(2, OverflowPolicy::DropOldest);
    let (stalled, _stalled_rx) = ChannelSink::new(1);
    hub.register(stalled).await.unwrap();
    for i in 0..8u8 {
        hub.broadcast(vec![i]).await.unwrap();
    }
    assert_eq!(hub.stats().await.unwrap().degraded, 1);

    let start = tokio::time::Instant::now();
    let (late, mut late_rx) = ChannelSink::new(8);
    let late_id = hub.register(late).await.unwrap();
    assert!(hub.send(late_id, "welcome").await.unwrap());
    assert_eq!(hub.broadcast("everyone").await.unwrap(), 2);

    assert_eq!(recv(&mut late_rx).await, Some(Bytes::from("welcome")));
    assert_eq!(recv(&mut late_rx).await, Some(Bytes::from("everyone")));
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test]
async fn failed_transport_is_removed() {
    let hub = hub();
    let (sink, rx) = ChannelSink::new(1);
    hub.register(sink).await.unwrap();
    drop(rx);

    hub.broadcast("into the void").await.unwrap();

    timeout(Duration::from_secs(1), async {
        while hub.count().await > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("failed connection was never removed");
    assert_eq!(hub.stats().await.unwrap().delivery_failures, 1);
}

#[tokio::test]
async fn close_all_flushes_then_closes_hub() {
    let hub = hub();
    let (sink, mut rx) = ChannelSink::new(16);
    hub.register(sink).await.unwrap();
    for msg in ["one", "two", "three"] {
        hub.broadcast(msg).await.unwrap();
    }

    assert_eq!(hub.close_all().await, 1);

    assert_eq!(recv(&mut rx).await, Some(Bytes::from("one")));
    assert_eq!(recv(&mut rx).await, Some(Bytes::from("two")));
    assert_eq!(recv(&mut rx).await, Some(Bytes::from("three")));
    assert_eq!(recv(&mut rx).await, None);

    let (late, _late_rx) = ChannelSink::new(1);
    assert_eq!(hub.register(late).await, Err(HubError::Closed));
    assert_eq!(hub.broadcast("late").await, Err(HubError::Closed));
    assert_eq!(hub.count().await, 0);
    hub.unregister(ConnectionId::new(1)).await;
    assert_eq!(hub.close_all().await, 0);
    assert!(hub.is_closed());
}

#[tokio::test(start_paused = true)]
async fn close_all_abandons_stalled_flush() {
    let hub = hub_with(8, OverflowPolicy::Disconnect);
    let (stalled, _rx) = ChannelSink::new(1);
    hub.register(stalled).await.unwrap();
    for i in 0..4u8 {
        hub.broadcast(vec![i]).await.unwrap();
    }

    let start = tokio::time::Instant::now();
    assert_eq!(hub.close_all_within(Duration::from_millis(50)).await, 1);
    assert_eq!(start.elapsed(), Duration::from_millis(50));
}
