//! Shutdown coordinator integration tests.
//!
//! All timing tests run on a paused clock, so "about two seconds" is exactly
//! two seconds of virtual time.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use relayhub_server::{
    ChannelSink, CleanupError, CleanupOutcome, DrainOutcome, Hub, HubConfig, LifecycleState,
    ShutdownConfig, ShutdownCoordinator, ShutdownError, SystemEnv,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn setup() -> (Hub, ShutdownCoordinator) {
    let hub = Hub::spawn(HubConfig::default(), SystemEnv::new());
    let coordinator = ShutdownCoordinator::new(hub.clone(), ShutdownConfig::default());
    (hub, coordinator)
}

#[tokio::test(start_paused = true)]
async fn drain_waits_for_in_flight_request() {
    let (_hub, coord) = setup();

    let guard = coord.track().unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(guard);
    });

    let start = Instant::now();
    let report = coord.trigger(Duration::from_secs(5)).await;

    assert_eq!(report.drain, DrainOutcome::Idle);
    assert_eq!(start.elapsed(), Duration::from_secs(2));
    assert_eq!(coord.state(), LifecycleState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn drain_is_forced_at_budget() {
    let (_hub, coord) = setup();
    let _stuck = coord.track().unwrap();

    let start = Instant::now();
    let report = coord.trigger(Duration::from_secs(1)).await;

    assert_eq!(report.drain, DrainOutcome::TimedOut { remaining: 1 });
    assert_eq!(start.elapsed(), Duration::from_secs(1));
    assert_eq!(coord.state(), LifecycleState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn concurrent_triggers_share_one_drain() {
    let (_hub, coord) = setup();
    let runs = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&runs);
    coord
        .register_cleanup_task("count", Duration::from_secs(1), move |_cancel: CancellationToken| {
            async move {
                *counter.lock().unwrap() += 1;
                Ok::<(), CleanupError>(())
            }
        })
        .unwrap();

    let guard = coord.track().unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        drop(guard);
    });

    let (first, second) =
        tokio::join!(coord.trigger(Duration::from_secs(5)), coord.trigger(Duration::from_secs(9)));

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(*runs.lock().unwrap(), 1);
    assert_eq!(first.cleanup.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cleanup_runs_in_order_and_isolates_hangs() {
    let (_hub, coord) = setup();
    let order = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&order);
    coord
        .register_cleanup_task("hangs", Duration::from_secs(1), move |_cancel: CancellationToken| {
            async move {
                log.lock().unwrap().push("hangs");
                std::future::pending::<()>().await;
                Ok::<(), CleanupError>(())
            }
        })
        .unwrap();

    let log = Arc::clone(&order);
    coord
        .register_cleanup_task("flush", Duration::from_secs(1), move |_cancel: CancellationToken| {
            async move {
                log.lock().unwrap().push("flush");
                Ok::<(), CleanupError>(())
            }
        })
        .unwrap();

    let start = Instant::now();
    let report = coord.trigger(Duration::from_secs(10)).await;

    assert_eq!(*order.lock().unwrap(), vec!["hangs", "flush"]);
    assert_eq!(report.cleanup[0].outcome, CleanupOutcome::TimedOut);
    assert_eq!(report.cleanup[1].outcome, CleanupOutcome::Completed);
    assert_eq!(start.elapsed(), Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn budget_bounds_cleanup_too() {
    let (_hub, coord) = setup();
    coord
        .register_cleanup_task("slow", Duration::from_secs(60), |cancel: CancellationToken| async move {
            cancel.cancelled().await;
            Err::<(), CleanupError>("cancelled".into())
        })
        .unwrap();
    coord
        .register_cleanup_task("never", Duration::from_secs(60), |_cancel: CancellationToken| async {
            Ok::<(), CleanupError>(())
        })
        .unwrap();

    let start = Instant::now();
    let report = coord.trigger(Duration::from_secs(3)).await;

    assert_eq!(start.elapsed(), Duration::from_secs(3));
    assert_eq!(report.cleanup[0].outcome, CleanupOutcome::TimedOut);
    assert_eq!(report.cleanup[1].outcome, CleanupOutcome::Skipped);
}

#[tokio::test(start_paused = true)]
async fn mutations_rejected_after_stop() {
    let (_hub, coord) = setup();
    coord.trigger(Duration::from_secs(1)).await;

    assert_eq!(coord.track().unwrap_err(), ShutdownError::AlreadyStopped);
    let result = coord.register_cleanup_task(
        "late",
        Duration::from_secs(1),
        |_cancel: CancellationToken| async { Ok::<(), CleanupError>(()) },
    );
    assert_eq!(result, Err(ShutdownError::AlreadyStopped));
}

#[tokio::test(start_paused = true)]
async fn draining_allows_tracking_but_not_cleanup_registration() {
    let (_hub, coord) = setup();
    let holder = coord.track().unwrap();
    let token = coord.draining_token();
    assert!(!holder.is_draining());

    assert!(coord.initiate(Duration::from_secs(5)));
    assert_eq!(coord.state(), LifecycleState::Draining);
    assert!(token.is_cancelled());
    assert!(holder.is_draining());

    let follow_up = coord.track().unwrap();
    assert_eq!(coord.in_flight(), 2);

    let result = coord.register_cleanup_task(
        "too-late",
        Duration::from_secs(1),
        |_cancel: CancellationToken| async { Ok::<(), CleanupError>(()) },
    );
    assert_eq!(result, Err(ShutdownError::Draining));

    let health = coord.health().await;
    assert_eq!(health.state, LifecycleState::Draining);
    assert_eq!(health.in_flight, 2);
    assert!(!health.is_healthy());

    drop(holder);
    drop(follow_up);
    let report = coord.wait_stopped().await;
    assert_eq!(report.drain, DrainOutcome::Idle);
}

#[tokio::test(start_paused = true)]
async fn guard_wakes_on_draining() {
    let (_hub, coord) = setup();
    let guard = coord.track().unwrap();

    let worker = tokio::spawn(async move {
        guard.draining().await;
        "wound down"
    });

    let report = coord.trigger(Duration::from_secs(30)).await;

    assert_eq!(worker.await.unwrap(), "wound down");
    assert_eq!(report.drain, DrainOutcome::Idle);
    assert!(report.elapsed < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn stop_closes_hub_connections() {
    let (hub, coord) = setup();
    let (sink, mut rx) = ChannelSink::new(8);
    hub.register(sink).await.unwrap();
    hub.broadcast("bye").await.unwrap();

    let report = coord.trigger(Duration::from_secs(5)).await;

    assert_eq!(report.connections_closed, 1);
    assert_eq!(rx.recv().await, Some(Bytes::from("bye")));
    assert_eq!(rx.recv().await, None);
    assert_eq!(hub.count().await, 0);
    assert!(hub.is_closed());

    let health = coord.health().await;
    assert_eq!(health.state, LifecycleState::Stopped);
    assert_eq!(health.connections, 0);
}

#[tokio::test(start_paused = true)]
async fn forced_drain_still_runs_cleanup_and_closes_hub() {
    let (hub, coord) = setup();
    let (sink, mut rx) = ChannelSink::new(8);
    hub.register(sink).await.unwrap();
    coord
        .register_cleanup_task("flush-db", Duration::from_millis(100), |_cancel: CancellationToken| {
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<(), CleanupError>(())
            }
        })
        .unwrap();
    let _stuck = coord.track().unwrap();

    let start = Instant::now();
    let report = coord.trigger(Duration::from_secs(1)).await;

    assert_eq!(report.drain, DrainOutcome::TimedOut { remaining: 1 });
    assert_eq!(report.cleanup[0].outcome, CleanupOutcome::Completed);
    assert_eq!(report.connections_closed, 1);
    assert!(start.elapsed() <= Duration::from_secs(1));
    assert_eq!(rx.recv().await, None);
    assert_eq!(hub.count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn hub_close_reached_at_deadline_still_counts_connections() {
    let (hub, coord) = setup();
    let (sink, _rx) = ChannelSink::new(8);
    hub.register(sink).await.unwrap();
    coord
        .register_cleanup_task("hangs", Duration::from_millis(100), |_cancel: CancellationToken| {
            async {
                std::future::pending::<()>().await;
                Ok::<(), CleanupError>(())
            }
        })
        .unwrap();
    let _stuck = coord.track().unwrap();

    let start = Instant::now();
    let report = coord.trigger(Duration::from_secs(1)).await;

    assert_eq!(start.elapsed(), Duration::from_secs(1));
    assert_eq!(report.cleanup[0].outcome, CleanupOutcome::TimedOut);
    assert_eq!(report.connections_closed, 1);
    assert_eq!(hub.count().await, 0);
}
