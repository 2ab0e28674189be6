//! Relayhub server binary.
//!
//! # Usage
//!
//! ```bash
//! # Start with self-signed certificate (development)
//! relayhub-server --bind 0.0.0.0:4433
//!
//! # Start with TLS certificate (production)
//! relayhub-server --bind 0.0.0.0:4433 --cert cert.pem --key key.pem
//! ```
//!
//! SIGINT or SIGTERM starts a graceful shutdown. Repeated signals are ignored
//! while it runs.

use std::time::Duration;

use clap::{Parser, ValueEnum};
use relayhub_server::{
    CleanupError, HubConfig, OverflowPolicy, Server, ServerRuntimeConfig, ShutdownConfig,
    ShutdownCoordinator,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Overflow policy as accepted on the command line
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OverflowArg {
    /// Close connections that cannot keep up
    Disconnect,
    /// Drop their oldest pending messages instead
    DropOldest,
}

impl From<OverflowArg> for OverflowPolicy {
    fn from(arg: OverflowArg) -> Self {
        match arg {
            OverflowArg::Disconnect => Self::Disconnect,
            OverflowArg::DropOldest => Self::DropOldest,
        }
    }
}

/// Relayhub message relay server
#[derive(Parser, Debug)]
#[command(name = "relayhub-server")]
#[command(about = "QUIC message relay with graceful shutdown")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:4433")]
    bind: String,

    /// Path to TLS certificate (PEM format)
    #[arg(short, long)]
    cert: Option<String>,

    /// Path to TLS private key (PEM format)
    #[arg(short, long)]
    key: Option<String>,

    /// Messages buffered per connection
    #[arg(long, default_value = "256")]
    outbound_capacity: usize,

    /// What to do when a connection's buffer is full
    #[arg(long, value_enum, default_value = "disconnect")]
    overflow: OverflowArg,

    /// Largest message payload in bytes
    #[arg(long, default_value = "1048576")]
    max_message_size: usize,

    /// Seconds between shutdown signal and exit
    #[arg(long, default_value = "30")]
    drain_secs: u64,

    /// Seconds allowed for flushing each connection on close
    #[arg(long, default_value = "5")]
    flush_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Relayhub server starting");
    tracing::info!("Binding to {}", args.bind);

    if args.cert.is_none() || args.key.is_none() {
        tracing::warn!("No TLS certificate provided - using self-signed certificate");
        tracing::warn!("This is NOT suitable for production use!");
    }

    let drain_budget = Duration::from_secs(args.drain_secs);
    let config = ServerRuntimeConfig {
        bind_address: args.bind,
        cert_path: args.cert,
        key_path: args.key,
        hub: HubConfig {
            outbound_capacity: args.outbound_capacity,
            overflow_policy: args.overflow.into(),
            flush_timeout: Duration::from_secs(args.flush_secs),
            ..HubConfig::default()
        },
        shutdown: ShutdownConfig { drain_budget },
        max_message_size: args.max_message_size,
    };

    let server = Server::bind(config)?;
    tracing::info!("Server listening on {}", server.local_addr()?);

    let coordinator = server.coordinator().clone();
    register_cleanup(&coordinator)?;
    tokio::spawn(watch_signals(coordinator, drain_budget));

    let report = server.run().await?;
    tracing::info!(
        drain = ?report.drain,
        connections_closed = report.connections_closed,
        elapsed = ?report.elapsed,
        "Server stopped"
    );

    Ok(())
}

/// Cleanup the binary itself needs on the way out.
fn register_cleanup(coordinator: &ShutdownCoordinator) -> Result<(), Box<dyn std::error::Error>> {
    let status = coordinator.clone();
    coordinator.register_cleanup_task(
        "log-final-health",
        Duration::from_secs(1),
        move |_cancel: CancellationToken| async move {
            let health = status.health().await;
            tracing::info!(
                state = %health.state,
                in_flight = health.in_flight,
                connections = health.connections,
                "final health before closing connections"
            );
            Ok::<(), CleanupError>(())
        },
    )?;
    Ok(())
}

/// Trigger shutdown on the first SIGINT or SIGTERM.
async fn watch_signals(coordinator: ShutdownCoordinator, budget: Duration) {
    wait_for_signal().await;
    tracing::info!(?budget, "shutdown signal received");

    let repeat = tokio::spawn(async {
        loop {
            wait_for_signal().await;
            tracing::warn!("shutdown already in progress");
        }
    });

    coordinator.trigger(budget).await;
    repeat.abort();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = term.recv() => {},
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, listening for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        },
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
