//! Millrace agent registry daemon.
//!
//! Consumes the control topic from the beginning of retained history,
//! rebuilds the agent presence table, and serves the read API.
//!
//! # Graceful Shutdown
//!
//! SIGINT (Ctrl+C) and SIGTERM stop the control consumer (letting any
//! in-flight message finish), then stop the HTTP server.

use anyhow::{Context, Result};
use millrace_core::Mailbox;
use millrace_ingest::{
    CheckpointPolicy, ConsumerConfig, FileLog, FileLogConfig, MemoryCheckpointStore,
    StartPosition, StreamProcessor,
};
use millrace_registry::{AgentRegistry, AppState, Config, ControlHandler, router};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<()> {
    if std::path::Path::new(".env").exists() {
        dotenvy::dotenv().context("failed to load .env file")?;
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    if config.metrics_port > 0 {
        let handle = millrace_core::metrics::init_metrics();
        millrace_core::metrics::start_metrics_server(config.metrics_port, handle)
            .await
            .context("failed to start metrics server")?;
    }

    let registry = Arc::new(AgentRegistry::new());
    let status = Mailbox::new();

    // The registry replays the whole control topic on every start to
    // rebuild the in-memory table, so its checkpoints are ephemeral.
    let log = Arc::new(FileLog::new(FileLogConfig {
        root: config.transport_dir.clone(),
        partitions: config.partitions,
        poll_interval: Duration::from_millis(200),
    }));
    let processor = StreamProcessor::new(
        log,
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(ControlHandler::new(Arc::clone(&registry), status.clone())),
        ConsumerConfig {
            group: config.consumer_group.clone(),
            topic: config.control_topic.clone(),
            stream_id: "registry".to_string(),
            start: StartPosition::Earliest,
            policy: CheckpointPolicy::EveryRecord,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = processor
        .start(shutdown_rx.clone())
        .await
        .context("failed to start control consumer")?;
    tracing::info!(topic = %config.control_topic, "control consumer started");

    let state = AppState::new(Arc::clone(&registry), status);
    let app = router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "starting server");

    let mut signal_rx = shutdown_rx.clone();
    spawn_signal_handler(shutdown_tx);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            // Wait for the shutdown signal to flip.
            while signal_rx.changed().await.is_ok() {
                if *signal_rx.borrow() {
                    break;
                }
            }
        })
        .await
        .context("server error")?;

    // The server is down; wait for the consumer to release its partitions.
    let stats = consumer.join().await;
    tracing::info!(
        received = stats.total_received(),
        applied = stats.total_committed(),
        skipped = stats.total_skipped(),
        "registry stopped"
    );

    Ok(())
}

/// Flip the shutdown signal on SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        tracing::info!("Shutdown signal received, stopping gracefully...");
        let _ = shutdown.send(true);
    });
}
