//! Millrace stream processor daemon.
//!
//! Consumes one (or all) of the configured telemetry streams from the
//! partitioned log and lands each record in the document store.
//!
//! # Usage
//!
//! ```bash
//! # Process the SCADA stream, resuming from committed checkpoints
//! millrace-ingest --stream-type scada
//!
//! # Process every stream with custom paths
//! millrace-ingest --stream-type all \
//!     --transport-dir /data/transport \
//!     --store-dir /data/store \
//!     --checkpoint-dir /data/checkpoints
//! ```
//!
//! Once consumption has begun on every claimed partition the process
//! prints the literal line `PROCESSOR_READY` to stdout; orchestration
//! tooling waits for it.
//!
//! # Graceful Shutdown
//!
//! SIGINT (Ctrl+C) and SIGTERM stop the pull loops, let in-flight records
//! finish their write and checkpoint, release every partition, and exit 0.
//! Provisioning or startup failures exit non-zero before the readiness
//! marker is printed; a run in which any partition faulted exits non-zero
//! after the remaining partitions release.

use anyhow::{Context, Result};
use clap::Parser;
use millrace_core::{MissingIdPolicy, StreamType, TelemetryDecoder};
use millrace_ingest::{
    CheckpointPolicy, CheckpointStore, ConsumerConfig, FileLog, FileLogConfig, IdempotentSink,
    PartitionedLog, ProcessorHandle, RocksCheckpointStore, RocksStore, SchemaProvisioner,
    StartPosition, StreamProcessor, TelemetryPipeline,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Millrace stream processor daemon.
#[derive(Parser, Debug)]
#[command(name = "millrace-ingest")]
#[command(about = "Partitioned telemetry stream processor")]
#[command(version)]
struct Args {
    /// Stream to process: scada, plc, gps, or all
    #[arg(long, env = "MILLRACE_STREAM_TYPE")]
    stream_type: String,

    /// Root directory of the partitioned log
    #[arg(long, env = "MILLRACE_TRANSPORT_DIR", default_value = "./data/transport")]
    transport_dir: PathBuf,

    /// Root directory of the document store
    #[arg(long, env = "MILLRACE_STORE_DIR", default_value = "./data/store")]
    store_dir: PathBuf,

    /// Database name within the store
    #[arg(long, env = "MILLRACE_DATABASE", default_value = "telemetry")]
    database: String,

    /// Directory for the checkpoint store
    #[arg(long, env = "MILLRACE_CHECKPOINT_DIR", default_value = "./data/checkpoints")]
    checkpoint_dir: PathBuf,

    /// Consumer group identifier
    #[arg(long, env = "MILLRACE_CONSUMER_GROUP", default_value = "millrace-ingest")]
    consumer_group: String,

    /// Starting position for partitions without a committed checkpoint:
    /// earliest or latest
    #[arg(long, env = "MILLRACE_START_POSITION", default_value = "latest")]
    start: String,

    /// Commit a checkpoint every N records (0 = after every record)
    #[arg(long, default_value = "0")]
    checkpoint_every: u32,

    /// Reject records without an 'id' field instead of synthesizing one
    #[arg(long)]
    reject_missing_id: bool,

    /// Partitions per topic in the file-backed log
    #[arg(long, default_value = "4")]
    partitions: u32,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "9090")]
    metrics_port: u16,

    /// Path to .env file (optional)
    #[arg(long, env = "DOTENV_PATH", default_value = ".env")]
    dotenv: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if std::path::Path::new(&args.dotenv).exists() {
        dotenvy::from_path(&args.dotenv).context("failed to load .env file")?;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive"))
                .add_directive("millrace_ingest=debug".parse().expect("valid directive")),
        )
        .init();

    tracing::info!("Millrace stream processor starting...");

    let streams: Vec<StreamType> = if args.stream_type == "all" {
        StreamType::all().to_vec()
    } else {
        vec![
            args.stream_type
                .parse()
                .context("invalid --stream-type (expected scada, plc, gps, or all)")?,
        ]
    };
    let start: StartPosition = args.start.parse().context("invalid --start")?;
    let policy = match args.checkpoint_every {
        0 | 1 => CheckpointPolicy::EveryRecord,
        n => CheckpointPolicy::EveryN(n),
    };
    let missing_id = if args.reject_missing_id {
        MissingIdPolicy::Reject
    } else {
        MissingIdPolicy::Synthesize
    };

    if args.metrics_port > 0 {
        let handle = millrace_core::metrics::init_metrics();
        millrace_core::metrics::start_metrics_server(args.metrics_port, handle)
            .await
            .context("failed to start metrics server")?;
    }

    tracing::info!("Configuration:");
    tracing::info!("  Streams:     {:?}", streams.iter().map(|s| s.to_string()).collect::<Vec<_>>());
    tracing::info!("  Transport:   {}", args.transport_dir.display());
    tracing::info!("  Store:       {}/{}", args.store_dir.display(), args.database);
    tracing::info!("  Checkpoints: {}", args.checkpoint_dir.display());
    tracing::info!("  Group:       {}", args.consumer_group);
    tracing::info!("  Start:       {start:?}");

    let log: Arc<dyn PartitionedLog> = Arc::new(FileLog::new(FileLogConfig {
        root: args.transport_dir.clone(),
        partitions: args.partitions,
        poll_interval: Duration::from_millis(200),
    }));
    let store = Arc::new(RocksStore::new(&args.store_dir, &args.database));
    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(
        RocksCheckpointStore::open(&args.checkpoint_dir)
            .context("failed to open checkpoint store")?,
    );

    // Provision every stream's schema before claiming a single partition.
    let provisioner = SchemaProvisioner::new(Arc::clone(&store) as _);
    for stream in &streams {
        let descriptor = stream.descriptor();
        provisioner
            .ensure(&descriptor)
            .await
            .with_context(|| format!("schema provisioning failed for stream '{stream}'"))?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    let mut handles: Vec<(StreamType, ProcessorHandle)> = Vec::with_capacity(streams.len());
    for stream in &streams {
        let descriptor = stream.descriptor();
        let decoder = TelemetryDecoder::new(&descriptor, missing_id);
        let sink = IdempotentSink::new(Arc::clone(&store) as _, descriptor.collection);
        let processor = StreamProcessor::new(
            Arc::clone(&log),
            Arc::clone(&checkpoints),
            Arc::new(TelemetryPipeline::new(decoder, sink)),
            ConsumerConfig {
                group: args.consumer_group.clone(),
                topic: descriptor.topic.to_string(),
                stream_id: descriptor.stream_id.to_string(),
                start,
                policy,
            },
        );
        let handle = processor
            .start(shutdown_rx.clone())
            .await
            .with_context(|| format!("failed to start consumer for stream '{stream}'"))?;
        handles.push((*stream, handle));
    }

    // Consumption has begun on every claimed partition. The marker line is
    // consumed by orchestration tooling, not humans.
    {
        let mut stdout = std::io::stdout();
        writeln!(stdout, "PROCESSOR_READY").context("failed to write readiness marker")?;
        stdout.flush().context("failed to flush readiness marker")?;
    }
    tracing::info!("all streams receiving");

    let mut clean = true;
    for (stream, handle) in handles {
        let stats = handle.join().await;
        tracing::info!(
            stream = %stream,
            received = stats.total_received(),
            committed = stats.total_committed(),
            skipped = stats.total_skipped(),
            clean = stats.is_clean(),
            "stream finished"
        );
        clean &= stats.is_clean();
    }

    tracing::info!("Millrace stream processor stopped");
    if !clean {
        anyhow::bail!("one or more partitions ended faulted; see log for offsets");
    }
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
