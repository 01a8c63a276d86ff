//! Prometheus metrics helpers for the Millrace system.
//!
//! Centralized metrics initialization and the common metric descriptions
//! used across components.
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`ingest_`, `sink_`, `checkpoint_`, `registry_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: used sparingly (`stream`, `partition` would explode cardinality
//!   on wide topics; stick to `stream`)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Must be called once at startup before any metrics are recorded.
/// Returns a handle for [`start_metrics_server`].
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already
/// installed instead of panicking. Useful in tests.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Start the Prometheus metrics HTTP server on `/metrics`.
///
/// Spawns a background task and returns immediately.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("metrics server error: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for the metrics used across Millrace.
///
/// Called automatically by [`init_metrics`].
fn register_common_metrics() {
    describe_counter!(
        "ingest_records_total",
        "Records received from the partitioned log (label: stream)"
    );
    describe_counter!(
        "ingest_records_committed_total",
        "Records whose write and checkpoint both committed (label: stream)"
    );
    describe_counter!(
        "ingest_records_skipped_total",
        "Malformed or unhandled records permanently skipped (label: stream)"
    );
    describe_counter!(
        "ingest_partitions_faulted_total",
        "Partitions suspended on an unrecoverable error (label: stream)"
    );
    describe_gauge!(
        "ingest_partitions_active",
        "Partitions currently in the Receiving state (label: stream)"
    );

    describe_counter!("sink_upserts_total", "Documents upserted into the store");
    describe_counter!(
        "sink_retries_total",
        "Transient sink failures that were retried"
    );
    describe_histogram!(
        "sink_write_duration_seconds",
        "Time spent per sink write, including retries"
    );

    describe_counter!(
        "checkpoint_commits_total",
        "Checkpoint commits (label: stream)"
    );

    describe_counter!(
        "registry_messages_total",
        "Control messages consumed by the registry (label: kind)"
    );
    describe_gauge!("registry_agents", "Agents currently registered");
    describe_counter!(
        "registry_publish_dropped_total",
        "Messages dropped by the bounded publisher queue"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = try_init_metrics();
        });
    }

    #[test]
    fn test_try_init_metrics_idempotent() {
        let handle1 = try_init_metrics();
        let handle2 = try_init_metrics();
        // At most one install can succeed.
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_register_common_metrics_does_not_panic() {
        ensure_metrics_init();
        register_common_metrics();
        register_common_metrics();
    }
}
