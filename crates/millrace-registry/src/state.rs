//! Application state and configuration.

use crate::handler::ConsumerStatus;
use crate::registry::AgentRegistry;
use millrace_core::Mailbox;
use std::path::PathBuf;
use std::sync::Arc;

/// Application configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:8000").
    pub bind_addr: String,

    /// Root directory of the partitioned log.
    pub transport_dir: PathBuf,

    /// Control topic carrying agent messages.
    pub control_topic: String,

    /// Consumer group identifier.
    pub consumer_group: String,

    /// Partitions per topic in the file-backed log.
    pub partitions: u32,

    /// Metrics HTTP server port (0 disables).
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional environment variables:
    /// - `MILLRACE_BIND_ADDR`: server bind address (default: "0.0.0.0:8000")
    /// - `MILLRACE_TRANSPORT_DIR`: log root (default: "./data/transport")
    /// - `MILLRACE_CONTROL_TOPIC`: topic name (default: "agent-requests")
    /// - `MILLRACE_CONSUMER_GROUP`: group id (default: "millrace-registry")
    /// - `MILLRACE_PARTITIONS`: partitions per topic (default: 4)
    /// - `MILLRACE_METRICS_PORT`: metrics port, 0 disables (default: 0)
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr =
            std::env::var("MILLRACE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());

        let transport_dir = std::env::var("MILLRACE_TRANSPORT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/transport"));

        let control_topic =
            std::env::var("MILLRACE_CONTROL_TOPIC").unwrap_or_else(|_| "agent-requests".to_string());

        let consumer_group = std::env::var("MILLRACE_CONSUMER_GROUP")
            .unwrap_or_else(|_| "millrace-registry".to_string());

        let partitions = match std::env::var("MILLRACE_PARTITIONS") {
            Ok(value) => value
                .parse()
                .map_err(|_| anyhow::anyhow!("MILLRACE_PARTITIONS must be a positive integer"))?,
            Err(_) => 4,
        };

        let metrics_port = match std::env::var("MILLRACE_METRICS_PORT") {
            Ok(value) => value
                .parse()
                .map_err(|_| anyhow::anyhow!("MILLRACE_METRICS_PORT must be a port number"))?,
            Err(_) => 0,
        };

        tracing::info!(
            bind_addr = %bind_addr,
            transport = %transport_dir.display(),
            topic = %control_topic,
            group = %consumer_group,
            "configuration loaded"
        );

        Ok(Self {
            bind_addr,
            transport_dir,
            control_topic,
            consumer_group,
            partitions,
            metrics_port,
        })
    }
}

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The agent presence table.
    pub registry: Arc<AgentRegistry>,

    /// Latest consumer activity snapshot, fed by the control consumer.
    pub status: Mailbox<ConsumerStatus>,
}

impl AppState {
    pub fn new(registry: Arc<AgentRegistry>, status: Mailbox<ConsumerStatus>) -> Self {
        Self { registry, status }
    }
}
