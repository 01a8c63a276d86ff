//! Error types for the ingestion pipeline.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion.
#[derive(Error, Debug)]
pub enum Error {
    /// RocksDB error.
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Document store error.
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),

    /// Partitioned log error.
    #[error("log error: {0}")]
    Log(String),

    /// Checkpoint store error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Schema provisioning failed; the consumer must not start.
    #[error("provisioning failed for stream '{stream}': {reason}")]
    Provision {
        /// Stream whose schema could not be verified.
        stream: String,
        /// What went wrong.
        reason: String,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
