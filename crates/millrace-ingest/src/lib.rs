//! Millrace ingestion pipeline components.
//!
//! This crate provides the core pipeline for consuming partitioned
//! telemetry streams and landing each record exactly-once-effectively in
//! the document store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ Partitioned Log  │  (file-backed transport, in-memory for tests)
//! └────────┬─────────┘
//!          │ per-partition worker tasks
//!          ▼
//! ┌──────────────────┐
//! │ StreamProcessor  │  claims partitions, drives the record pipeline
//! └────────┬─────────┘
//!          │ decode → validate
//!          ▼
//! ┌──────────────────┐
//! │ IdempotentSink   │  upsert keyed by record id, bounded retry
//! └────────┬─────────┘
//!          │ write committed
//!          ▼
//! ┌──────────────────┐
//! │ CheckpointStore  │  per-partition progress, monotonic offsets
//! └──────────────────┘
//! ```
//!
//! The [`SchemaProvisioner`] runs once at startup and gates consumption:
//! no partition is claimed until the database, collection, partition key,
//! and composite indexes are verified.
//!
//! Delivery is at-least-once; the sink's upsert semantics make redelivery
//! harmless, which is what lets the checkpoint trail the true progress
//! after a crash instead of risking data loss by leading it.

pub mod checkpoint;
pub mod consumer;
pub mod error;
pub mod log;
pub mod pipeline;
pub mod provision;
pub mod retry;
pub mod sink;
pub mod store;

pub use error::{Error, Result};

pub use checkpoint::{
    Checkpoint, CheckpointPolicy, CheckpointStore, CheckpointTracker, MemoryCheckpointStore,
    RocksCheckpointStore,
};
pub use consumer::{
    ConsumerConfig, PartitionOutcome, PartitionSummary, ProcessorHandle, RunStats, StreamProcessor,
};
pub use log::{
    FileLog, FileLogConfig, MemoryLog, PartitionStream, PartitionedLog, RawRecord, StartPosition,
    SubscribeFrom, resolve_start,
};
pub use pipeline::{ProcessFault, ProcessOutcome, RecordHandler, TelemetryPipeline};
pub use provision::SchemaProvisioner;
pub use retry::{RetryConfig, RetryError};
pub use sink::{IdempotentSink, SinkError};
pub use store::{Document, DocumentStore, RocksStore, StoreError};
