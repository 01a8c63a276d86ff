//! Partitioned log abstraction.
//!
//! The pipeline consumes from an ordered, partitioned, durable append-log
//! with consumer-group semantics. This module defines the trait seam the
//! consumer is written against, plus two local implementations:
//!
//! - [`FileLog`] - a directory of append-only frame files, one per
//!   partition; the transport the binaries run against
//! - [`MemoryLog`] - an in-process log with a revoke handle, used by tests
//!   to exercise rebalancing
//!
//! Partition assignment/load balancing is the log's own protocol: both
//! local implementations hand every partition of a topic to the single
//! caller. The consumer only reacts to assignment and revocation.

mod file;
mod memory;

pub use file::{FileLog, FileLogConfig};
pub use memory::{MemoryLog, RevokeHandle};

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::str::FromStr;

/// A raw record delivered from one partition of the log.
///
/// Ownership transfers to the consumer on delivery; the record is dropped
/// after its checkpoint commits.
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// Partition the record was read from.
    pub partition: u32,

    /// Position of the record within its partition.
    pub offset: u64,

    /// Opaque payload bytes.
    pub payload: Vec<u8>,

    /// When the record was appended to the log.
    pub enqueued_at: DateTime<Utc>,
}

/// Where to begin consuming a partition that has no committed checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Replay all retained history.
    Earliest,

    /// Skip history; process only new arrivals.
    Latest,
}

impl FromStr for StartPosition {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "earliest" => Ok(StartPosition::Earliest),
            "latest" => Ok(StartPosition::Latest),
            other => Err(crate::Error::Config(format!(
                "unknown start position '{other}' (expected 'earliest' or 'latest')"
            ))),
        }
    }
}

/// Concrete subscription point for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeFrom {
    /// Begin at this offset (inclusive).
    Offset(u64),

    /// Begin past everything currently in the partition.
    End,
}

/// Resolve the subscription point from the configured start position and
/// the last committed checkpoint, if any.
///
/// A committed checkpoint always wins: restart resumes at the record after
/// it. Without one, `Earliest` replays from offset 0 and `Latest` skips
/// history.
pub fn resolve_start(position: StartPosition, committed: Option<u64>) -> SubscribeFrom {
    match (committed, position) {
        (Some(offset), _) => SubscribeFrom::Offset(offset + 1),
        (None, StartPosition::Earliest) => SubscribeFrom::Offset(0),
        (None, StartPosition::Latest) => SubscribeFrom::End,
    }
}

/// An ordered, partitioned, durable append-log.
#[async_trait]
pub trait PartitionedLog: Send + Sync {
    /// The partitions of a topic, provisioning the topic if needed.
    async fn partitions(&self, topic: &str) -> Result<Vec<u32>>;

    /// Subscribe to one partition from the given point.
    async fn subscribe(
        &self,
        topic: &str,
        partition: u32,
        from: SubscribeFrom,
    ) -> Result<Box<dyn PartitionStream>>;

    /// Append a payload to a partition, returning its offset.
    async fn append(&self, topic: &str, partition: u32, payload: &[u8]) -> Result<u64>;
}

/// An ordered stream of records from a single partition.
#[async_trait]
pub trait PartitionStream: Send {
    /// The next record, in offset order.
    ///
    /// Waits cooperatively while the partition is caught up. Returns
    /// `Ok(None)` when partition ownership is revoked or the log is closed;
    /// any uncheckpointed record will be redelivered to the next owner.
    async fn next(&mut self) -> Result<Option<RawRecord>>;
}
