//! Per-partition progress checkpoints.
//!
//! A checkpoint records, per (consumer group, topic, partition), the offset
//! of the last record whose side effects are durably committed. Restart
//! resumes at the record after it. A crash may leave the checkpoint behind
//! the true last-processed offset (causing redelivery, which the idempotent
//! sink absorbs) but never ahead of an uncommitted write: the consumer only
//! commits after the write returns.
//!
//! # Key Design
//!
//! ```text
//! Key:   group 0x00 topic 0x00 [partition (u32 BE)]
//! Value: [offset (u64 BE)][committed-at micros (u64 BE)]
//! ```

use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{DBWithThreadMode, MultiThreaded, Options};
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

/// A committed checkpoint for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    /// Partition this checkpoint belongs to.
    pub partition: u32,

    /// Offset of the last durably committed record.
    pub offset: u64,

    /// When the checkpoint was committed.
    pub committed_at: DateTime<Utc>,
}

/// Durable storage for checkpoints, partitioned by (group, topic, partition)
/// so concurrent partition tasks never contend on the same entry.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The committed checkpoint, if any.
    async fn load(&self, group: &str, topic: &str, partition: u32) -> Result<Option<Checkpoint>>;

    /// Commit an offset. Offsets are monotonically non-decreasing per
    /// partition; a commit at or below the stored offset is a no-op.
    async fn commit(&self, group: &str, topic: &str, partition: u32, offset: u64) -> Result<()>;
}

/// RocksDB-backed checkpoint store.
pub struct RocksCheckpointStore {
    db: DBWithThreadMode<MultiThreaded>,
}

impl RocksCheckpointStore {
    /// Open or create the checkpoint database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("Opening checkpoint store at {}", path.display());

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DBWithThreadMode::<MultiThreaded>::open(&opts, path)?;
        Ok(Self { db })
    }

    fn make_key(group: &str, topic: &str, partition: u32) -> Vec<u8> {
        let mut key = Vec::with_capacity(group.len() + topic.len() + 6);
        key.extend_from_slice(group.as_bytes());
        key.push(0x00);
        key.extend_from_slice(topic.as_bytes());
        key.push(0x00);
        key.extend_from_slice(&partition.to_be_bytes());
        key
    }

    fn parse_value(partition: u32, value: &[u8]) -> Result<Checkpoint> {
        if value.len() != 16 {
            return Err(Error::Checkpoint(format!(
                "corrupt checkpoint value of length {}",
                value.len()
            )));
        }
        let offset = u64::from_be_bytes(value[0..8].try_into().expect("8-byte slice"));
        let micros = u64::from_be_bytes(value[8..16].try_into().expect("8-byte slice"));
        let committed_at =
            DateTime::<Utc>::from_timestamp_micros(micros as i64).unwrap_or_else(Utc::now);
        Ok(Checkpoint {
            partition,
            offset,
            committed_at,
        })
    }
}

#[async_trait]
impl CheckpointStore for RocksCheckpointStore {
    async fn load(&self, group: &str, topic: &str, partition: u32) -> Result<Option<Checkpoint>> {
        let key = Self::make_key(group, topic, partition);
        match self.db.get(&key)? {
            Some(value) => Ok(Some(Self::parse_value(partition, &value)?)),
            None => Ok(None),
        }
    }

    async fn commit(&self, group: &str, topic: &str, partition: u32, offset: u64) -> Result<()> {
        let key = Self::make_key(group, topic, partition);
        if let Some(existing) = self.db.get(&key)? {
            let existing = Self::parse_value(partition, &existing)?;
            if existing.offset >= offset {
                tracing::debug!(
                    partition,
                    offset,
                    committed = existing.offset,
                    "checkpoint already at or past offset"
                );
                return Ok(());
            }
        }

        let mut value = [0u8; 16];
        value[0..8].copy_from_slice(&offset.to_be_bytes());
        value[8..16].copy_from_slice(&(Utc::now().timestamp_micros() as u64).to_be_bytes());
        self.db.put(&key, value)?;
        Ok(())
    }
}

/// In-memory checkpoint store.
///
/// Used where durable resume is not wanted, e.g. the registry consumer,
/// which replays from earliest on every start to rebuild its table.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<(String, String, u32), Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, group: &str, topic: &str, partition: u32) -> Result<Option<Checkpoint>> {
        let entries = self.entries.lock();
        Ok(entries
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied())
    }

    async fn commit(&self, group: &str, topic: &str, partition: u32, offset: u64) -> Result<()> {
        let mut entries = self.entries.lock();
        let key = (group.to_string(), topic.to_string(), partition);
        if let Some(existing) = entries.get(&key) {
            if existing.offset >= offset {
                return Ok(());
            }
        }
        entries.insert(
            key,
            Checkpoint {
                partition,
                offset,
                committed_at: Utc::now(),
            },
        );
        Ok(())
    }
}

/// When to commit checkpoints for a partition.
///
/// Batching trades recovery-replay volume for checkpoint-write overhead.
/// The telemetry path defaults to `EveryRecord`, matching the
/// at-least-once/idempotent-write design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointPolicy {
    /// Commit after every successfully processed record.
    EveryRecord,

    /// Commit after every N processed records.
    EveryN(u32),

    /// Commit when this much time has passed since the last commit.
    Interval(Duration),
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        CheckpointPolicy::EveryRecord
    }
}

/// Tracks processed-but-uncommitted progress for one partition and decides
/// when the policy calls for a commit.
#[derive(Debug)]
pub struct CheckpointTracker {
    policy: CheckpointPolicy,
    pending: Option<u64>,
    since_commit: u32,
    last_commit: Instant,
}

impl CheckpointTracker {
    pub fn new(policy: CheckpointPolicy) -> Self {
        Self {
            policy,
            pending: None,
            since_commit: 0,
            last_commit: Instant::now(),
        }
    }

    /// Record that this offset's side effects are durably committed.
    pub fn observe(&mut self, offset: u64) {
        self.pending = Some(self.pending.map_or(offset, |p| p.max(offset)));
        self.since_commit += 1;
    }

    /// Whether the policy calls for a commit now.
    pub fn should_commit(&self) -> bool {
        if self.pending.is_none() {
            return false;
        }
        match self.policy {
            CheckpointPolicy::EveryRecord => true,
            CheckpointPolicy::EveryN(n) => self.since_commit >= n,
            CheckpointPolicy::Interval(interval) => self.last_commit.elapsed() >= interval,
        }
    }

    /// Take the offset to commit, resetting the batch state.
    pub fn take_pending(&mut self) -> Option<u64> {
        let offset = self.pending.take();
        if offset.is_some() {
            self.since_commit = 0;
            self.last_commit = Instant::now();
        }
        offset
    }
}
