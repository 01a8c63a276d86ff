//! In-memory partitioned log.
//!
//! Used by tests and in-process wiring. Supports everything the trait
//! requires plus a [`RevokeHandle`] that simulates the broker rebalancing a
//! partition away from its consumer, which is how the `Released` path is
//! exercised without a real broker.

use super::{PartitionStream, PartitionedLog, RawRecord, SubscribeFrom};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// In-memory partitioned log.
pub struct MemoryLog {
    partitions: u32,
    topics: Mutex<HashMap<String, Arc<TopicState>>>,
}

struct TopicState {
    partitions: Vec<PartitionState>,
    /// Woken on every append and on revocation.
    changed: Notify,
}

struct PartitionState {
    records: Mutex<Vec<StoredRecord>>,
    revoked: Arc<AtomicBool>,
}

#[derive(Clone)]
struct StoredRecord {
    payload: Vec<u8>,
    enqueued_at: DateTime<Utc>,
}

impl MemoryLog {
    /// Create a log with the given number of partitions per topic.
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions,
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn topic(&self, name: &str) -> Arc<TopicState> {
        let mut topics = self.topics.lock();
        Arc::clone(topics.entry(name.to_string()).or_insert_with(|| {
            Arc::new(TopicState {
                partitions: (0..self.partitions)
                    .map(|_| PartitionState {
                        records: Mutex::new(Vec::new()),
                        revoked: Arc::new(AtomicBool::new(false)),
                    })
                    .collect(),
                changed: Notify::new(),
            })
        }))
    }

    /// A handle that revokes ownership of one partition of a topic.
    pub fn revoke_handle(&self, topic: &str, partition: u32) -> RevokeHandle {
        let state = self.topic(topic);
        let flag = Arc::clone(&state.partitions[partition as usize].revoked);
        RevokeHandle { state, flag }
    }
}

/// Revokes partition ownership from subscribed streams.
pub struct RevokeHandle {
    state: Arc<TopicState>,
    flag: Arc<AtomicBool>,
}

impl RevokeHandle {
    /// Revoke the partition: its streams return `None` on the next poll.
    pub fn revoke(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.state.changed.notify_waiters();
    }
}

#[async_trait]
impl PartitionedLog for MemoryLog {
    async fn partitions(&self, topic: &str) -> Result<Vec<u32>> {
        self.topic(topic);
        Ok((0..self.partitions).collect())
    }

    async fn subscribe(
        &self,
        topic: &str,
        partition: u32,
        from: SubscribeFrom,
    ) -> Result<Box<dyn PartitionStream>> {
        if partition >= self.partitions {
            return Err(Error::Log(format!(
                "partition {partition} out of range for topic '{topic}'"
            )));
        }
        let state = self.topic(topic);
        let revoked = Arc::clone(&state.partitions[partition as usize].revoked);
        let next_offset = match from {
            SubscribeFrom::Offset(offset) => offset,
            SubscribeFrom::End => state.partitions[partition as usize].records.lock().len() as u64,
        };
        Ok(Box::new(MemoryStream {
            state,
            partition,
            next_offset,
            revoked,
        }))
    }

    async fn append(&self, topic: &str, partition: u32, payload: &[u8]) -> Result<u64> {
        if partition >= self.partitions {
            return Err(Error::Log(format!(
                "partition {partition} out of range for topic '{topic}'"
            )));
        }
        let state = self.topic(topic);
        let offset = {
            let mut records = state.partitions[partition as usize].records.lock();
            records.push(StoredRecord {
                payload: payload.to_vec(),
                enqueued_at: Utc::now(),
            });
            (records.len() - 1) as u64
        };
        state.changed.notify_waiters();
        Ok(offset)
    }
}

struct MemoryStream {
    state: Arc<TopicState>,
    partition: u32,
    next_offset: u64,
    revoked: Arc<AtomicBool>,
}

#[async_trait]
impl PartitionStream for MemoryStream {
    async fn next(&mut self) -> Result<Option<RawRecord>> {
        loop {
            // Register before checking so an append or revoke between the
            // check and the await is not missed.
            let changed = self.state.changed.notified();

            if self.revoked.load(Ordering::SeqCst) {
                return Ok(None);
            }

            let stored = {
                let records = self.state.partitions[self.partition as usize].records.lock();
                records.get(self.next_offset as usize).cloned()
            };
            if let Some(record) = stored {
                let offset = self.next_offset;
                self.next_offset += 1;
                return Ok(Some(RawRecord {
                    partition: self.partition,
                    offset,
                    payload: record.payload,
                    enqueued_at: record.enqueued_at,
                }));
            }

            changed.await;
        }
    }
}
