//! Bounded control-message publisher.
//!
//! Producers enqueue envelopes and return immediately; a dedicated worker
//! task drains the queue and appends to the partitioned log. The queue is
//! bounded and the backpressure policy is explicit: `Block` makes
//! `publish` wait for space, `DropOldest` evicts the oldest queued message
//! to admit the new one.
//!
//! Messages are routed to a partition by hashing the source agent id, so
//! one agent's messages stay in order while different agents spread across
//! partitions.

use metrics::counter;
use millrace_core::{Envelope, MessageKind, RegisterPayload};
use millrace_ingest::PartitionedLog;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// What `publish` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Wait until the worker frees a slot.
    Block,

    /// Evict the oldest queued message and admit the new one.
    DropOldest,
}

/// Configuration for the publisher.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Topic control messages are appended to.
    pub topic: String,

    /// Maximum queued messages.
    pub capacity: usize,

    /// Full-queue behavior.
    pub policy: BackpressurePolicy,
}

/// Publishing failed.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The publisher was closed.
    #[error("publisher closed")]
    Closed,
}

struct QueueInner {
    queue: Mutex<VecDeque<Envelope>>,
    capacity: usize,
    policy: BackpressurePolicy,
    closed: AtomicBool,
    /// Woken when a message is enqueued or the publisher closes.
    items: Notify,
    /// Woken when the worker frees a slot.
    space: Notify,
}

/// Bounded-queue publisher with a dedicated worker task.
pub struct MessagePublisher {
    inner: Arc<QueueInner>,
    worker: JoinHandle<()>,
}

impl MessagePublisher {
    /// Spawn the worker and return the publisher handle.
    pub fn spawn(log: Arc<dyn PartitionedLog>, config: PublisherConfig) -> Self {
        let inner = Arc::new(QueueInner {
            queue: Mutex::new(VecDeque::with_capacity(config.capacity)),
            capacity: config.capacity.max(1),
            policy: config.policy,
            closed: AtomicBool::new(false),
            items: Notify::new(),
            space: Notify::new(),
        });

        let worker_inner = Arc::clone(&inner);
        let worker = tokio::spawn(run_worker(log, config.topic, worker_inner));

        Self { inner, worker }
    }

    /// Enqueue an envelope for delivery. Returns as soon as the message is
    /// queued; delivery happens on the worker task.
    pub async fn publish(&self, envelope: Envelope) -> Result<(), PublishError> {
        match self.inner.policy {
            BackpressurePolicy::DropOldest => {
                if self.inner.closed.load(Ordering::SeqCst) {
                    return Err(PublishError::Closed);
                }
                let mut queue = self.inner.queue.lock();
                if queue.len() >= self.inner.capacity {
                    let dropped = queue.pop_front();
                    counter!("registry_publish_dropped_total").increment(1);
                    if let Some(dropped) = dropped {
                        tracing::warn!(
                            message_type = %dropped.header.message_type,
                            "publish queue full, dropping oldest message"
                        );
                    }
                }
                queue.push_back(envelope);
                drop(queue);
                self.inner.items.notify_one();
                Ok(())
            }
            BackpressurePolicy::Block => loop {
                // Register for a space wakeup before checking, so a slot
                // freed between the check and the await is not missed.
                let space = self.inner.space.notified();
                if self.inner.closed.load(Ordering::SeqCst) {
                    return Err(PublishError::Closed);
                }
                {
                    let mut queue = self.inner.queue.lock();
                    if queue.len() < self.inner.capacity {
                        queue.push_back(envelope);
                        drop(queue);
                        self.inner.items.notify_one();
                        return Ok(());
                    }
                }
                space.await;
            },
        }
    }

    /// Publish an `agent.register` message for the given agent.
    pub async fn register_agent(
        &self,
        agent_id: &str,
        agent_type: &str,
        capabilities: Vec<String>,
    ) -> Result<(), PublishError> {
        let payload = RegisterPayload {
            agent_id: agent_id.to_string(),
            agent_type: agent_type.to_string(),
            capabilities,
        };
        self.publish(Envelope::new(
            MessageKind::AgentRegister.as_type(),
            agent_id,
            json!(payload),
        ))
        .await
    }

    /// Messages currently queued (not yet handed to the log).
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Stop accepting messages, drain the queue, and wait for the worker.
    pub async fn close(self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.items.notify_waiters();
        self.inner.space.notify_waiters();
        if let Err(e) = self.worker.await {
            tracing::warn!("publisher worker panicked: {e}");
        }
    }
}

async fn run_worker(log: Arc<dyn PartitionedLog>, topic: String, inner: Arc<QueueInner>) {
    let partitions = match log.partitions(&topic).await {
        Ok(partitions) if !partitions.is_empty() => partitions,
        Ok(_) => {
            tracing::error!(topic, "control topic has no partitions; publisher idle");
            return;
        }
        Err(e) => {
            tracing::error!(topic, "failed to resolve control topic partitions: {e}");
            return;
        }
    };

    loop {
        // Register before checking the queue so an enqueue between the
        // check and the await is not missed.
        let items = inner.items.notified();

        let envelope = inner.queue.lock().pop_front();
        if let Some(envelope) = envelope {
            inner.space.notify_one();
            deliver(&*log, &topic, &partitions, envelope).await;
            continue;
        }

        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        items.await;
    }

    tracing::debug!(topic, "publisher worker stopped");
}

async fn deliver(log: &dyn PartitionedLog, topic: &str, partitions: &[u32], envelope: Envelope) {
    let partition = partitions[partition_index(&envelope.header.source_agent_id, partitions.len())];
    let bytes = match envelope.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!("failed to encode control message: {e}");
            return;
        }
    };
    match log.append(topic, partition, &bytes).await {
        Ok(offset) => {
            tracing::debug!(
                topic,
                partition,
                offset,
                message_type = %envelope.header.message_type,
                "control message published"
            );
        }
        Err(e) => {
            tracing::error!(
                topic,
                partition,
                message_type = %envelope.header.message_type,
                "failed to publish control message: {e}"
            );
        }
    }
}

/// Stable partition choice for an agent id.
fn partition_index(source_agent_id: &str, partition_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    source_agent_id.hash(&mut hasher);
    (hasher.finish() % partition_count as u64) as usize
}
