//! Partition consumer.
//!
//! One [`StreamProcessor`] owns every partition the log assigns it within a
//! consumer group. Each partition runs as an independent task with strict
//! in-order delivery inside the partition and no ordering across
//! partitions; checkpoint state is keyed by partition, so the tasks never
//! contend on the same entry.
//!
//! # Partition state machine
//!
//! ```text
//! Claimed → Receiving ⇄ Checkpointing → Released
//!              │
//!              └→ Faulted → Released
//! ```
//!
//! Per record the order is fixed: handle (decode + write) first, checkpoint
//! after. A skipped record still advances the checkpoint; a faulted record
//! never does, so the next owner of the partition re-delivers it.
//!
//! # Shutdown
//!
//! A `watch` shutdown signal stops the pull loop between records: whatever
//! record is in flight finishes its write and checkpoint, then the
//! partition releases. Workers are never killed mid-write.

use crate::checkpoint::{CheckpointPolicy, CheckpointStore, CheckpointTracker};
use crate::log::{PartitionStream, PartitionedLog, StartPosition, resolve_start};
use crate::pipeline::{ProcessOutcome, RecordHandler};
use crate::Result;
use metrics::{counter, gauge};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Configuration for one stream's consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Consumer group identifier.
    pub group: String,

    /// Topic to consume.
    pub topic: String,

    /// Stream label for logs and metrics.
    pub stream_id: String,

    /// Where to start when a partition has no committed checkpoint.
    pub start: StartPosition,

    /// When to commit checkpoints.
    pub policy: CheckpointPolicy,
}

/// Lifecycle states of one owned partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartitionState {
    Claimed,
    Receiving,
    Checkpointing,
    Faulted,
    Released,
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionState::Claimed => "claimed",
            PartitionState::Receiving => "receiving",
            PartitionState::Checkpointing => "checkpointing",
            PartitionState::Faulted => "faulted",
            PartitionState::Released => "released",
        };
        f.write_str(name)
    }
}

/// How a partition's run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionOutcome {
    /// Ownership released cleanly (shutdown or rebalance).
    Released,

    /// Processing suspended on an unrecoverable error.
    Faulted {
        /// What suspended the partition.
        reason: String,
    },
}

/// Counters and final state for one partition's run.
#[derive(Debug, Clone)]
pub struct PartitionSummary {
    pub partition: u32,
    pub received: u64,
    pub committed: u64,
    pub skipped: u64,
    pub last_committed_offset: Option<u64>,
    pub outcome: PartitionOutcome,
}

/// Aggregated results of a processor run.
#[derive(Debug, Clone)]
pub struct RunStats {
    pub partitions: Vec<PartitionSummary>,
}

impl RunStats {
    pub fn total_received(&self) -> u64 {
        self.partitions.iter().map(|p| p.received).sum()
    }

    pub fn total_committed(&self) -> u64 {
        self.partitions.iter().map(|p| p.committed).sum()
    }

    pub fn total_skipped(&self) -> u64 {
        self.partitions.iter().map(|p| p.skipped).sum()
    }

    /// Whether every partition released without faulting.
    pub fn is_clean(&self) -> bool {
        self.partitions
            .iter()
            .all(|p| p.outcome == PartitionOutcome::Released)
    }
}

/// Drives one stream's partitions through the processing pipeline.
pub struct StreamProcessor {
    log: Arc<dyn PartitionedLog>,
    checkpoints: Arc<dyn CheckpointStore>,
    handler: Arc<dyn RecordHandler>,
    config: ConsumerConfig,
}

/// A running processor; join it to collect the run's stats.
pub struct ProcessorHandle {
    workers: Vec<(u32, JoinHandle<PartitionSummary>)>,
}

impl StreamProcessor {
    pub fn new(
        log: Arc<dyn PartitionedLog>,
        checkpoints: Arc<dyn CheckpointStore>,
        handler: Arc<dyn RecordHandler>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            log,
            checkpoints,
            handler,
            config,
        }
    }

    /// Claim all assigned partitions, subscribe each at its resume point,
    /// and spawn one worker task per partition.
    ///
    /// Consumption has begun on every partition once this returns.
    pub async fn start(self, shutdown: watch::Receiver<bool>) -> Result<ProcessorHandle> {
        let partitions = self.log.partitions(&self.config.topic).await?;
        tracing::info!(
            stream = %self.config.stream_id,
            topic = %self.config.topic,
            group = %self.config.group,
            partitions = partitions.len(),
            "claiming partitions"
        );

        let mut workers = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let committed = self
                .checkpoints
                .load(&self.config.group, &self.config.topic, partition)
                .await?
                .map(|cp| cp.offset);
            let from = resolve_start(self.config.start, committed);
            tracing::info!(
                stream = %self.config.stream_id,
                partition,
                committed = ?committed,
                from = ?from,
                "subscribing partition"
            );
            let stream = self
                .log
                .subscribe(&self.config.topic, partition, from)
                .await?;

            let worker = PartitionWorker {
                config: self.config.clone(),
                partition,
                checkpoints: Arc::clone(&self.checkpoints),
                handler: Arc::clone(&self.handler),
            };
            let handle = tokio::spawn(worker.run(stream, shutdown.clone()));
            workers.push((partition, handle));
        }

        Ok(ProcessorHandle { workers })
    }
}

impl ProcessorHandle {
    /// Wait for every partition worker to reach `Released` and collect the
    /// run's stats.
    pub async fn join(self) -> RunStats {
        let mut partitions = Vec::with_capacity(self.workers.len());
        for (partition, handle) in self.workers {
            match handle.await {
                Ok(summary) => partitions.push(summary),
                Err(e) => {
                    tracing::error!(partition, "partition worker panicked: {e}");
                    partitions.push(PartitionSummary {
                        partition,
                        received: 0,
                        committed: 0,
                        skipped: 0,
                        last_committed_offset: None,
                        outcome: PartitionOutcome::Faulted {
                            reason: format!("worker panicked: {e}"),
                        },
                    });
                }
            }
        }
        RunStats { partitions }
    }
}

struct PartitionWorker {
    config: ConsumerConfig,
    partition: u32,
    checkpoints: Arc<dyn CheckpointStore>,
    handler: Arc<dyn RecordHandler>,
}

impl PartitionWorker {
    fn transition(&self, state: &mut PartitionState, to: PartitionState) {
        tracing::trace!(
            stream = %self.config.stream_id,
            partition = self.partition,
            from = %state,
            to = %to,
            "partition state"
        );
        *state = to;
    }

    async fn run(
        self,
        mut stream: Box<dyn PartitionStream>,
        mut shutdown: watch::Receiver<bool>,
    ) -> PartitionSummary {
        let mut state = PartitionState::Claimed;
        let mut tracker = CheckpointTracker::new(self.config.policy);
        let mut summary = PartitionSummary {
            partition: self.partition,
            received: 0,
            committed: 0,
            skipped: 0,
            last_committed_offset: None,
            outcome: PartitionOutcome::Released,
        };

        self.transition(&mut state, PartitionState::Receiving);
        gauge!("ingest_partitions_active", "stream" => self.config.stream_id.clone()).increment(1.0);

        let outcome = loop {
            let record = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!(
                            stream = %self.config.stream_id,
                            partition = self.partition,
                            "shutdown requested; releasing partition"
                        );
                        break PartitionOutcome::Released;
                    }
                    continue;
                }
                next = stream.next() => match next {
                    Ok(Some(record)) => record,
                    Ok(None) => {
                        tracing::info!(
                            stream = %self.config.stream_id,
                            partition = self.partition,
                            "partition ownership revoked"
                        );
                        break PartitionOutcome::Released;
                    }
                    Err(e) => break PartitionOutcome::Faulted {
                        reason: format!("partition stream error: {e}"),
                    },
                }
            };

            summary.received += 1;
            counter!("ingest_records_total", "stream" => self.config.stream_id.clone()).increment(1);

            match self.handler.handle(&record).await {
                Ok(ProcessOutcome::Committed) => {
                    summary.committed += 1;
                    counter!("ingest_records_committed_total", "stream" => self.config.stream_id.clone())
                        .increment(1);
                    tracker.observe(record.offset);
                }
                Ok(ProcessOutcome::Skipped { .. }) => {
                    summary.skipped += 1;
                    counter!("ingest_records_skipped_total", "stream" => self.config.stream_id.clone())
                        .increment(1);
                    tracker.observe(record.offset);
                }
                Err(fault) => {
                    tracing::error!(
                        stream = %self.config.stream_id,
                        partition = self.partition,
                        offset = record.offset,
                        "partition faulted: {fault}"
                    );
                    self.transition(&mut state, PartitionState::Faulted);
                    break PartitionOutcome::Faulted {
                        reason: fault.reason,
                    };
                }
            }

            if tracker.should_commit() {
                self.transition(&mut state, PartitionState::Checkpointing);
                if let Some(fault) = self.commit(&mut tracker, &mut summary).await {
                    self.transition(&mut state, PartitionState::Faulted);
                    break fault;
                }
                self.transition(&mut state, PartitionState::Receiving);
            }

            // A signal that arrived while the record was being processed:
            // its write and checkpoint are complete, release now.
            if *shutdown.borrow() {
                break PartitionOutcome::Released;
            }
        };

        // Flush whatever completed records are still pending under a
        // batching policy. A faulted record is never in the tracker.
        summary.outcome = outcome;
        if let Some(flush_fault) = self.commit(&mut tracker, &mut summary).await {
            if summary.outcome == PartitionOutcome::Released {
                summary.outcome = flush_fault;
            }
        }

        if let PartitionOutcome::Faulted { reason } = &summary.outcome {
            counter!("ingest_partitions_faulted_total", "stream" => self.config.stream_id.clone())
                .increment(1);
            tracing::error!(
                stream = %self.config.stream_id,
                partition = self.partition,
                "partition ended faulted: {reason}"
            );
        }

        gauge!("ingest_partitions_active", "stream" => self.config.stream_id.clone()).decrement(1.0);
        self.transition(&mut state, PartitionState::Released);
        tracing::info!(
            stream = %self.config.stream_id,
            partition = self.partition,
            received = summary.received,
            committed = summary.committed,
            skipped = summary.skipped,
            last_committed = ?summary.last_committed_offset,
            "partition released"
        );
        summary
    }

    /// Commit the tracker's pending offset, if any. Returns the fault on
    /// checkpoint failure.
    async fn commit(
        &self,
        tracker: &mut CheckpointTracker,
        summary: &mut PartitionSummary,
    ) -> Option<PartitionOutcome> {
        let offset = tracker.take_pending()?;
        match self
            .checkpoints
            .commit(&self.config.group, &self.config.topic, self.partition, offset)
            .await
        {
            Ok(()) => {
                counter!("checkpoint_commits_total", "stream" => self.config.stream_id.clone())
                    .increment(1);
                summary.last_committed_offset = Some(offset);
                None
            }
            Err(e) => Some(PartitionOutcome::Faulted {
                reason: format!("checkpoint commit failed at offset {offset}: {e}"),
            }),
        }
    }
}
