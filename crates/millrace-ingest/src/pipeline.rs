//! Per-record processing pipeline.
//!
//! The consumer drives every record through a [`RecordHandler`]: decode,
//! validate, apply side effects. The handler's outcome tells the consumer
//! whether the record's offset may be checkpointed:
//!
//! - `Committed` - side effects are durable; checkpoint may advance
//! - `Skipped` - the record is permanently unusable (malformed, unknown
//!   kind); checkpoint still advances, since retrying a deterministic
//!   failure changes nothing
//! - `Err(fatal)` - the record could not be applied and must not be lost;
//!   the partition faults and the checkpoint never passes this offset
//!
//! [`TelemetryPipeline`] is the telemetry specialization: a
//! [`TelemetryDecoder`] in front of an [`IdempotentSink`].

use crate::log::RawRecord;
use crate::sink::IdempotentSink;
use async_trait::async_trait;
use millrace_core::TelemetryDecoder;
use thiserror::Error;

/// What happened to a record whose processing finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Side effects are durably committed.
    Committed,

    /// Permanently skipped; deterministic failure, never retried.
    Skipped {
        /// Why the record was skipped.
        reason: String,
    },
}

/// A record that could not be applied and must not be skipped.
///
/// Suspends the owning partition; the record will be redelivered to the
/// partition's next owner.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct ProcessFault {
    /// What went wrong.
    pub reason: String,
}

/// Processes one record's side effects.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    /// Handler name for logs.
    fn name(&self) -> &'static str;

    /// Process a record to completion.
    async fn handle(&self, record: &RawRecord) -> Result<ProcessOutcome, ProcessFault>;
}

/// Telemetry pipeline: decode, validate, upsert.
pub struct TelemetryPipeline {
    decoder: TelemetryDecoder,
    sink: IdempotentSink,
}

impl TelemetryPipeline {
    pub fn new(decoder: TelemetryDecoder, sink: IdempotentSink) -> Self {
        Self { decoder, sink }
    }
}

#[async_trait]
impl RecordHandler for TelemetryPipeline {
    fn name(&self) -> &'static str {
        "telemetry"
    }

    async fn handle(&self, record: &RawRecord) -> Result<ProcessOutcome, ProcessFault> {
        let event = match self
            .decoder
            .decode(&record.payload, record.partition, record.offset)
        {
            Ok(event) => event,
            Err(rejection) => {
                tracing::warn!(
                    partition = record.partition,
                    offset = record.offset,
                    "skipping record: {}",
                    rejection.reason
                );
                return Ok(ProcessOutcome::Skipped {
                    reason: rejection.reason,
                });
            }
        };

        tracing::debug!(
            partition = record.partition,
            offset = record.offset,
            record_id = %event.record_id,
            "upserting record"
        );

        self.sink.write(&event).await.map_err(|e| ProcessFault {
            reason: format!("record '{}': {e}", event.record_id),
        })?;

        Ok(ProcessOutcome::Committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DocumentStore, RocksStore};
    use chrono::Utc;
    use millrace_core::{MissingIdPolicy, StreamType};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn record(payload: &[u8], offset: u64) -> RawRecord {
        RawRecord {
            partition: 0,
            offset,
            payload: payload.to_vec(),
            enqueued_at: Utc::now(),
        }
    }

    async fn pipeline(tmp: &TempDir) -> (TelemetryPipeline, Arc<RocksStore>) {
        let store = Arc::new(RocksStore::new(tmp.path(), "telemetry"));
        store.ensure_database().await.unwrap();
        store
            .ensure_collection("scada_events", "/MachineID")
            .await
            .unwrap();

        let descriptor = StreamType::Scada.descriptor();
        let decoder = TelemetryDecoder::new(&descriptor, MissingIdPolicy::default());
        let sink = IdempotentSink::new(
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            descriptor.collection,
        );
        (TelemetryPipeline::new(decoder, sink), store)
    }

    #[tokio::test]
    async fn test_valid_record_commits() {
        let tmp = TempDir::new().unwrap();
        let (pipeline, store) = pipeline(&tmp).await;

        let outcome = pipeline
            .handle(&record(br#"{"id":"e1","MachineID":"M1","temperature":42.0}"#, 0))
            .await
            .unwrap();

        assert_eq!(outcome, ProcessOutcome::Committed);
        assert_eq!(store.count("scada_events").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_malformed_record_skips() {
        let tmp = TempDir::new().unwrap();
        let (pipeline, store) = pipeline(&tmp).await;

        let outcome = pipeline.handle(&record(b"garbage", 0)).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Skipped { .. }));
        assert_eq!(store.count("scada_events").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unprovisioned_collection_faults() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::new(tmp.path(), "telemetry"));
        store.ensure_database().await.unwrap();
        // Collection deliberately missing.
        let descriptor = StreamType::Scada.descriptor();
        let pipeline = TelemetryPipeline::new(
            TelemetryDecoder::new(&descriptor, MissingIdPolicy::default()),
            IdempotentSink::new(store as Arc<dyn DocumentStore>, descriptor.collection),
        );

        let err = pipeline
            .handle(&record(br#"{"id":"e1","MachineID":"M1"}"#, 0))
            .await
            .unwrap_err();
        assert!(err.reason.contains("e1"));
    }
}
