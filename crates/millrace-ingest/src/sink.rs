//! Idempotent document sink.
//!
//! Writes decoded events into one store collection, keyed by the record id.
//! Upsert semantics make at-least-once delivery safe: a redelivered record
//! overwrites its earlier self instead of duplicating it, so the consumer
//! may replay from a stale checkpoint without corrupting the collection.
//!
//! Transient store failures are retried with bounded exponential backoff;
//! exhausting the budget (or any fatal store error) escalates to the owning
//! partition, which must not advance its checkpoint past the failed record.

use crate::retry::{RetryConfig, RetryError, retry_transient};
use crate::store::DocumentStore;
use metrics::counter;
use millrace_core::DecodedEvent;
use std::sync::Arc;
use thiserror::Error;

/// Sink write failure, already past the retry budget.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Transient failures persisted through every attempt.
    #[error("sink retries exhausted after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: crate::store::StoreError,
    },

    /// The store rejected the write outright.
    #[error("sink write failed: {0}")]
    Fatal(crate::store::StoreError),
}

/// Idempotent sink over one collection of the document store.
pub struct IdempotentSink {
    store: Arc<dyn DocumentStore>,
    collection: String,
    retry: RetryConfig,
}

impl IdempotentSink {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(
        store: Arc<dyn DocumentStore>,
        collection: impl Into<String>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            retry,
        }
    }

    /// The collection this sink writes to.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Upsert the event's attributes as a document keyed by its record id.
    ///
    /// Returns only once the write is durably committed; the caller may
    /// then (and only then) checkpoint the event's offset.
    pub async fn write(&self, event: &DecodedEvent) -> Result<(), SinkError> {
        let started = std::time::Instant::now();

        let result = retry_transient(&self.retry, "sink upsert", || {
            self.store.upsert(&self.collection, event.attributes.clone())
        })
        .await;

        metrics::histogram!("sink_write_duration_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                counter!("sink_upserts_total").increment(1);
                Ok(())
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                counter!("sink_retries_total").increment(u64::from(attempts - 1));
                Err(SinkError::Exhausted { attempts, last })
            }
            Err(RetryError::Fatal(e)) => Err(SinkError::Fatal(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use crate::store::{Document, RocksStore, StoreError};
    use async_trait::async_trait;
    use millrace_core::{CompositeIndex, MissingIdPolicy, StreamType, TelemetryDecoder};
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    fn decoded(payload: &[u8]) -> DecodedEvent {
        TelemetryDecoder::new(&StreamType::Scada.descriptor(), MissingIdPolicy::default())
            .decode(payload, 0, 0)
            .unwrap()
    }

    async fn provisioned(tmp: &TempDir) -> Arc<RocksStore> {
        let store = Arc::new(RocksStore::new(tmp.path(), "telemetry"));
        store.ensure_database().await.unwrap();
        store
            .ensure_collection("scada_events", "/MachineID")
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_write_then_redeliver_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = provisioned(&tmp).await;
        let sink = IdempotentSink::new(Arc::clone(&store) as Arc<dyn DocumentStore>, "scada_events");

        let event = decoded(br#"{"id":"e1","MachineID":"M1","temperature":42.0}"#);
        sink.write(&event).await.unwrap();
        sink.write(&event).await.unwrap();

        assert_eq!(store.count("scada_events").await.unwrap(), 1);
        let stored = store.get("scada_events", "e1").await.unwrap().unwrap();
        assert_eq!(stored["temperature"], 42.0);
    }

    /// Store that fails a configurable number of writes transiently.
    struct FailingStore {
        inner: Arc<RocksStore>,
        failures: Mutex<u32>,
    }

    #[async_trait]
    impl DocumentStore for FailingStore {
        async fn ensure_database(&self) -> Result<(), StoreError> {
            self.inner.ensure_database().await
        }
        async fn ensure_collection(
            &self,
            collection: &str,
            partition_key_path: &str,
        ) -> Result<(), StoreError> {
            self.inner.ensure_collection(collection, partition_key_path).await
        }
        async fn composite_indexes(
            &self,
            collection: &str,
        ) -> Result<Vec<CompositeIndex>, StoreError> {
            self.inner.composite_indexes(collection).await
        }
        async fn add_composite_indexes(
            &self,
            collection: &str,
            indexes: &[CompositeIndex],
        ) -> Result<(), StoreError> {
            self.inner.add_composite_indexes(collection, indexes).await
        }
        async fn upsert(&self, collection: &str, document: Document) -> Result<(), StoreError> {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(StoreError::Transient("throttled".to_string()));
            }
            drop(failures);
            self.inner.upsert(collection, document).await
        }
        async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
            self.inner.get(collection, id).await
        }
        async fn count(&self, collection: &str) -> Result<u64, StoreError> {
            self.inner.count(collection).await
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(2),
            op_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_transient_failures_retried_to_success() {
        let tmp = TempDir::new().unwrap();
        let store = provisioned(&tmp).await;
        let flaky = Arc::new(FailingStore {
            inner: Arc::clone(&store),
            failures: Mutex::new(2),
        });
        let sink = IdempotentSink::with_retry(flaky, "scada_events", fast_retry(5));

        let event = decoded(br#"{"id":"e1","MachineID":"M1","temperature":1.5}"#);
        sink.write(&event).await.unwrap();
        assert_eq!(store.count("scada_events").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_escalate() {
        let tmp = TempDir::new().unwrap();
        let store = provisioned(&tmp).await;
        let flaky = Arc::new(FailingStore {
            inner: store,
            failures: Mutex::new(u32::MAX),
        });
        let sink = IdempotentSink::with_retry(flaky, "scada_events", fast_retry(3));

        let event = decoded(br#"{"id":"e1","MachineID":"M1"}"#);
        let err = sink.write(&event).await.unwrap_err();
        assert!(matches!(err, SinkError::Exhausted { attempts: 3, .. }));
    }
}
