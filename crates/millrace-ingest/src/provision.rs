//! Schema provisioner.
//!
//! Before a stream's consumer starts, the store must hold the database,
//! the collection with the stream's partition key, and the stream's
//! composite indexes. `ensure` runs the three steps in order, retrying
//! transient store failures; any unresolved failure is fatal, because the
//! consumer must never run against a store whose schema is unverified.
//!
//! The whole sequence is idempotent and safe under concurrent provisioners
//! racing on the same resources: create-or-verify steps tolerate existing
//! state, and the index update is additive (last writer wins).

use crate::retry::{RetryConfig, RetryError, retry_transient};
use crate::store::DocumentStore;
use crate::{Error, Result};
use millrace_core::StreamDescriptor;
use std::sync::Arc;

/// Ensures a stream's schema exists before consumption starts.
pub struct SchemaProvisioner {
    store: Arc<dyn DocumentStore>,
    retry: RetryConfig,
}

impl SchemaProvisioner {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(store: Arc<dyn DocumentStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Create-or-verify everything the descriptor requires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Provision`] on any unresolved failure, including a
    /// partition key mismatch on an existing collection. The caller must
    /// not start consuming the stream.
    pub async fn ensure(&self, descriptor: &StreamDescriptor) -> Result<()> {
        let stream = descriptor.stream_id;

        tracing::info!(stream, "ensuring database");
        self.run(stream, "ensure database", || self.store.ensure_database())
            .await?;

        tracing::info!(
            stream,
            collection = descriptor.collection,
            partition_key = descriptor.partition_key_path,
            "ensuring collection"
        );
        self.run(stream, "ensure collection", || {
            self.store
                .ensure_collection(descriptor.collection, descriptor.partition_key_path)
        })
        .await?;

        let existing = self
            .run(stream, "read indexing policy", || {
                self.store.composite_indexes(descriptor.collection)
            })
            .await?;

        let missing: Vec<_> = descriptor
            .required_composite_indexes
            .iter()
            .filter(|index| !existing.contains(index))
            .cloned()
            .collect();

        if missing.is_empty() {
            tracing::info!(stream, "composite indexes already present");
        } else {
            tracing::info!(stream, count = missing.len(), "adding composite indexes");
            self.run(stream, "apply indexing policy", || {
                self.store.add_composite_indexes(descriptor.collection, &missing)
            })
            .await?;
        }

        tracing::info!(stream, "schema verified");
        Ok(())
    }

    async fn run<T, F, Fut>(&self, stream: &str, what: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, crate::store::StoreError>>,
    {
        retry_transient(&self.retry, what, op)
            .await
            .map_err(|e| match e {
                RetryError::Exhausted { attempts, last } => Error::Provision {
                    stream: stream.to_string(),
                    reason: format!("{what} exhausted {attempts} attempts: {last}"),
                },
                RetryError::Fatal(store_err) => Error::Provision {
                    stream: stream.to_string(),
                    reason: format!("{what}: {store_err}"),
                },
            })
    }
}
