//! Document store abstraction.
//!
//! The sink upserts decoded records into a document store keyed by the
//! record id; the schema provisioner creates the database, collections,
//! and composite indexes before any consumer starts. This module defines
//! the trait seam plus the store error taxonomy; [`RocksStore`] is the
//! disk-backed implementation.

mod rocks;

pub use rocks::RocksStore;

use async_trait::async_trait;
use millrace_core::CompositeIndex;
use thiserror::Error;

/// A document: a flat JSON object. The `id` field is the upsert key.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Store failures, classified for retry policy.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The collection exists with a different partition key. Never resolved
    /// silently; an incompatible descriptor change requires a new collection.
    #[error(
        "partition key mismatch for collection '{collection}': existing '{existing}', requested '{requested}'"
    )]
    PartitionKeyMismatch {
        collection: String,
        existing: String,
        requested: String,
    },

    /// Worth retrying with backoff (timeout, throttling, busy).
    #[error("transient store error: {0}")]
    Transient(String),

    /// Not worth retrying (corruption, misuse, missing provisioning).
    #[error("fatal store error: {0}")]
    Fatal(String),
}

impl StoreError {
    /// Whether a bounded retry with backoff may resolve this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        use rocksdb::ErrorKind;
        match e.kind() {
            ErrorKind::TryAgain | ErrorKind::Busy | ErrorKind::TimedOut => {
                StoreError::Transient(e.to_string())
            }
            _ => StoreError::Fatal(e.to_string()),
        }
    }
}

/// A document store holding one database of collections.
///
/// Upserts are commutative on disjoint ids and idempotent on colliding
/// ones, so concurrent partition tasks may interleave writes freely.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create-or-verify the database. Idempotent; must be called before any
    /// other operation.
    async fn ensure_database(&self) -> Result<(), StoreError>;

    /// Create-or-verify a collection with the given partition key path.
    ///
    /// Fails with [`StoreError::PartitionKeyMismatch`] if the collection
    /// already exists under a different partition key.
    async fn ensure_collection(
        &self,
        collection: &str,
        partition_key_path: &str,
    ) -> Result<(), StoreError>;

    /// The composite indexes currently defined on a collection.
    async fn composite_indexes(&self, collection: &str) -> Result<Vec<CompositeIndex>, StoreError>;

    /// Append composite index definitions. Additive only; definitions
    /// already present are ignored.
    async fn add_composite_indexes(
        &self,
        collection: &str,
        indexes: &[CompositeIndex],
    ) -> Result<(), StoreError>;

    /// Upsert a document keyed by its `id` field. A second write with the
    /// same id overwrites the first without duplicating anything.
    async fn upsert(&self, collection: &str, document: Document) -> Result<(), StoreError>;

    /// Fetch a document by id.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Exact number of documents in a collection.
    async fn count(&self, collection: &str) -> Result<u64, StoreError>;
}
