//! RocksDB-backed document store.
//!
//! Layout: one RocksDB per database directory. Each collection gets two
//! column families, `<name>` for documents (key = record id, value = JSON)
//! and `<name>#idx` for composite index entries. The default family holds
//! one manifest per collection recording its partition key path and index
//! definitions.
//!
//! # Index entry keys
//!
//! ```text
//! [index seq (u32 BE)][encoded component]...[record id bytes]
//! ```
//!
//! Components are order-preserving byte encodings (big-endian with a sign
//! flip for numbers, NUL-terminated UTF-8 for strings); a descending path
//! inverts the component's bytes. Upsert deletes the previous document's
//! entries and writes the new ones in a single `WriteBatch`, so redelivery
//! of the same record never accumulates entries.

use super::{Document, DocumentStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use millrace_core::{CompositeIndex, IndexOrder};
use parking_lot::{Mutex, RwLock};
use rocksdb::{DBWithThreadMode, MultiThreaded, Options, WriteBatch};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

type Db = DBWithThreadMode<MultiThreaded>;

const MANIFEST_PREFIX: &str = "manifest:";
const INDEX_CF_SUFFIX: &str = "#idx";

/// Per-collection schema state, stored in the default column family.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CollectionManifest {
    partition_key_path: String,
    composite_indexes: Vec<CompositeIndex>,
}

/// RocksDB-backed document store for one database.
pub struct RocksStore {
    path: PathBuf,
    db: RwLock<Option<Arc<Db>>>,
    /// Serializes schema changes within this process; racing provisioners
    /// in other processes fall back to last-writer-wins on the manifest.
    provision_lock: Mutex<()>,
}

impl RocksStore {
    /// Create a handle for the database directory `<endpoint>/<database>`.
    ///
    /// No I/O happens until [`DocumentStore::ensure_database`] runs; every
    /// other operation fails until it has.
    pub fn new(endpoint: impl AsRef<Path>, database: &str) -> Self {
        Self {
            path: endpoint.as_ref().join(database),
            db: RwLock::new(None),
            provision_lock: Mutex::new(()),
        }
    }

    fn db(&self) -> Result<Arc<Db>, StoreError> {
        self.db
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| StoreError::Fatal("database not provisioned".to_string()))
    }

    fn db_options() -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_write_buffer_size(32 * 1024 * 1024);
        opts.increase_parallelism(num_cpus::get().min(4) as i32);
        opts
    }

    fn manifest(&self, db: &Db, collection: &str) -> Result<Option<CollectionManifest>, StoreError> {
        let key = format!("{MANIFEST_PREFIX}{collection}");
        match db.get(key.as_bytes()).map_err(StoreError::from)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Fatal(format!("corrupt manifest for '{collection}': {e}"))),
            None => Ok(None),
        }
    }

    fn put_manifest(
        &self,
        db: &Db,
        collection: &str,
        manifest: &CollectionManifest,
    ) -> Result<(), StoreError> {
        let key = format!("{MANIFEST_PREFIX}{collection}");
        let bytes = serde_json::to_vec(manifest)
            .map_err(|e| StoreError::Fatal(format!("encode manifest: {e}")))?;
        db.put(key.as_bytes(), bytes).map_err(StoreError::from)
    }

    fn require_manifest(&self, db: &Db, collection: &str) -> Result<CollectionManifest, StoreError> {
        self.manifest(db, collection)?.ok_or_else(|| {
            StoreError::Fatal(format!("collection '{collection}' not provisioned"))
        })
    }

    /// Exact number of composite index entries for a collection.
    ///
    /// Test/inspection helper; the hot path never scans the index family.
    pub fn index_entry_count(&self, collection: &str) -> Result<u64, StoreError> {
        let db = self.db()?;
        let cf_name = format!("{collection}{INDEX_CF_SUFFIX}");
        let cf = db
            .cf_handle(&cf_name)
            .ok_or_else(|| StoreError::Fatal(format!("collection '{collection}' not provisioned")))?;
        let mut count = 0u64;
        for item in db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
            item.map_err(StoreError::from)?;
            count += 1;
        }
        Ok(count)
    }
}

#[async_trait]
impl DocumentStore for RocksStore {
    async fn ensure_database(&self) -> Result<(), StoreError> {
        let mut guard = self.db.write();
        if guard.is_some() {
            return Ok(());
        }

        tracing::info!("Opening document store at {}", self.path.display());
        let opts = Self::db_options();
        let existing = Db::list_cf(&opts, &self.path).unwrap_or_default();
        let db = if existing.is_empty() {
            Db::open(&opts, &self.path).map_err(StoreError::from)?
        } else {
            Db::open_cf(&opts, &self.path, existing).map_err(StoreError::from)?
        };
        *guard = Some(Arc::new(db));
        Ok(())
    }

    async fn ensure_collection(
        &self,
        collection: &str,
        partition_key_path: &str,
    ) -> Result<(), StoreError> {
        let db = self.db()?;
        let _guard = self.provision_lock.lock();

        if let Some(manifest) = self.manifest(&db, collection)? {
            if manifest.partition_key_path != partition_key_path {
                return Err(StoreError::PartitionKeyMismatch {
                    collection: collection.to_string(),
                    existing: manifest.partition_key_path,
                    requested: partition_key_path.to_string(),
                });
            }
            return Ok(());
        }

        let cf_opts = Options::default();
        for name in [collection.to_string(), format!("{collection}{INDEX_CF_SUFFIX}")] {
            if db.cf_handle(&name).is_none() {
                db.create_cf(&name, &cf_opts).map_err(StoreError::from)?;
            }
        }
        self.put_manifest(
            &db,
            collection,
            &CollectionManifest {
                partition_key_path: partition_key_path.to_string(),
                composite_indexes: Vec::new(),
            },
        )?;
        tracing::info!(
            collection,
            partition_key = partition_key_path,
            "collection created"
        );
        Ok(())
    }

    async fn composite_indexes(&self, collection: &str) -> Result<Vec<CompositeIndex>, StoreError> {
        let db = self.db()?;
        Ok(self.require_manifest(&db, collection)?.composite_indexes)
    }

    async fn add_composite_indexes(
        &self,
        collection: &str,
        indexes: &[CompositeIndex],
    ) -> Result<(), StoreError> {
        let db = self.db()?;
        let _guard = self.provision_lock.lock();

        let mut manifest = self.require_manifest(&db, collection)?;
        let mut added = 0usize;
        for index in indexes {
            if !manifest.composite_indexes.contains(index) {
                manifest.composite_indexes.push(index.clone());
                added += 1;
            }
        }
        if added > 0 {
            self.put_manifest(&db, collection, &manifest)?;
            tracing::info!(collection, added, "composite indexes added");
        }
        Ok(())
    }

    async fn upsert(&self, collection: &str, mut document: Document) -> Result<(), StoreError> {
        let db = self.db()?;
        let manifest = self.require_manifest(&db, collection)?;

        let id = match document.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            _ => return Err(StoreError::Fatal("document missing string 'id'".to_string())),
        };

        document.insert("_ts".to_string(), Value::from(Utc::now().timestamp()));

        let doc_cf = db
            .cf_handle(collection)
            .ok_or_else(|| StoreError::Fatal(format!("collection '{collection}' not provisioned")))?;
        let idx_cf_name = format!("{collection}{INDEX_CF_SUFFIX}");
        let idx_cf = db
            .cf_handle(&idx_cf_name)
            .ok_or_else(|| StoreError::Fatal(format!("collection '{collection}' not provisioned")))?;

        let previous: Option<Document> = match db
            .get_cf(&doc_cf, id.as_bytes())
            .map_err(StoreError::from)?
        {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Fatal(format!("corrupt document '{id}': {e}")))?,
            None => None,
        };

        let mut batch = WriteBatch::default();
        if let Some(previous) = &previous {
            for key in index_entry_keys(&manifest.composite_indexes, previous, &id) {
                batch.delete_cf(&idx_cf, key);
            }
        }
        for key in index_entry_keys(&manifest.composite_indexes, &document, &id) {
            batch.put_cf(&idx_cf, key, []);
        }
        let bytes = serde_json::to_vec(&document)
            .map_err(|e| StoreError::Fatal(format!("encode document: {e}")))?;
        batch.put_cf(&doc_cf, id.as_bytes(), bytes);

        db.write(batch).map_err(StoreError::from)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let db = self.db()?;
        let doc_cf = db
            .cf_handle(collection)
            .ok_or_else(|| StoreError::Fatal(format!("collection '{collection}' not provisioned")))?;
        match db.get_cf(&doc_cf, id.as_bytes()).map_err(StoreError::from)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Fatal(format!("corrupt document '{id}': {e}"))),
            None => Ok(None),
        }
    }

    async fn count(&self, collection: &str) -> Result<u64, StoreError> {
        let db = self.db()?;
        let doc_cf = db
            .cf_handle(collection)
            .ok_or_else(|| StoreError::Fatal(format!("collection '{collection}' not provisioned")))?;
        let mut count = 0u64;
        for item in db.iterator_cf(&doc_cf, rocksdb::IteratorMode::Start) {
            item.map_err(StoreError::from)?;
            count += 1;
        }
        Ok(count)
    }
}

/// All index entry keys for one document.
fn index_entry_keys(indexes: &[CompositeIndex], document: &Document, id: &str) -> Vec<Vec<u8>> {
    indexes
        .iter()
        .enumerate()
        .map(|(seq, index)| {
            let mut key = Vec::with_capacity(32);
            key.extend_from_slice(&(seq as u32).to_be_bytes());
            for path in &index.paths {
                let field = path.path.trim_start_matches('/');
                let component = encode_component(document.get(field), path.order);
                key.extend_from_slice(&component);
            }
            key.extend_from_slice(id.as_bytes());
            key
        })
        .collect()
}

/// Order-preserving encoding of one index component.
fn encode_component(value: Option<&Value>, order: IndexOrder) -> Vec<u8> {
    let mut bytes = match value {
        None | Some(Value::Null) => vec![0x00],
        Some(Value::Bool(b)) => vec![0x01, u8::from(*b)],
        Some(Value::Number(n)) => {
            let mut out = vec![0x02];
            out.extend_from_slice(&encode_f64(n.as_f64().unwrap_or(f64::NAN)));
            out
        }
        Some(Value::String(s)) => {
            let mut out = vec![0x03];
            out.extend_from_slice(s.as_bytes());
            out.push(0x00);
            out
        }
        Some(other) => {
            let mut out = vec![0x04];
            out.extend_from_slice(other.to_string().as_bytes());
            out.push(0x00);
            out
        }
    };
    if order == IndexOrder::Descending {
        for byte in &mut bytes {
            *byte = !*byte;
        }
    }
    bytes
}

/// Encode an f64 so that unsigned byte order matches numeric order.
fn encode_f64(value: f64) -> [u8; 8] {
    let bits = value.to_bits();
    let ordered = if value.is_sign_negative() {
        !bits
    } else {
        bits ^ (1 << 63)
    };
    ordered.to_be_bytes()
}
