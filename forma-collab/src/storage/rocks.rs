//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots`: bincode [`DocumentSnapshot`]s, LZ4 compressed, keyed by document id
//! - `metadata`: [`SnapshotMetadata`] per document (version, sizes, timestamps)
//!
//! RocksDB calls are blocking, so the async [`SnapshotStore`] impl runs them on
//! the blocking pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use forma_core::DocumentSnapshot;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::SnapshotStore;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

type Db = DBWithThreadMode<SingleThreaded>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    /// fsync on every snapshot write
    pub sync_writes: bool,
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("forma_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            max_open_files: 64,
            ..Self::default()
        }
    }
}

/// Bookkeeping stored next to each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub document_id: Uuid,
    pub version: u64,
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl SnapshotMetadata {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Storage task failed: {0}")]
    Task(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable snapshot store. Cheap to clone; clones share the database.
#[derive(Clone)]
pub struct RocksSnapshotStore {
    db: Arc<Db>,
    config: Arc<StoreConfig>,
    /// Held across the version check and the write of an async save.
    writes: Arc<Mutex<()>>,
}

impl RocksSnapshotStore {
    /// Open (or create) the database and its column families.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&cache, &config)))
            .collect();

        let db = Db::open_cf_descriptors(&db_opts, &config.path, descriptors)?;
        log::info!("Opened snapshot store at {}", config.path.display());
        Ok(Self {
            db: Arc::new(db),
            config: Arc::new(config),
            writes: Arc::new(Mutex::new(())),
        })
    }

    fn cf_options(cache: &Cache, config: &StoreConfig) -> Options {
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);

        let mut opts = Options::default();
        opts.set_block_based_table_factory(&block_opts);
        // Values are already LZ4 framed.
        opts.set_compression_type(DBCompressionType::None);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Blocking API ─────────────────────────────────────────

    pub fn put(&self, snapshot: &DocumentSnapshot) -> Result<SnapshotMetadata, StoreError> {
        let raw = bincode::serde::encode_to_vec(snapshot, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&raw);

        let now = forma_core::now_millis();
        let created_at = self
            .metadata(snapshot.document_id)?
            .map_or(now, |existing| existing.created_at);
        let meta = SnapshotMetadata {
            document_id: snapshot.document_id,
            version: snapshot.version,
            snapshot_size: raw.len() as u64,
            compressed_size: compressed.len() as u64,
            created_at,
            updated_at: now,
        };

        let key = snapshot.document_id.as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_SNAPSHOTS)?, key, &compressed);
        batch.put_cf(self.cf(CF_METADATA)?, key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(meta)
    }

    pub fn get(&self, document_id: Uuid) -> Result<Option<DocumentSnapshot>, StoreError> {
        let Some(compressed) = self.db.get_cf(self.cf(CF_SNAPSHOTS)?, document_id.as_bytes())? else {
            return Ok(None);
        };
        let raw = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let (snapshot, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(Some(snapshot))
    }

    pub fn metadata(&self, document_id: Uuid) -> Result<Option<SnapshotMetadata>, StoreError> {
        self.db
            .get_cf(self.cf(CF_METADATA)?, document_id.as_bytes())?
            .map(|bytes| SnapshotMetadata::decode(&bytes))
            .transpose()
    }

    pub fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_METADATA)?, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Deserialization("invalid document key".into()))?;
            ids.push(Uuid::from_bytes(bytes));
        }
        Ok(ids)
    }

    pub fn delete(&self, document_id: Uuid) -> Result<(), StoreError> {
        let key = document_id.as_bytes();
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_SNAPSHOTS)?, key);
        batch.delete_cf(self.cf(CF_METADATA)?, key);
        self.db.write(batch)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

#[async_trait]
impl SnapshotStore for RocksSnapshotStore {
    async fn save_snapshot(
        &self,
        document_id: Uuid,
        version: u64,
        snapshot: &DocumentSnapshot,
    ) -> Result<(), StoreError> {
        let store = self.clone();
        let snapshot = snapshot.clone();
        // the guard travels with the blocking task so a dropped caller
        // cannot release it early
        let guard = self.writes.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            if store.metadata(document_id)?.is_some_and(|m| m.version > version) {
                log::debug!("Skipping stale snapshot of {document_id} at version {version}");
                return Ok(());
            }
            store.put(&snapshot).map(|_| ())
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    async fn load_snapshot(&self, document_id: Uuid) -> Result<Option<DocumentSnapshot>, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.get(document_id))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forma_core::{Document, FieldValue, OpKind, Operation};

    fn open_temp() -> (tempfile::TempDir, RocksSnapshotStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksSnapshotStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    fn sample_snapshot() -> DocumentSnapshot {
        let mut doc = Document::from_text(Uuid::new_v4(), "Name: ____ Email: ____");
        let op = Operation::new(
            OpKind::Update { path: "title".into(), value: FieldValue::from("Signup") },
            doc.id(),
            "alice",
            1,
        );
        doc.apply(&op).unwrap();
        doc.snapshot()
    }

    #[test]
    fn test_store_open() {
        let (dir, store) = open_temp();
        assert_eq!(store.path(), dir.path());
        assert!(store.list_documents().unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_put_get() {
        let (_dir, store) = open_temp();
        let snapshot = sample_snapshot();

        let meta = store.put(&snapshot).unwrap();
        assert_eq!(meta.document_id, snapshot.document_id);
        assert_eq!(meta.version, 1);
        assert!(meta.compressed_size > 0);

        assert_eq!(store.get(snapshot.document_id).unwrap(), Some(snapshot.clone()));
        assert_eq!(store.list_documents().unwrap(), vec![snapshot.document_id]);
    }

    #[test]
    fn test_snapshot_missing_and_delete() {
        let (_dir, store) = open_temp();
        assert!(store.get(Uuid::new_v4()).unwrap().is_none());

        let snapshot = sample_snapshot();
        store.put(&snapshot).unwrap();
        store.delete(snapshot.document_id).unwrap();
        assert!(store.get(snapshot.document_id).unwrap().is_none());
        assert!(store.metadata(snapshot.document_id).unwrap().is_none());
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = sample_snapshot();
        {
            let store = RocksSnapshotStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.put(&snapshot).unwrap();
        }
        let store = RocksSnapshotStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        let loaded = store.get(snapshot.document_id).unwrap().unwrap();
        assert_eq!(loaded.content, "Name: ____ Email: ____");
        assert_eq!(loaded.properties.get("title"), Some(&FieldValue::from("Signup")));
    }

    #[tokio::test]
    async fn test_async_save_ignores_stale_version() {
        let (_dir, store) = open_temp();
        let snapshot = sample_snapshot();
        store.save_snapshot(snapshot.document_id, 1, &snapshot).await.unwrap();

        let mut stale = snapshot.clone();
        stale.version = 0;
        stale.content.clear();
        store.save_snapshot(snapshot.document_id, 0, &stale).await.unwrap();

        let loaded = store.load_snapshot(snapshot.document_id).await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_keep_newest() {
        let (_dir, store) = open_temp();
        for _ in 0..20 {
            let newer = sample_snapshot();
            let mut older = newer.clone();
            older.version = 0;
            older.content.clear();
            let id = newer.document_id;

            let (a, b) = tokio::join!(
                store.save_snapshot(id, newer.version, &newer),
                store.save_snapshot(id, older.version, &older),
            );
            a.unwrap();
            b.unwrap();
            assert_eq!(store.load_snapshot(id).await.unwrap(), Some(newer));
            assert_eq!(store.metadata(id).unwrap().map(|m| m.version), Some(1));
        }
    }
}
