//! Snapshot persistence for room documents.
//!
//! ```text
//! ┌─────────────┐  autosave / destroy   ┌────────────────┐
//! │ Room task   │ ────────────────────► │ SnapshotStore  │
//! │ (in-memory) │   (spawned, never     │  memory │ rocks│
//! └──────┬──────┘    awaited inline)    └───────┬────────┘
//!        │ on first join                        │
//!        └──────────── load_snapshot ◄──────────┘
//! ```
//!
//! The store is an external collaborator: rooms never block their apply
//! path on it.

pub mod rocks;

use std::collections::HashMap;

use async_trait::async_trait;
use forma_core::DocumentSnapshot;
use tokio::sync::RwLock;
use uuid::Uuid;

pub use rocks::{RocksSnapshotStore, SnapshotMetadata, StoreConfig, StoreError};

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save_snapshot(
        &self,
        document_id: Uuid,
        version: u64,
        snapshot: &DocumentSnapshot,
    ) -> Result<(), StoreError>;

    /// `Ok(None)` when the document was never saved.
    async fn load_snapshot(&self, document_id: Uuid) -> Result<Option<DocumentSnapshot>, StoreError>;
}

/// Process-local store, used when no storage path is configured.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<Uuid, DocumentSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save_snapshot(
        &self,
        document_id: Uuid,
        version: u64,
        snapshot: &DocumentSnapshot,
    ) -> Result<(), StoreError> {
        // check and insert under one write guard; out-of-order saves must
        // not roll a document back
        let mut snapshots = self.snapshots.write().await;
        if snapshots.get(&document_id).is_some_and(|s| s.version > version) {
            return Ok(());
        }
        snapshots.insert(document_id, snapshot.clone());
        Ok(())
    }

    async fn load_snapshot(&self, document_id: Uuid) -> Result<Option<DocumentSnapshot>, StoreError> {
        Ok(self.snapshots.read().await.get(&document_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forma_core::Document;

    #[tokio::test]
    async fn test_memory_store_keeps_newest() {
        let store = MemorySnapshotStore::new();
        let doc = Document::from_text(Uuid::new_v4(), "v0");
        let mut newer = doc.snapshot();
        newer.version = 4;
        let mut older = doc.snapshot();
        older.version = 2;

        store.save_snapshot(doc.id(), 4, &newer).await.unwrap();
        store.save_snapshot(doc.id(), 2, &older).await.unwrap();

        let loaded = store.load_snapshot(doc.id()).await.unwrap().unwrap();
        assert_eq!(loaded.version, 4);
        assert!(store.load_snapshot(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_memory_store_concurrent_saves_keep_newest() {
        let store = std::sync::Arc::new(MemorySnapshotStore::new());
        for _ in 0..20 {
            let doc = Document::from_text(Uuid::new_v4(), "v0");
            let mut newer = doc.snapshot();
            newer.version = 7;
            let older = doc.snapshot();
            let id = doc.id();

            let (first, second) = (store.clone(), store.clone());
            let (newer_save, older_save) = (newer.clone(), older.clone());
            let a = tokio::spawn(async move { first.save_snapshot(id, 7, &newer_save).await });
            let b = tokio::spawn(async move { second.save_snapshot(id, 0, &older_save).await });
            a.await.unwrap().unwrap();
            b.await.unwrap().unwrap();

            assert_eq!(store.load_snapshot(id).await.unwrap(), Some(newer));
        }
    }
}
