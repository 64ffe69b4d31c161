//! In-process document store for development and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{unix_now, DocumentStore, PersistedRecord, StoreError};
use crate::doc::{Delta, DocumentId};

/// Volatile store; contents are lost with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<DocumentId, PersistedRecord>>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save` calls.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub async fn record(&self, id: &DocumentId) -> Option<PersistedRecord> {
        self.records.read().await.get(id).cloned()
    }

    /// Seed a record directly.
    pub async fn insert(&self, record: PersistedRecord) {
        self.records.write().await.insert(record.id.clone(), record);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load(&self, id: &DocumentId) -> Result<Option<PersistedRecord>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn save(
        &self,
        id: &DocumentId,
        snapshot: Vec<u8>,
        delta: Delta,
    ) -> Result<(), StoreError> {
        let record = PersistedRecord {
            id: id.clone(),
            snapshot,
            delta,
            updated_at: unix_now(),
        };
        self.records.write().await.insert(id.clone(), record);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
