//! Persistent storage for shared documents.
//!
//! ```text
//! ┌──────────────┐  bind / write   ┌────────────────────┐   load / save   ┌───────────────┐
//! │ Registry     │ ──────────────► │ PersistenceAdapter │ ──────────────► │ DocumentStore │
//! │ (join/leave) │                 │ (timeouts, policy) │                 │ (RocksDB/mem) │
//! └──────────────┘                 └────────────────────┘                 └───────────────┘
//! ```
//!
//! The store only ever sees opaque CRDT snapshots plus a JSON-friendly
//! delta mirror. The adapter owns the failure policy: a failed load starts
//! the document empty, a failed or timed-out write is logged and dropped,
//! and an empty delta is never written.

pub mod memory;
pub mod rocks;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::doc::{Delta, DocumentId};

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("storage task failed: {0}")]
    Task(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Task(e.to_string())
    }
}

/// What the external store holds for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub id: DocumentId,
    /// Full CRDT state as a v1 update.
    pub snapshot: Vec<u8>,
    /// Plain delta mirror for consumers that don't decode CRDT bytes.
    pub delta: Delta,
    /// Seconds since the Unix epoch.
    pub updated_at: u64,
}

/// Backing store collaborator.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load(&self, id: &DocumentId) -> Result<Option<PersistedRecord>, StoreError>;

    async fn save(&self, id: &DocumentId, snapshot: Vec<u8>, delta: Delta)
        -> Result<(), StoreError>;
}

/// Result of a flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Nothing to write; the stored record was left untouched.
    SkippedEmpty,
    Failed,
    TimedOut,
}

impl WriteOutcome {
    pub fn is_written(self) -> bool {
        self == WriteOutcome::Written
    }
}

/// Applies the load/write policy on top of a [`DocumentStore`].
#[derive(Clone)]
pub struct PersistenceAdapter {
    store: Arc<dyn DocumentStore>,
    timeout: Duration,
}

impl PersistenceAdapter {
    pub fn new(store: Arc<dyn DocumentStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Adapter over a fresh [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Duration::from_secs(10))
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Load the last snapshot for `id`, if any.
    ///
    /// Never fails: errors and timeouts are logged and reported as `None`,
    /// so the document starts empty.
    pub async fn bind(&self, id: &DocumentId) -> Option<Vec<u8>> {
        match tokio::time::timeout(self.timeout, self.store.load(id)).await {
            Ok(Ok(Some(record))) => {
                log::debug!(
                    "Loaded snapshot for doc {id} ({} bytes)",
                    record.snapshot.len()
                );
                Some(record.snapshot)
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                log::error!("Failed to load doc {id}, starting empty: {e}");
                None
            }
            Err(_) => {
                log::error!(
                    "Loading doc {id} timed out after {:?}, starting empty",
                    self.timeout
                );
                None
            }
        }
    }

    /// Persist a snapshot unless `delta` is empty.
    pub async fn write(&self, id: &DocumentId, snapshot: Vec<u8>, delta: Delta) -> WriteOutcome {
        if delta.is_empty() {
            log::debug!("Skipping write for doc {id}: empty delta");
            return WriteOutcome::SkippedEmpty;
        }
        match tokio::time::timeout(self.timeout, self.store.save(id, snapshot, delta)).await {
            Ok(Ok(())) => {
                log::info!("Persisted doc {id}");
                WriteOutcome::Written
            }
            Ok(Err(e)) => {
                log::error!("Failed to persist doc {id}: {e}");
                WriteOutcome::Failed
            }
            Err(_) => {
                log::error!("Persisting doc {id} timed out after {:?}", self.timeout);
                WriteOutcome::TimedOut
            }
        }
    }
}

impl std::fmt::Debug for PersistenceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceAdapter")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
