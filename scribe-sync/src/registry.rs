//! Live documents by id.
//!
//! The map lock is only held for lookup, registration and eviction. Loading
//! and flushing happen outside it; eviction re-checks under the lock that the
//! document is still the registered instance and still has no connections,
//! so a joiner arriving mid-flush keeps the document alive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

use crate::auth::UserIdentity;
use crate::broadcast::Outbound;
use crate::doc::{ConnectionId, DocumentId};
use crate::shared::{DocumentOptions, SharedDocument};
use crate::storage::{PersistenceAdapter, WriteOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("document {id} still has {connections} connection(s)")]
    DocumentInUse { id: DocumentId, connections: usize },
    #[error("document {0} is not live")]
    NotFound(DocumentId),
}

pub struct DocumentRegistry {
    docs: RwLock<HashMap<DocumentId, Arc<SharedDocument>>>,
    persistence: PersistenceAdapter,
    options: DocumentOptions,
}

impl DocumentRegistry {
    pub fn new(persistence: PersistenceAdapter, options: DocumentOptions) -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            persistence,
            options,
        }
    }

    pub fn persistence(&self) -> &PersistenceAdapter {
        &self.persistence
    }

    pub fn options(&self) -> &DocumentOptions {
        &self.options
    }

    /// Look up or create the document, then make sure it is loaded.
    pub async fn get_or_create(&self, id: &DocumentId) -> Arc<SharedDocument> {
        let doc = match self.get(id).await {
            Some(doc) => doc,
            None => {
                let mut docs = self.docs.write().await;
                Arc::clone(docs.entry(id.clone()).or_insert_with(|| self.create(id)))
            }
        };
        doc.ensure_loaded(&self.persistence).await;
        doc
    }

    pub async fn get(&self, id: &DocumentId) -> Option<Arc<SharedDocument>> {
        self.docs.read().await.get(id).cloned()
    }

    fn create(&self, id: &DocumentId) -> Arc<SharedDocument> {
        log::info!("Creating shared doc {id}");
        Arc::new(SharedDocument::new(id.clone(), &self.options))
    }

    /// Register a connection on `id`, creating the document if needed.
    ///
    /// Lookup and registration happen under one write lock, so the document
    /// cannot be evicted in between.
    pub async fn join(
        &self,
        id: &DocumentId,
        connection: ConnectionId,
        user: UserIdentity,
    ) -> (Arc<SharedDocument>, broadcast::Receiver<Outbound>) {
        let (doc, rx) = {
            let mut docs = self.docs.write().await;
            let doc = Arc::clone(docs.entry(id.clone()).or_insert_with(|| self.create(id)));
            let rx = doc.add_connection(connection, user).await;
            (doc, rx)
        };
        doc.ensure_loaded(&self.persistence).await;
        (doc, rx)
    }

    /// Unregister a connection. The last one out flushes and evicts.
    ///
    /// Returns the flush outcome when this was the last connection.
    pub async fn leave(
        &self,
        doc: &Arc<SharedDocument>,
        connection: &ConnectionId,
    ) -> Option<WriteOutcome> {
        if doc.remove_connection(connection).await > 0 {
            return None;
        }
        let outcome = doc.flush(&self.persistence).await;
        self.evict_if_idle(doc).await;
        Some(outcome)
    }

    async fn evict_if_idle(&self, doc: &Arc<SharedDocument>) -> bool {
        let mut docs = self.docs.write().await;
        let Some(current) = docs.get(doc.id()) else {
            return false;
        };
        if !Arc::ptr_eq(current, doc) || doc.connection_count().await > 0 {
            return false;
        }
        docs.remove(doc.id());
        log::info!("Evicted shared doc {}", doc.id());
        true
    }

    /// Drop an idle document without flushing.
    pub async fn remove(&self, id: &DocumentId) -> Result<Arc<SharedDocument>, RegistryError> {
        let mut docs = self.docs.write().await;
        let doc = docs
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        let connections = doc.connection_count().await;
        if connections > 0 {
            return Err(RegistryError::DocumentInUse {
                id: id.clone(),
                connections,
            });
        }
        docs.remove(id);
        Ok(doc)
    }

    /// Replace a document's content from an uploaded text file.
    ///
    /// Live connections receive the change like any other update. When
    /// nobody is connected the document is flushed and evicted right away,
    /// and the flush outcome is returned.
    pub async fn seed_text(&self, id: &DocumentId, text: &str) -> Option<WriteOutcome> {
        let doc = self.get_or_create(id).await;
        doc.replace_text(text).await;
        if doc.connection_count().await > 0 {
            return None;
        }
        let outcome = doc.flush(&self.persistence).await;
        self.evict_if_idle(&doc).await;
        Some(outcome)
    }

    /// Flush every live document (shutdown path).
    pub async fn flush_all(&self) -> Vec<(DocumentId, WriteOutcome)> {
        let docs: Vec<Arc<SharedDocument>> = self.docs.read().await.values().cloned().collect();
        let mut outcomes = Vec::with_capacity(docs.len());
        for doc in docs {
            let outcome = doc.flush(&self.persistence).await;
            outcomes.push((doc.id().clone(), outcome));
        }
        outcomes
    }

    /// Expire stale presence in every live document. Returns how many entries went.
    pub async fn sweep_awareness(&self, now: Instant, timeout: Duration) -> usize {
        let docs: Vec<Arc<SharedDocument>> = self.docs.read().await.values().cloned().collect();
        let mut removed = 0;
        for doc in docs {
            removed += doc.sweep_awareness(now, timeout).await.len();
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }

    pub async fn document_ids(&self) -> Vec<DocumentId> {
        self.docs.read().await.keys().cloned().collect()
    }
}

impl std::fmt::Debug for DocumentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentRegistry")
            .field("persistence", &self.persistence)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::{Notify, Semaphore};

    use crate::doc::{CrdtDocument, Delta, DeltaOp, Origin};
    use crate::storage::{DocumentStore, MemoryStore, PersistedRecord, StoreError};

    /// Holds every save until a permit is released.
    struct GatedStore {
        inner: MemoryStore,
        entered: Notify,
        release: Semaphore,
    }

    impl GatedStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                entered: Notify::new(),
                release: Semaphore::new(0),
            }
        }
    }

    #[async_trait]
    impl DocumentStore for GatedStore {
        async fn load(&self, id: &DocumentId) -> Result<Option<PersistedRecord>, StoreError> {
            self.inner.load(id).await
        }

        async fn save(&self, id: &DocumentId, s: Vec<u8>, d: Delta) -> Result<(), StoreError> {
            self.entered.notify_one();
            self.release
                .acquire()
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?
                .forget();
            self.inner.save(id, s, d).await
        }
    }

    struct FailingStore;

    #[async_trait]
    impl DocumentStore for FailingStore {
        async fn load(&self, _id: &DocumentId) -> Result<Option<PersistedRecord>, StoreError> {
            Err(StoreError::Database("disk on fire".into()))
        }

        async fn save(&self, _id: &DocumentId, _s: Vec<u8>, _d: Delta) -> Result<(), StoreError> {
            Err(StoreError::Database("disk on fire".into()))
        }
    }

    fn registry() -> (Arc<MemoryStore>, Arc<DocumentRegistry>) {
        let store = Arc::new(MemoryStore::new());
        let persistence = PersistenceAdapter::new(store.clone(), Duration::from_secs(1));
        (
            store,
            Arc::new(DocumentRegistry::new(persistence, DocumentOptions::default())),
        )
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_single_instance() {
        let (_store, registry) = registry();
        let id = DocumentId::new("d1");
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let id = id.clone();
                tokio::spawn(async move { registry.get_or_create(&id).await })
            })
            .collect();
        let mut docs = Vec::new();
        for handle in handles {
            docs.push(handle.await.unwrap());
        }
        assert!(docs.iter().all(|d| Arc::ptr_eq(d, &docs[0])));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_last_one_out_flushes_and_evicts() {
        let (store, registry) = registry();
        let id = DocumentId::new("d1");
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        let (doc, _rx_a) = registry.join(&id, a, UserIdentity::Anonymous).await;
        let (_, _rx_b) = registry.join(&id, b, UserIdentity::Anonymous).await;

        let update = CrdtDocument::new().insert(0, "hello world", Origin::Local);
        doc.apply_update(&update, Origin::Connection(a)).await.unwrap();

        assert_eq!(registry.leave(&doc, &a).await, None);
        assert_eq!(store.save_count(), 0);
        assert_eq!(registry.leave(&doc, &b).await, Some(WriteOutcome::Written));
        assert_eq!(store.save_count(), 1);
        assert!(registry.is_empty().await);

        let record = store.record(&id).await.unwrap();
        assert_eq!(record.delta, vec![DeltaOp::insert("hello world")]);
    }

    #[tokio::test]
    async fn test_join_during_last_flush_keeps_instance() {
        let store = Arc::new(GatedStore::new());
        let persistence = PersistenceAdapter::new(store.clone(), Duration::from_secs(5));
        let registry = Arc::new(DocumentRegistry::new(persistence, DocumentOptions::default()));
        let id = DocumentId::new("d1");
        let a = ConnectionId::new();
        let (doc, _rx_a) = registry.join(&id, a, UserIdentity::Anonymous).await;
        doc.replace_text("first").await;

        let leaving = {
            let registry = Arc::clone(&registry);
            let doc = Arc::clone(&doc);
            tokio::spawn(async move { registry.leave(&doc, &a).await })
        };
        store.entered.notified().await;

        let b = ConnectionId::new();
        let (rejoined, _rx_b) = registry.join(&id, b, UserIdentity::Anonymous).await;
        assert!(Arc::ptr_eq(&doc, &rejoined));
        rejoined.replace_text("second").await;

        store.release.add_permits(1);
        assert_eq!(leaving.await.unwrap(), Some(WriteOutcome::Written));
        let live = registry.get(&id).await.unwrap();
        assert!(Arc::ptr_eq(&live, &doc));
        assert_eq!(
            store.inner.record(&id).await.unwrap().delta,
            vec![DeltaOp::insert("first")]
        );

        store.release.add_permits(1);
        assert_eq!(registry.leave(&rejoined, &b).await, Some(WriteOutcome::Written));
        assert!(registry.is_empty().await);
        assert_eq!(
            store.inner.record(&id).await.unwrap().delta,
            vec![DeltaOp::insert("second")]
        );
    }

    #[tokio::test]
    async fn test_failed_flush_still_evicts() {
        let persistence = PersistenceAdapter::new(Arc::new(FailingStore), Duration::from_secs(1));
        let registry = DocumentRegistry::new(persistence, DocumentOptions::default());
        let id = DocumentId::new("doomed");
        let conn = ConnectionId::new();
        let (doc, _rx) = registry.join(&id, conn, UserIdentity::Anonymous).await;
        doc.replace_text("unsaved").await;

        assert_eq!(
            registry.leave(&doc, &conn).await,
            Some(WriteOutcome::Failed)
        );
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_idle_document_never_written() {
        let (store, registry) = registry();
        let id = DocumentId::new("empty");
        let conn = ConnectionId::new();
        let (doc, _rx) = registry.join(&id, conn, UserIdentity::Anonymous).await;
        assert_eq!(
            registry.leave(&doc, &conn).await,
            Some(WriteOutcome::SkippedEmpty)
        );
        assert_eq!(store.save_count(), 0);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_reopen_loads_snapshot() {
        let (_store, registry) = registry();
        let id = DocumentId::new("d1");
        let conn = ConnectionId::new();
        let (doc, _rx) = registry.join(&id, conn, UserIdentity::Anonymous).await;
        doc.replace_text("hello").await;
        registry.leave(&doc, &conn).await;

        let (reopened, _rx) = registry
            .join(&id, ConnectionId::new(), UserIdentity::Anonymous)
            .await;
        assert!(!Arc::ptr_eq(&doc, &reopened));
        assert_eq!(reopened.text().await, "hello");
    }

    #[tokio::test]
    async fn test_remove_rejects_document_in_use() {
        let (_store, registry) = registry();
        let id = DocumentId::new("busy");
        let conn = ConnectionId::new();
        let (doc, _rx) = registry.join(&id, conn, UserIdentity::Anonymous).await;

        assert_eq!(
            registry.remove(&id).await.unwrap_err(),
            RegistryError::DocumentInUse {
                id: id.clone(),
                connections: 1
            }
        );
        doc.remove_connection(&conn).await;
        assert!(registry.remove(&id).await.is_ok());
        assert_eq!(
            registry.remove(&id).await.unwrap_err(),
            RegistryError::NotFound(id)
        );
    }

    #[tokio::test]
    async fn test_seed_without_connections_persists() {
        let (store, registry) = registry();
        let id = DocumentId::new("upload");
        assert_eq!(
            registry.seed_text(&id, "from a file").await,
            Some(WriteOutcome::Written)
        );
        assert!(registry.is_empty().await);
        assert_eq!(
            store.record(&id).await.unwrap().delta,
            vec![DeltaOp::insert("from a file")]
        );
    }

    #[tokio::test]
    async fn test_seed_with_connection_broadcasts() {
        let (store, registry) = registry();
        let id = DocumentId::new("live");
        let conn = ConnectionId::new();
        let (doc, mut rx) = registry.join(&id, conn, UserIdentity::Anonymous).await;

        assert_eq!(registry.seed_text(&id, "new text").await, None);
        let out = rx.recv().await.unwrap();
        assert!(out.is_for(conn));
        assert_eq!(doc.text().await, "new text");
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_flush_all() {
        let (store, registry) = registry();
        for (name, text) in [("a", "alpha"), ("b", "")] {
            let doc = registry.get_or_create(&DocumentId::new(name)).await;
            if !text.is_empty() {
                doc.replace_text(text).await;
            }
        }
        let mut outcomes = registry.flush_all().await;
        outcomes.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(
            outcomes,
            vec![
                (DocumentId::new("a"), WriteOutcome::Written),
                (DocumentId::new("b"), WriteOutcome::SkippedEmpty),
            ]
        );
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_isolated_registries() {
        let (_s1, one) = registry();
        let (_s2, two) = registry();
        one.get_or_create(&DocumentId::new("x")).await;
        assert_eq!(one.len().await, 1);
        assert!(two.is_empty().await);
        assert_eq!(one.document_ids().await, vec![DocumentId::new("x")]);
    }
}
