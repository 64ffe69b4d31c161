//! One live document: CRDT state, presence and the connection fan-out.
//!
//! ```text
//!   apply_update ──► Mutex<CrdtDocument> ──on_update──► BroadcastGroup ──► connections
//!   apply_awareness ─► Mutex<AwarenessTracker> ─────────┘
//! ```
//!
//! Broadcast happens inside the mutation, after the apply, so per-document
//! broadcast order equals apply order. Updates loaded from persistence are
//! not broadcast. Store I/O never runs while the document lock is held.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Mutex, OnceCell};

use crate::auth::UserIdentity;
use crate::awareness::{AwarenessChange, AwarenessError, AwarenessTracker, ClientId};
use crate::broadcast::{BroadcastGroup, Outbound};
use crate::doc::{ConnectionId, CrdtDocument, CrdtError, CrdtOptions, Delta, DocumentId, Origin};
use crate::protocol::Message;
use crate::storage::{PersistenceAdapter, WriteOutcome};

/// Settings applied to every document a registry creates.
#[derive(Debug, Clone)]
pub struct DocumentOptions {
    pub crdt: CrdtOptions,
    /// Per-connection broadcast buffer.
    pub broadcast_capacity: usize,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self {
            crdt: CrdtOptions::default(),
            broadcast_capacity: 256,
        }
    }
}

pub struct SharedDocument {
    id: DocumentId,
    doc: Mutex<CrdtDocument>,
    awareness: Mutex<AwarenessTracker>,
    group: Arc<BroadcastGroup>,
    loaded: OnceCell<()>,
    flush_lock: Mutex<()>,
    gc: bool,
}

impl SharedDocument {
    pub fn new(id: DocumentId, options: &DocumentOptions) -> Self {
        let group = Arc::new(BroadcastGroup::new(options.broadcast_capacity));
        let mut doc = CrdtDocument::with_options(&options.crdt);

        let fan_out = Arc::clone(&group);
        doc.on_update(move |event| {
            if event.origin == Origin::Persistence {
                return;
            }
            fan_out.broadcast_message(event.origin, &Message::update(event.update.clone()));
        });

        Self {
            id,
            doc: Mutex::new(doc),
            awareness: Mutex::new(AwarenessTracker::with_random_id()),
            group,
            loaded: OnceCell::new(),
            flush_lock: Mutex::new(()),
            gc: options.crdt.gc,
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn group(&self) -> &Arc<BroadcastGroup> {
        &self.group
    }

    /// Whether deleted history is compacted.
    pub fn gc_enabled(&self) -> bool {
        self.gc
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Load the persisted snapshot exactly once; concurrent callers wait.
    pub async fn ensure_loaded(&self, persistence: &PersistenceAdapter) {
        self.loaded
            .get_or_init(|| async {
                let Some(snapshot) = persistence.bind(&self.id).await else {
                    return;
                };
                let doc = self.doc.lock().await;
                if let Err(e) = doc.apply_update(&snapshot, Origin::Persistence) {
                    log::error!("Stored snapshot for doc {} is unreadable, starting empty: {e}", self.id);
                }
            })
            .await;
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.initialized()
    }

    /// Snapshot under the lock, write outside it.
    ///
    /// Flushes are serialized per document; a document that never finished
    /// loading is never written.
    pub async fn flush(&self, persistence: &PersistenceAdapter) -> WriteOutcome {
        let _flush = self.flush_lock.lock().await;
        if !self.is_loaded() {
            log::debug!("Doc {} never loaded, nothing to flush", self.id);
            return WriteOutcome::SkippedEmpty;
        }
        let (snapshot, delta) = {
            let doc = self.doc.lock().await;
            (doc.snapshot(), doc.to_delta())
        };
        persistence.write(&self.id, snapshot, delta).await
    }

    // ─── Connections ──────────────────────────────────────────────────

    pub async fn add_connection(
        &self,
        id: ConnectionId,
        user: UserIdentity,
    ) -> broadcast::Receiver<Outbound> {
        self.group.add_connection(id, user).await
    }

    /// Returns the number of connections left.
    pub async fn remove_connection(&self, id: &ConnectionId) -> usize {
        self.group.remove_connection(id).await
    }

    pub async fn connection_count(&self) -> usize {
        self.group.connection_count().await
    }

    // ─── Content ──────────────────────────────────────────────────────

    pub async fn apply_update(&self, update: &[u8], origin: Origin) -> Result<(), CrdtError> {
        self.doc.lock().await.apply_update(update, origin)
    }

    pub async fn state_vector(&self) -> Vec<u8> {
        self.doc.lock().await.encode_state_vector()
    }

    /// Everything the holder of `state_vector` is missing (all state if `None`).
    pub async fn encode_state_as_update(
        &self,
        state_vector: Option<&[u8]>,
    ) -> Result<Vec<u8>, CrdtError> {
        self.doc.lock().await.encode_state_as_update(state_vector)
    }

    pub async fn snapshot(&self) -> Vec<u8> {
        self.doc.lock().await.snapshot()
    }

    pub async fn text(&self) -> String {
        self.doc.lock().await.text()
    }

    pub async fn to_delta(&self) -> Delta {
        self.doc.lock().await.to_delta()
    }

    /// Replace the whole content with `text`, broadcasting to every connection.
    pub async fn replace_text(&self, text: &str) -> Vec<u8> {
        self.doc.lock().await.replace_text(text, Origin::Local)
    }

    // ─── Awareness ────────────────────────────────────────────────────

    /// Apply a peer's awareness update and forward the accepted entries.
    pub async fn apply_awareness(
        &self,
        update: &[u8],
        origin: Origin,
    ) -> Result<AwarenessChange, AwarenessError> {
        let mut awareness = self.awareness.lock().await;
        let change = awareness.apply_update(update)?;
        if !change.is_empty() {
            let frame = awareness.encode_update(&change.changed_clients());
            self.group.broadcast_message(origin, &Message::Awareness(frame));
        }
        Ok(change)
    }

    /// Drop entries and tell every remaining connection.
    pub async fn remove_awareness(&self, clients: &[ClientId], origin: Origin) -> Vec<ClientId> {
        let mut awareness = self.awareness.lock().await;
        let removed = awareness.remove_states(clients);
        if !removed.is_empty() {
            let frame = awareness.encode_update(&removed);
            self.group.broadcast_message(origin, &Message::Awareness(frame));
        }
        removed
    }

    /// Expire entries not renewed within `timeout`.
    pub async fn sweep_awareness(&self, now: Instant, timeout: Duration) -> Vec<ClientId> {
        let mut awareness = self.awareness.lock().await;
        let removed = awareness.remove_outdated(now, timeout);
        if !removed.is_empty() {
            log::debug!("Expired {} awareness entries in doc {}", removed.len(), self.id);
            let frame = awareness.encode_update(&removed);
            self.group.broadcast_message(Origin::Local, &Message::Awareness(frame));
        }
        removed
    }

    /// Every live presence entry, or `None` when there are none.
    pub async fn awareness_states(&self) -> Option<Vec<u8>> {
        let awareness = self.awareness.lock().await;
        (!awareness.is_empty()).then(|| awareness.encode_all())
    }

    pub async fn awareness_len(&self) -> usize {
        self.awareness.lock().await.len()
    }
}

impl std::fmt::Debug for SharedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDocument")
            .field("id", &self.id)
            .field("gc", &self.gc)
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}
