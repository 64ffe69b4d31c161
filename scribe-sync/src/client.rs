//! WebSocket sync client.
//!
//! Speaks the same y-sync protocol as browser peers:
//! - on open, sends `SyncStep1` with its state vector
//! - answers the server's `SyncStep1` with everything the server lacks
//! - applies `SyncStep2` / `Update` from the server
//! - forwards local edits as `Update` messages
//! - keeps a local view of everyone's awareness
//!
//! Edits made before connecting (see [`SyncClient::connect_with_state`])
//! reach the server through the handshake, so no offline queue is needed.

use std::collections::HashMap;
use std::time::Duration;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

use crate::awareness::{AwarenessChange, AwarenessTracker, ClientId, OUTDATED_TIMEOUT};
use crate::doc::{ConnectionId, CrdtDocument, CrdtError, CrdtOptions, Delta, Origin};
use crate::protocol::{Message, SyncMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress.
    Syncing,
    /// Server's state applied.
    Synced,
    Disconnected,
}

/// Events for the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The server's step 2 was applied.
    Synced,
    /// A remote update was applied.
    RemoteUpdate(Vec<u8>),
    /// Remote presence changed.
    Awareness(AwarenessChange),
    /// A message from the server could not be handled.
    Error(String),
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("invalid document state: {0}")]
    Crdt(#[from] CrdtError),
    #[error("connection closed")]
    Closed,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

/// Shared between the client handle and its reader task.
struct Replica {
    doc: Mutex<CrdtDocument>,
    awareness: Mutex<AwarenessTracker>,
    outgoing: mpsc::UnboundedSender<WsMessage>,
    events: mpsc::UnboundedSender<SyncEvent>,
    state: watch::Sender<ConnectionState>,
    /// Origin used for updates coming from the server.
    remote: Origin,
}

impl Replica {
    fn send(&self, message: &Message) {
        // A closed writer means we are disconnected; the reader reports that.
        let _ = self.outgoing.send(WsMessage::Binary(message.encode().into()));
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    /// Re-announce the local state so peers do not expire it.
    async fn renew_awareness(&self) {
        let mut awareness = self.awareness.lock().await;
        if let Some(state) = awareness.local_state().cloned() {
            awareness.set_local_state(Some(state));
            self.send(&Message::Awareness(
                awareness.encode_update(&[awareness.client_id()]),
            ));
        }
    }

    async fn handle_frame(&self, frame: &[u8]) {
        let messages = match Message::decode_all(frame) {
            Ok(messages) => messages,
            Err(e) => {
                log::warn!("Client dropping malformed frame: {e}");
                self.emit(SyncEvent::Error(e.to_string()));
                return;
            }
        };
        for message in messages {
            self.handle_message(message).await;
        }
    }

    async fn handle_message(&self, message: Message) {
        match message {
            Message::Sync(SyncMessage::SyncStep1(state_vector)) => {
                let diff = self.doc.lock().await.encode_state_as_update(Some(&state_vector));
                match diff {
                    Ok(diff) => self.send(&Message::sync_step2(diff)),
                    Err(e) => self.emit(SyncEvent::Error(e.to_string())),
                }
            }
            Message::Sync(SyncMessage::SyncStep2(update)) => {
                match self.doc.lock().await.apply_update(&update, self.remote) {
                    Ok(()) => {
                        self.state.send_replace(ConnectionState::Synced);
                        self.emit(SyncEvent::Synced);
                    }
                    Err(e) => self.emit(SyncEvent::Error(e.to_string())),
                }
            }
            Message::Sync(SyncMessage::Update(update)) => {
                let applied = self.doc.lock().await.apply_update(&update, self.remote);
                match applied {
                    Ok(()) => self.emit(SyncEvent::RemoteUpdate(update)),
                    Err(e) => self.emit(SyncEvent::Error(e.to_string())),
                }
            }
            Message::Awareness(update) => {
                let change = self.awareness.lock().await.apply_update(&update);
                match change {
                    Ok(change) if !change.is_empty() => self.emit(SyncEvent::Awareness(change)),
                    Ok(_) => {}
                    Err(e) => self.emit(SyncEvent::Error(e.to_string())),
                }
            }
            Message::QueryAwareness => {
                let awareness = self.awareness.lock().await;
                if awareness.local_state().is_some() {
                    self.send(&Message::Awareness(
                        awareness.encode_update(&[awareness.client_id()]),
                    ));
                }
            }
        }
    }
}

/// A connected replica of one document.
pub struct SyncClient {
    replica: Arc<Replica>,
    state: watch::Receiver<ConnectionState>,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    renewer: JoinHandle<()>,
}

impl SyncClient {
    /// Connect to `url` (`ws://host:port/<doc-id>?token=…`) with an empty replica.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        Self::connect_with_options(url, None, &CrdtOptions::default()).await
    }

    /// Connect with pre-existing state, e.g. edits made offline.
    pub async fn connect_with_state(url: &str, state: &[u8]) -> Result<Self, ClientError> {
        Self::connect_with_options(url, Some(state), &CrdtOptions::default()).await
    }

    pub async fn connect_with_options(
        url: &str,
        initial_state: Option<&[u8]>,
        options: &CrdtOptions,
    ) -> Result<Self, ClientError> {
        let mut doc = CrdtDocument::with_options(options);
        let remote = Origin::Connection(ConnectionId::new());
        if let Some(state) = initial_state {
            doc.apply_update(state, remote)?;
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
        let local_tx = out_tx.clone();
        doc.on_update(move |event| {
            if event.origin == Origin::Local {
                let frame = Message::update(event.update.clone()).encode();
                let _ = local_tx.send(WsMessage::Binary(frame.into()));
            }
        });

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Syncing);
        let replica = Arc::new(Replica {
            doc: Mutex::new(doc),
            awareness: Mutex::new(AwarenessTracker::with_random_id()),
            outgoing: out_tx,
            events: event_tx,
            state: state_tx,
            remote,
        });

        let step1 = Message::sync_step1(replica.doc.lock().await.encode_state_vector());
        replica.send(&step1);

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let reader_replica = Arc::clone(&replica);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(WsMessage::Binary(data)) => reader_replica.handle_frame(&data).await,
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("Client connection error: {e}");
                        break;
                    }
                }
            }
            reader_replica.state.send_replace(ConnectionState::Disconnected);
            reader_replica.emit(SyncEvent::Disconnected);
        });

        let renew_replica = Arc::clone(&replica);
        let renewer = tokio::spawn(async move {
            let period = OUTDATED_TIMEOUT / 2;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                renew_replica.renew_awareness().await;
            }
        });

        Ok(Self {
            replica,
            state: state_rx,
            events: event_rx,
            reader,
            writer,
            renewer,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the server's state has been applied.
    pub async fn wait_synced(&mut self, timeout: Duration) -> Result<(), ClientError> {
        let wait = self.state.wait_for(|s| *s != ConnectionState::Syncing);
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(state)) if *state == ConnectionState::Synced => Ok(()),
            Ok(_) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout("initial sync")),
        }
    }

    /// Next event, or `None` once the client is gone.
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        self.events.recv().await
    }

    // ─── Content ──────────────────────────────────────────────────────

    pub async fn text(&self) -> String {
        self.replica.doc.lock().await.text()
    }

    pub async fn delta(&self) -> Delta {
        self.replica.doc.lock().await.to_delta()
    }

    /// Full local state as an update (to reconnect later with).
    pub async fn encode_state(&self) -> Vec<u8> {
        self.replica.doc.lock().await.snapshot()
    }

    pub async fn insert(&self, index: u32, chunk: &str) {
        self.replica.doc.lock().await.insert(index, chunk, Origin::Local);
    }

    pub async fn remove_range(&self, index: u32, len: u32) {
        self.replica.doc.lock().await.remove_range(index, len, Origin::Local);
    }

    /// Send raw bytes as one binary frame.
    pub fn send_raw(&self, frame: Vec<u8>) -> Result<(), ClientError> {
        self.replica
            .outgoing
            .send(WsMessage::Binary(frame.into()))
            .map_err(|_| ClientError::Closed)
    }

    // ─── Awareness ────────────────────────────────────────────────────

    pub async fn client_id(&self) -> ClientId {
        self.replica.awareness.lock().await.client_id()
    }

    /// Publish this client's presence.
    pub async fn set_awareness(&self, state: Value) {
        self.publish_awareness(Some(state)).await;
    }

    /// Retract this client's presence.
    pub async fn clear_awareness(&self) {
        self.publish_awareness(None).await;
    }

    async fn publish_awareness(&self, state: Option<Value>) {
        let mut awareness = self.replica.awareness.lock().await;
        awareness.set_local_state(state);
        let update = awareness.encode_update(&[awareness.client_id()]);
        self.replica.send(&Message::Awareness(update));
    }

    /// Presence of every known client, ours included.
    pub async fn awareness_states(&self) -> HashMap<ClientId, Value> {
        self.replica.awareness.lock().await.states().clone()
    }

    // ─── Shutdown ─────────────────────────────────────────────────────

    /// Close the connection with a close frame.
    pub async fn close(&mut self) {
        self.renewer.abort();
        let _ = self.replica.outgoing.send(WsMessage::Close(None));
        let _ = tokio::time::timeout(Duration::from_secs(1), &mut self.writer).await;
        let _ = tokio::time::timeout(Duration::from_secs(1), &mut self.reader).await;
        self.reader.abort();
    }

    /// Drop the transport without a close handshake.
    pub fn abort(&self) {
        self.renewer.abort();
        self.writer.abort();
        self.reader.abort();
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.abort();
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
