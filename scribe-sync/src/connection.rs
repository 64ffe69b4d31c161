//! Per-connection lifecycle: handshake, dispatch, heartbeat, teardown.
//!
//! ```text
//!  open ──► join registry ──► SyncStep1(sv) [+ awareness] ──► loop {
//!              inbound frame   → decode → apply → reply to sender only
//!              broadcast frame → skip own origin → forward
//!              heartbeat tick  → ping, or close if the last pong never came
//!          } ──► clear controlled awareness ──► leave registry
//! ```
//!
//! A bad frame is logged and dropped; only transport failures and heartbeat
//! timeouts end the connection.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

use crate::auth::UserIdentity;
use crate::awareness::{AwarenessError, ClientId};
use crate::broadcast::Outbound;
use crate::doc::{ConnectionId, CrdtError, DocumentId, Origin};
use crate::protocol::{Message, ProtocolError, SyncMessage, SyncState};
use crate::registry::DocumentRegistry;
use crate::server::ServerStats;
use crate::shared::SharedDocument;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] ProtocolError),
    #[error("malformed awareness update: {0}")]
    MalformedAwareness(#[from] AwarenessError),
    #[error("update rejected: {0}")]
    CrdtApply(#[from] CrdtError),
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("no pong within one heartbeat interval")]
    HeartbeatTimeout,
}

impl ConnectionError {
    /// Whether the connection must be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnectionError::Transport(_) | ConnectionError::HeartbeatTimeout
        )
    }
}

// ─── Heartbeat ────────────────────────────────────────────────────────

/// What to do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    SendPing,
    Close,
}

/// Liveness flag: set by a pong, checked and cleared by each tick.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pong_received: bool,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            pong_received: true,
        }
    }

    pub fn on_pong(&mut self) {
        self.pong_received = true;
    }

    pub fn pong_received(&self) -> bool {
        self.pong_received
    }

    pub fn tick(&mut self) -> HeartbeatAction {
        if !self.pong_received {
            return HeartbeatAction::Close;
        }
        self.pong_received = false;
        HeartbeatAction::SendPing
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Connection ───────────────────────────────────────────────────────

/// Protocol state of one transport session, independent of the socket.
pub struct Connection {
    id: ConnectionId,
    user: UserIdentity,
    doc: Arc<SharedDocument>,
    controlled: HashSet<ClientId>,
    heartbeat: Heartbeat,
    sync_state: SyncState,
}

impl Connection {
    pub fn new(id: ConnectionId, user: UserIdentity, doc: Arc<SharedDocument>) -> Self {
        Self {
            id,
            user,
            doc,
            controlled: HashSet::new(),
            heartbeat: Heartbeat::new(),
            sync_state: SyncState::Connected,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user(&self) -> &UserIdentity {
        &self.user
    }

    pub fn doc(&self) -> &Arc<SharedDocument> {
        &self.doc
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync_state
    }

    /// Awareness client ids this connection has announced.
    pub fn controlled_clients(&self) -> &HashSet<ClientId> {
        &self.controlled
    }

    pub fn heartbeat_mut(&mut self) -> &mut Heartbeat {
        &mut self.heartbeat
    }

    /// Frames sent right after the transport opens.
    pub async fn open_frames(&mut self) -> Vec<Vec<u8>> {
        let mut frames = vec![Message::sync_step1(self.doc.state_vector().await).encode()];
        if let Some(states) = self.doc.awareness_states().await {
            frames.push(Message::Awareness(states).encode());
        }
        self.set_sync_state(self.sync_state.on_step1_sent());
        frames
    }

    /// Decode and handle one inbound frame; returns replies for the sender.
    pub async fn handle_frame(&mut self, frame: &[u8]) -> Result<Vec<Vec<u8>>, ConnectionError> {
        let messages = Message::decode_all(frame)?;
        let mut replies = Vec::new();
        for message in messages {
            if let Some(reply) = self.handle_message(message).await? {
                replies.push(reply.encode());
            }
        }
        Ok(replies)
    }

    pub async fn handle_message(
        &mut self,
        message: Message,
    ) -> Result<Option<Message>, ConnectionError> {
        let origin = Origin::Connection(self.id);
        match message {
            Message::Sync(SyncMessage::SyncStep1(state_vector)) => {
                let diff = self.doc.encode_state_as_update(Some(&state_vector)).await?;
                Ok(Some(Message::sync_step2(diff)))
            }
            Message::Sync(SyncMessage::SyncStep2(update)) => {
                self.doc.apply_update(&update, origin).await?;
                self.set_sync_state(self.sync_state.on_step2_received());
                Ok(None)
            }
            Message::Sync(SyncMessage::Update(update)) => {
                self.doc.apply_update(&update, origin).await?;
                Ok(None)
            }
            Message::Awareness(update) => {
                let change = self.doc.apply_awareness(&update, origin).await?;
                self.controlled.extend(change.added.iter().chain(&change.updated));
                for id in &change.removed {
                    self.controlled.remove(id);
                }
                Ok(None)
            }
            Message::QueryAwareness => Ok(self.doc.awareness_states().await.map(Message::Awareness)),
        }
    }

    /// Full state for a connection that missed broadcasts.
    pub async fn resync_frames(&self) -> Result<Vec<Vec<u8>>, ConnectionError> {
        let mut frames = vec![Message::update(self.doc.encode_state_as_update(None).await?).encode()];
        if let Some(states) = self.doc.awareness_states().await {
            frames.push(Message::Awareness(states).encode());
        }
        Ok(frames)
    }

    /// Remove presence this connection controlled and leave the registry.
    pub async fn teardown(self, registry: &DocumentRegistry) {
        if !self.controlled.is_empty() {
            let clients: Vec<ClientId> = self.controlled.iter().copied().collect();
            self.doc
                .remove_awareness(&clients, Origin::Connection(self.id))
                .await;
        }
        registry.leave(&self.doc, &self.id).await;
    }

    fn set_sync_state(&mut self, next: SyncState) {
        if next != self.sync_state {
            log::debug!(
                "Connection {} on doc {}: {:?} -> {:?}",
                self.id,
                self.doc.id(),
                self.sync_state,
                next
            );
            self.sync_state = next;
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("doc", self.doc.id())
            .field("sync_state", &self.sync_state)
            .field("controlled", &self.controlled.len())
            .finish()
    }
}

// ─── Socket loop ──────────────────────────────────────────────────────

/// Shared handles every connection task needs.
#[derive(Clone, Debug)]
pub struct ConnectionContext {
    pub registry: Arc<DocumentRegistry>,
    pub stats: Arc<ServerStats>,
    pub heartbeat_interval: Duration,
}

/// Serve one WebSocket connection on `doc_id` until it closes.
pub async fn serve<Si, St>(
    mut sink: Si,
    mut stream: St,
    doc_id: DocumentId,
    user: UserIdentity,
    ctx: ConnectionContext,
) -> Result<(), ConnectionError>
where
    Si: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
    St: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    let id = ConnectionId::new();
    let (doc, rx) = ctx.registry.join(&doc_id, id, user.clone()).await;
    ctx.stats.connection_opened();
    log::info!("Connection {id} ({user}) joined doc {doc_id}");

    let mut conn = Connection::new(id, user, doc);
    let result = run(&mut conn, &mut sink, &mut stream, rx, &ctx).await;

    match &result {
        Ok(()) => log::info!("Connection {id} closed on doc {doc_id}"),
        Err(ConnectionError::HeartbeatTimeout) => {
            ctx.stats.heartbeat_timeout();
            log::info!("Connection {id} on doc {doc_id} missed its heartbeat, closing");
        }
        Err(e) => log::warn!("Connection {id} on doc {doc_id} failed: {e}"),
    }

    conn.teardown(&ctx.registry).await;
    ctx.stats.connection_closed();
    // Best effort; the peer may already be gone.
    let _ = sink.close().await;
    result
}

async fn run<Si, St>(
    conn: &mut Connection,
    sink: &mut Si,
    stream: &mut St,
    mut rx: broadcast::Receiver<Outbound>,
    ctx: &ConnectionContext,
) -> Result<(), ConnectionError>
where
    Si: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
    St: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    for frame in conn.open_frames().await {
        sink.send(WsMessage::Binary(frame.into())).await?;
    }

    let period = ctx.heartbeat_interval;
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(WsMessage::Binary(data))) => {
                    ctx.stats.message_received();
                    match conn.handle_frame(&data).await {
                        Ok(replies) => {
                            for reply in replies {
                                sink.send(WsMessage::Binary(reply.into())).await?;
                            }
                        }
                        Err(e) => {
                            ctx.stats.record_error(&e);
                            log::warn!("Dropping message from {} on doc {}: {e}", conn.id(), conn.doc().id());
                        }
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => conn.heartbeat_mut().on_pong(),
                Some(Ok(WsMessage::Text(_))) => {
                    ctx.stats.malformed_message();
                    log::warn!("Ignoring text frame from {}", conn.id());
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },

            outbound = rx.recv() => match outbound {
                Ok(out) => {
                    if out.is_for(conn.id()) {
                        sink.send(WsMessage::Binary(out.frame.to_vec().into())).await?;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    conn.doc().group().record_lag(skipped);
                    log::warn!("Connection {} lagged by {skipped} frames, resyncing", conn.id());
                    for frame in conn.resync_frames().await? {
                        sink.send(WsMessage::Binary(frame.into())).await?;
                    }
                }
                Err(RecvError::Closed) => return Ok(()),
            },

            _ = heartbeat.tick() => match conn.heartbeat_mut().tick() {
                HeartbeatAction::SendPing => sink.send(WsMessage::Ping(Vec::new().into())).await?,
                HeartbeatAction::Close => return Err(ConnectionError::HeartbeatTimeout),
            },
        }
    }
}
