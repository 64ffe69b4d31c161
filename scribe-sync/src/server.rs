//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/<doc-id>?token=…
//!            ├── handshake (route + auth) ── serve() ── DocumentRegistry
//! Client B ──┘                                              │
//!                                          ┌────────────────┼────────────────┐
//!                                          ▼                ▼                ▼
//!                                   SharedDocument    SharedDocument   PersistenceAdapter
//!                                   (CRDT+awareness)  (…)              (RocksDB / memory)
//! ```
//!
//! Besides the accept loop the server runs an awareness sweeper that expires
//! presence entries nobody renewed, and flushes every live document on ctrl-c.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::auth::{AuthError, AuthPolicy, UserIdentity};
use crate::config::{AwarenessConfig, Config, StorageBackend};
use crate::connection::{self, ConnectionContext, ConnectionError};
use crate::doc::DocumentId;
use crate::registry::DocumentRegistry;
use crate::shared::DocumentOptions;
use crate::storage::{
    DocumentStore, MemoryStore, PersistenceAdapter, RocksStore, StoreConfig, StoreError,
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage unavailable: {0}")]
    Store(#[from] StoreError),
}

// ─── Stats ────────────────────────────────────────────────────────────

/// Lock-free server counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    total_messages: AtomicU64,
    malformed_messages: AtomicU64,
    crdt_errors: AtomicU64,
    heartbeat_timeouts: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub malformed_messages: u64,
    pub crdt_errors: u64,
    pub heartbeat_timeouts: u64,
    pub active_documents: usize,
}

impl ServerStats {
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_message(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_timeout(&self) {
        self.heartbeat_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a non-fatal per-message error.
    pub fn record_error(&self, error: &ConnectionError) {
        match error {
            ConnectionError::MalformedMessage(_) | ConnectionError::MalformedAwareness(_) => {
                self.malformed_message()
            }
            ConnectionError::CrdtApply(_) => {
                self.crdt_errors.fetch_add(1, Ordering::Relaxed);
            }
            ConnectionError::HeartbeatTimeout => self.heartbeat_timeout(),
            ConnectionError::Transport(_) => {}
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            crdt_errors: self.crdt_errors.load(Ordering::Relaxed),
            heartbeat_timeouts: self.heartbeat_timeouts.load(Ordering::Relaxed),
            active_documents: 0,
        }
    }
}

// ─── Routing ──────────────────────────────────────────────────────────

/// Why a handshake was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    MissingDocumentId,
    Unauthorized(AuthError),
}

impl Rejection {
    fn into_response(self) -> ErrorResponse {
        let (status, body) = match self {
            Rejection::MissingDocumentId => (StatusCode::BAD_REQUEST, "missing document id".to_string()),
            Rejection::Unauthorized(e) => (StatusCode::UNAUTHORIZED, e.to_string()),
        };
        let mut response = ErrorResponse::new(Some(body));
        *response.status_mut() = status;
        response
    }
}

/// Resolve `/<document-id>?token=<bearer>` into a document and identity.
pub fn route(
    path: &str,
    query: Option<&str>,
    auth: &AuthPolicy,
) -> Result<(DocumentId, UserIdentity), Rejection> {
    let id = path.trim_start_matches('/');
    if id.is_empty() {
        return Err(Rejection::MissingDocumentId);
    }
    // Undecodable bytes become U+FFFD and so never match a real token.
    let token = query.and_then(|q| {
        q.split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "token")
            .map(|(_, value)| {
                String::from_utf8_lossy(&urlencoding::decode_binary(value.as_bytes())).into_owned()
            })
    });
    let user = auth
        .resolve(token.as_deref())
        .map_err(Rejection::Unauthorized)?;
    Ok((DocumentId::new(id), user))
}

// ─── Server ───────────────────────────────────────────────────────────

/// The sync server. Cheap to clone; clones share all state.
#[derive(Clone, Debug)]
pub struct SyncServer {
    bind_addr: String,
    registry: Arc<DocumentRegistry>,
    auth: AuthPolicy,
    stats: Arc<ServerStats>,
    heartbeat_interval: Duration,
    awareness: AwarenessConfig,
}

impl SyncServer {
    pub fn new(config: &Config, registry: Arc<DocumentRegistry>, auth: AuthPolicy) -> Self {
        Self {
            bind_addr: config.server.bind_addr.clone(),
            registry,
            auth,
            stats: Arc::new(ServerStats::default()),
            heartbeat_interval: config.server.heartbeat_interval(),
            awareness: config.awareness.clone(),
        }
    }

    /// Wire up storage, registry and auth from configuration.
    pub fn from_config(config: &Config) -> Result<Self, ServerError> {
        let store: Arc<dyn DocumentStore> = match config.storage.backend {
            StorageBackend::Memory => {
                log::warn!("Using in-memory storage; documents are lost on restart");
                Arc::new(MemoryStore::new())
            }
            StorageBackend::Rocksdb => Arc::new(RocksStore::open(StoreConfig::from(&config.storage))?),
        };
        let persistence = PersistenceAdapter::new(store, config.documents.persistence_timeout());
        let options = DocumentOptions {
            crdt: config.documents.crdt_options(),
            broadcast_capacity: config.server.broadcast_capacity,
        };
        let registry = Arc::new(DocumentRegistry::new(persistence, options));
        let auth = AuthPolicy::new(
            Arc::new(config.auth.token_table()),
            config.server.allow_anonymous,
        );
        Ok(Self::new(config, registry, auth))
    }

    /// Bind the configured address and serve until ctrl-c.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        tokio::select! {
            result = self.run_on(listener) => result,
            signal = tokio::signal::ctrl_c() => {
                signal?;
                log::info!("Shutdown requested");
                self.shutdown().await;
                Ok(())
            }
        }
    }

    /// Serve connections from an already bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        let sweeper = sweep_awareness(Arc::clone(&self.registry), self.awareness.clone());
        tokio::select! {
            result = self.accept_loop(listener) => result,
            () = sweeper => Ok(()),
        }
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let auth = self.auth.clone();
            let ctx = self.connection_context();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, auth, ctx).await {
                    log::debug!("Connection from {addr} ended: {e}");
                }
            });
        }
    }

    /// Flush every live document.
    pub async fn shutdown(&self) {
        for (id, outcome) in self.registry.flush_all().await {
            log::info!("Flushed doc {id} on shutdown: {outcome:?}");
        }
    }

    fn connection_context(&self) -> ConnectionContext {
        ConnectionContext {
            registry: Arc::clone(&self.registry),
            stats: Arc::clone(&self.stats),
            heartbeat_interval: self.heartbeat_interval,
        }
    }

    pub async fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_documents: self.registry.len().await,
            ..self.stats.snapshot()
        }
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    auth: AuthPolicy,
    ctx: ConnectionContext,
) -> Result<(), ConnectionError> {
    let mut target = None;
    let mut rejected = false;
    let callback = |req: &Request, response: Response| match route(req.uri().path(), req.uri().query(), &auth) {
        Ok(resolved) => {
            target = Some(resolved);
            Ok(response)
        }
        Err(rejection) => {
            log::info!("Rejecting {addr} ({}): {rejection:?}", req.uri());
            rejected = true;
            Err(rejection.into_response())
        }
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            if rejected {
                ctx.stats.connection_rejected();
            }
            return Err(e.into());
        }
    };
    let Some((doc_id, user)) = target else {
        return Ok(());
    };

    let (sink, stream) = ws_stream.split();
    connection::serve(sink, stream, doc_id, user, ctx).await
}

async fn sweep_awareness(registry: Arc<DocumentRegistry>, config: AwarenessConfig) {
    let mut ticker = tokio::time::interval(config.check_interval());
    loop {
        ticker.tick().await;
        let removed = registry
            .sweep_awareness(std::time::Instant::now(), config.timeout())
            .await;
        if removed > 0 {
            log::debug!("Awareness sweep removed {removed} entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenTable;

    fn policy(allow_anonymous: bool) -> AuthPolicy {
        let mut table = TokenTable::default();
        table.insert("good", "alice");
        AuthPolicy::new(Arc::new(table), allow_anonymous)
    }

    #[test]
    fn test_route_with_token() {
        let (id, user) = route("/notes", Some("token=good"), &policy(false)).unwrap();
        assert_eq!(id, DocumentId::new("notes"));
        assert_eq!(user, UserIdentity::Authenticated("alice".into()));
    }

    #[test]
    fn test_route_token_among_other_params() {
        let (_, user) = route("/d", Some("v=2&token=good&x"), &policy(false)).unwrap();
        assert_eq!(user, UserIdentity::Authenticated("alice".into()));
    }

    #[test]
    fn test_route_percent_decodes_token() {
        let mut table = TokenTable::default();
        table.insert("a+b/c=", "bob");
        let auth = AuthPolicy::new(Arc::new(table), false);

        let (_, user) = route("/d", Some("token=a%2Bb%2Fc%3D"), &auth).unwrap();
        assert_eq!(user, UserIdentity::Authenticated("bob".into()));
        assert_eq!(
            route("/d", Some("token=a%2Bb%2Fc"), &auth),
            Err(Rejection::Unauthorized(AuthError::InvalidToken))
        );
        assert_eq!(
            route("/d", Some("token=%FF"), &auth),
            Err(Rejection::Unauthorized(AuthError::InvalidToken))
        );
    }

    #[test]
    fn test_route_anonymous_policy() {
        let (_, user) = route("/d", None, &policy(true)).unwrap();
        assert!(user.is_anonymous());
        let (_, user) = route("/d", Some("token=bad"), &policy(true)).unwrap();
        assert!(user.is_anonymous());

        assert_eq!(
            route("/d", Some("token=bad"), &policy(false)),
            Err(Rejection::Unauthorized(AuthError::InvalidToken))
        );
    }

    #[test]
    fn test_route_requires_document_id() {
        assert_eq!(
            route("/", None, &policy(true)),
            Err(Rejection::MissingDocumentId)
        );
    }

    #[test]
    fn test_rejection_status_codes() {
        assert_eq!(
            Rejection::MissingDocumentId.into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Rejection::Unauthorized(AuthError::MissingToken)
                .into_response()
                .status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_stats_counters() {
        let stats = ServerStats::default();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        stats.record_error(&ConnectionError::CrdtApply(crate::doc::CrdtError::Apply("x".into())));
        stats.record_error(&ConnectionError::HeartbeatTimeout);
        let snap = stats.snapshot();
        assert_eq!(snap.total_connections, 2);
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.crdt_errors, 1);
        assert_eq!(snap.heartbeat_timeouts, 1);
    }

    #[tokio::test]
    async fn test_server_from_default_config() {
        let server = SyncServer::from_config(&Config::default()).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:1234");
        assert_eq!(server.stats().await, StatsSnapshot::default());
    }

    #[tokio::test]
    async fn test_server_with_rocksdb_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Rocksdb;
        config.storage.path = dir.path().join("db");
        let server = SyncServer::from_config(&config).unwrap();
        assert!(server.registry().is_empty().await);
        assert!(dir.path().join("db").exists());
    }
}
