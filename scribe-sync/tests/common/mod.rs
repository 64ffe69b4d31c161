//! Shared helpers: spin up a real server on a free port and poll for
//! eventually-consistent state.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use scribe_sync::awareness::ClientId;
use scribe_sync::config::Config;
use scribe_sync::{
    AuthPolicy, DocumentId, DocumentRegistry, DocumentOptions, MemoryStore, PersistenceAdapter,
    SyncClient, SyncServer,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

pub const WAIT: Duration = Duration::from_secs(5);

/// Serve `server` on 127.0.0.1 with an OS-assigned port.
pub async fn spawn(server: SyncServer) -> (JoinHandle<()>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let _ = server.run_on(listener).await;
    });
    (handle, format!("ws://{addr}"))
}

/// Server backed by an inspectable in-memory store.
pub async fn memory_server(config: &Config) -> (SyncServer, Arc<MemoryStore>, String) {
    let store = Arc::new(MemoryStore::new());
    let persistence = PersistenceAdapter::new(store.clone(), config.documents.persistence_timeout());
    let registry = Arc::new(DocumentRegistry::new(persistence, DocumentOptions::default()));
    let server = SyncServer::new(config, registry, AuthPolicy::open());
    let (_, url) = spawn(server.clone()).await;
    (server, store, url)
}

pub async fn connect(url: &str, doc: &str) -> SyncClient {
    let mut client = SyncClient::connect(&format!("{url}/{doc}")).await.unwrap();
    client.wait_synced(WAIT).await.unwrap();
    client
}

pub async fn wait_for_text(client: &SyncClient, expected: &str) {
    let reached = timeout(WAIT, async {
        while client.text().await != expected {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "expected {expected:?}, have {:?}",
        client.text().await
    );
}

/// Wait until `client` does (or does not) see presence for `peer`.
pub async fn wait_for_presence(client: &SyncClient, peer: ClientId, present: bool) {
    let reached = timeout(WAIT, async {
        while client.awareness_states().await.contains_key(&peer) != present {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "presence of {peer} never became {present}");
}

/// Wait until the document has been flushed and dropped from the registry.
pub async fn wait_for_eviction(server: &SyncServer, doc: &str) {
    let id = DocumentId::new(doc);
    let reached = timeout(WAIT, async {
        while server.registry().get(&id).await.is_some() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "doc {doc} was never evicted");
}
