//! Per-document fan-out to every connection except the origin.
//!
//! Uses a tokio broadcast channel: one send reaches all subscribers, each
//! receiver buffers up to `capacity` frames. A receiver that falls further
//! behind observes `RecvError::Lagged` and must be resynced by its owner.
//!
//! Frames are pre-encoded once and shared as `Arc<Vec<u8>>`; every frame
//! carries its [`Origin`] so receivers can drop their own echoes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::auth::UserIdentity;
use crate::doc::{ConnectionId, Origin};
use crate::protocol::Message;

/// A pre-encoded frame plus the origin that produced it.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub origin: Origin,
    pub frame: Arc<Vec<u8>>,
}

impl Outbound {
    /// Whether `recipient` should receive this frame.
    pub fn is_for(&self, recipient: ConnectionId) -> bool {
        self.origin.should_deliver_to(recipient)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub active_connections: usize,
}

/// Lock-free counters for the send path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

/// Fan-out group and connection set for one shared document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Outbound>,
    connections: RwLock<HashMap<ConnectionId, UserIdentity>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` bounds how many frames a slow receiver may fall behind.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            connections: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a connection and hand back its receiver.
    pub async fn add_connection(
        &self,
        id: ConnectionId,
        user: UserIdentity,
    ) -> broadcast::Receiver<Outbound> {
        let mut connections = self.connections.write().await;
        connections.insert(id, user);
        self.sender.subscribe()
    }

    /// Remove a connection; returns how many remain.
    pub async fn remove_connection(&self, id: &ConnectionId) -> usize {
        let mut connections = self.connections.write().await;
        connections.remove(id);
        connections.len()
    }

    /// Send a frame. Never blocks; returns the number of receivers.
    pub fn broadcast(&self, origin: Origin, frame: Vec<u8>) -> usize {
        self.broadcast_raw(Outbound {
            origin,
            frame: Arc::new(frame),
        })
    }

    /// Encode and send a protocol message.
    pub fn broadcast_message(&self, origin: Origin, msg: &Message) -> usize {
        self.broadcast(origin, msg.encode())
    }

    pub fn broadcast_raw(&self, outbound: Outbound) -> usize {
        let count = self.sender.send(outbound).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.stats.messages_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn has_connection(&self, id: &ConnectionId) -> bool {
        self.connections.read().await.contains_key(id)
    }

    /// Connected users, one entry per connection.
    pub async fn connections(&self) -> Vec<(ConnectionId, UserIdentity)> {
        self.connections
            .read()
            .await
            .iter()
            .map(|(id, user)| (*id, user.clone()))
            .collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.stats.messages_lagged.load(Ordering::Relaxed),
            active_connections: self.connections.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for BroadcastGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastGroup")
            .field("capacity", &self.capacity)
            .field("receivers", &self.sender.receiver_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    #[tokio::test]
    async fn test_add_remove_connection() {
        let group = BroadcastGroup::new(16);
        let id = ConnectionId::new();

        let _rx = group.add_connection(id, UserIdentity::Anonymous).await;
        assert_eq!(group.connection_count().await, 1);
        assert!(group.has_connection(&id).await);

        assert_eq!(group.remove_connection(&id).await, 0);
        assert!(!group.has_connection(&id).await);
    }

    #[tokio::test]
    async fn test_fan_out_with_origin_filter() {
        let group = BroadcastGroup::new(16);
        let alice = ConnectionId::new();
        let bob = ConnectionId::new();
        let mut rx_alice = group.add_connection(alice, UserIdentity::Anonymous).await;
        let mut rx_bob = group
            .add_connection(bob, UserIdentity::Authenticated("bob".into()))
            .await;

        let count = group.broadcast(Origin::Connection(alice), vec![1, 2, 3]);
        assert_eq!(count, 2);

        let at_alice = rx_alice.recv().await.unwrap();
        let at_bob = rx_bob.recv().await.unwrap();
        assert!(!at_alice.is_for(alice));
        assert!(at_bob.is_for(bob));
        assert_eq!(*at_bob.frame, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_local_origin_reaches_everyone() {
        let group = BroadcastGroup::new(4);
        let id = ConnectionId::new();
        let mut rx = group.add_connection(id, UserIdentity::Anonymous).await;
        group.broadcast_message(Origin::Local, &Message::update(vec![9]));
        let out = rx.recv().await.unwrap();
        assert!(out.is_for(id));
        assert_eq!(Message::decode(&out.frame).unwrap(), Message::update(vec![9]));
    }

    #[tokio::test]
    async fn test_slow_receiver_lags() {
        let group = BroadcastGroup::new(2);
        let mut rx = group
            .add_connection(ConnectionId::new(), UserIdentity::Anonymous)
            .await;
        for i in 0..5u8 {
            group.broadcast(Origin::Local, vec![i]);
        }
        match rx.recv().await {
            Err(RecvError::Lagged(n)) => {
                group.record_lag(n);
                assert_eq!(n, 3);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 5);
        assert_eq!(stats.messages_lagged, 3);
        assert_eq!(stats.active_connections, 1);
        assert_eq!(*rx.recv().await.unwrap().frame, vec![3]);
        assert_eq!(*rx.recv().await.unwrap().frame, vec![4]);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_broadcast_without_receivers() {
        let group = BroadcastGroup::new(8);
        assert_eq!(group.broadcast(Origin::Local, vec![1]), 0);
        assert_eq!(group.capacity(), 8);
    }

    #[tokio::test]
    async fn test_connections_list() {
        let group = BroadcastGroup::new(8);
        let _a = group
            .add_connection(ConnectionId::new(), UserIdentity::Authenticated("alice".into()))
            .await;
        let _b = group
            .add_connection(ConnectionId::new(), UserIdentity::Anonymous)
            .await;
        let users: Vec<String> = group
            .connections()
            .await
            .into_iter()
            .map(|(_, u)| u.to_string())
            .collect();
        assert_eq!(users.len(), 2);
        assert!(users.contains(&"alice".to_string()));
        assert!(users.contains(&"anonymous".to_string()));
    }
}
