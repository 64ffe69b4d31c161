//! # scribe-sync — collaborative rich-text sync server
//!
//! Hosts shared documents that many WebSocket clients edit at once.
//! Every document is a Yrs CRDT; clients speak the y-sync binary protocol
//! and exchange presence through the awareness sub-protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────┐
//! │ SyncClient  │ ◄────────────────► │ Connection       │
//! │ (per user)  │   y-sync frames    │ (per socket)     │
//! └─────────────┘                    └────────┬─────────┘
//!                                             │ join / leave
//!                                             ▼
//!                                    ┌──────────────────┐
//!                                    │ DocumentRegistry │
//!                                    └────────┬─────────┘
//!                                             │ one per document id
//!                                             ▼
//!   ┌─────────────┐  load / save     ┌──────────────────┐
//!   │ Persistence │ ◄──────────────► │ SharedDocument   │
//!   │ Adapter     │                  │ doc + awareness  │
//!   └─────────────┘                  └────────┬─────────┘
//!                                             │ origin-tagged frames
//!                                             ▼
//!                                    ┌──────────────────┐
//!                                    │ BroadcastGroup   │
//!                                    └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`codec`] — lib0 variable-length integers and byte arrays
//! - [`protocol`] — y-sync / awareness message framing
//! - [`doc`] — CRDT text document with origin-tagged updates
//! - `update_check` — structural check of untrusted v1 updates
//! - [`awareness`] — per-client presence with logical clocks
//! - [`storage`] — persistence adapter and stores (memory, RocksDB)
//! - [`shared`] — a live document and its connections
//! - [`registry`] — id → live document map
//! - [`connection`] — per-socket protocol loop and heartbeat
//! - [`server`] — listener, routing, and authentication
//! - [`client`] — WebSocket sync client

pub mod auth;
pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod doc;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod shared;
pub mod storage;
mod update_check;

pub use auth::{AuthError, AuthPolicy, Authenticator, TokenTable, UserIdentity};
pub use awareness::{AwarenessChange, AwarenessTracker, ClientId};
pub use broadcast::{BroadcastGroup, BroadcastStats, Outbound};
pub use client::{ClientError, ConnectionState, SyncClient, SyncEvent};
pub use config::Config;
pub use connection::{Connection, ConnectionError};
pub use doc::{ConnectionId, CrdtDocument, CrdtError, Delta, DeltaOp, DocumentId, Origin};
pub use protocol::{Message, MessageType, ProtocolError, SyncMessage};
pub use registry::{DocumentRegistry, RegistryError};
pub use server::{ServerError, ServerStats, StatsSnapshot, SyncServer};
pub use shared::{DocumentOptions, SharedDocument};
pub use storage::{
    DocumentStore, MemoryStore, PersistedRecord, PersistenceAdapter, RocksStore, StoreConfig,
    StoreError, WriteOutcome,
};
