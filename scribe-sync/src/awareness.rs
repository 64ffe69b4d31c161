//! Ephemeral presence ("awareness") for cursors, selections and user metadata.
//!
//! Awareness is not part of the document: it is never persisted and is not
//! causally ordered with content. Each client owns one JSON state guarded by
//! a per-client clock; a newer clock replaces the state, a `null` state at the
//! current clock removes it.
//!
//! ## Wire format
//!
//! ```text
//! VarUint(count) { VarUint(client_id) VarUint(clock) VarString(json | "null") }*
//! ```
//!
//! Entries that are not renewed within the outdated timeout are expired by
//! [`AwarenessTracker::remove_outdated`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;

use crate::codec::{CodecError, Decoder, Encoder};

/// Awareness client id (a yjs client id).
pub type ClientId = u64;

/// Default time after which a silent remote client is dropped.
pub const OUTDATED_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum AwarenessError {
    #[error("awareness decode failed: {0}")]
    Codec(#[from] CodecError),
    #[error("invalid awareness state json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy)]
struct ClientMeta {
    clock: u64,
    last_updated: Instant,
}

/// Client ids touched by one awareness operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    /// Accepted updates, including renewals with an identical state.
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// All touched client ids, in added/updated/removed order.
    pub fn changed_clients(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

/// Per-document presence map.
#[derive(Debug)]
pub struct AwarenessTracker {
    client_id: ClientId,
    states: HashMap<ClientId, Value>,
    meta: HashMap<ClientId, ClientMeta>,
}

impl AwarenessTracker {
    /// Create a tracker whose own (local) client id is `client_id`.
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            states: HashMap::new(),
            meta: HashMap::new(),
        }
    }

    /// Create a tracker with a random 32-bit client id.
    pub fn with_random_id() -> Self {
        Self::new(random_client_id())
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Presence state for a client.
    pub fn get(&self, client_id: ClientId) -> Option<&Value> {
        self.states.get(&client_id)
    }

    pub fn states(&self) -> &HashMap<ClientId, Value> {
        &self.states
    }

    /// Number of clients with a live state.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn clock(&self, client_id: ClientId) -> Option<u64> {
        self.meta.get(&client_id).map(|m| m.clock)
    }

    pub fn local_state(&self) -> Option<&Value> {
        self.states.get(&self.client_id)
    }

    /// Set (or clear with `None`) the local client's state.
    pub fn set_local_state(&mut self, state: Option<Value>) -> AwarenessChange {
        let id = self.client_id;
        // Peers ignore clock 0 for unknown clients, so local clocks start at 1.
        let clock = self.meta.get(&id).map_or(1, |m| m.clock.saturating_add(1));
        let prev = match state {
            Some(state) => self.states.insert(id, state),
            None => self.states.remove(&id),
        };
        self.meta.insert(
            id,
            ClientMeta {
                clock,
                last_updated: Instant::now(),
            },
        );

        let mut change = AwarenessChange::default();
        match (prev.is_some(), self.states.contains_key(&id)) {
            (_, false) => change.removed.push(id),
            (false, true) => change.added.push(id),
            (true, true) => change.updated.push(id),
        }
        change
    }

    // ─── Remote updates ───────────────────────────────────────────────

    /// Apply an encoded awareness update received from the network.
    pub fn apply_update(&mut self, bytes: &[u8]) -> Result<AwarenessChange, AwarenessError> {
        self.apply_update_at(bytes, Instant::now())
    }

    /// Apply an update as if received at `now`.
    ///
    /// The whole payload is decoded before any entry is applied.
    pub fn apply_update_at(
        &mut self,
        bytes: &[u8],
        now: Instant,
    ) -> Result<AwarenessChange, AwarenessError> {
        let entries = decode_entries(bytes)?;
        let mut change = AwarenessChange::default();

        for (client_id, mut clock, state) in entries {
            let prev_meta = self.meta.get(&client_id).copied();
            let current_clock = prev_meta.map_or(0, |m| m.clock);
            let present = self.states.contains_key(&client_id);

            let newer = current_clock < clock;
            let removal_at_same_clock = current_clock == clock && state.is_none() && present;
            if !newer && !removal_at_same_clock {
                continue;
            }

            match state {
                None => {
                    if client_id == self.client_id && self.local_state().is_some() {
                        // A peer tried to remove us: bump past their clock.
                        clock = clock.saturating_add(1);
                    } else {
                        self.states.remove(&client_id);
                    }
                }
                Some(ref value) => {
                    self.states.insert(client_id, value.clone());
                }
            }
            self.meta.insert(
                client_id,
                ClientMeta {
                    clock,
                    last_updated: now,
                },
            );

            match (prev_meta.is_some(), state.is_some()) {
                (false, true) => change.added.push(client_id),
                (true, false) => change.removed.push(client_id),
                (_, true) => change.updated.push(client_id),
                (false, false) => {}
            }
        }

        Ok(change)
    }

    // ─── Encoding ─────────────────────────────────────────────────────

    /// Encode the given clients' current states (`null` for removed ones).
    pub fn encode_update(&self, clients: &[ClientId]) -> Vec<u8> {
        let known: Vec<(ClientId, u64)> = clients
            .iter()
            .filter_map(|id| self.meta.get(id).map(|m| (*id, m.clock)))
            .collect();

        let mut enc = Encoder::with_capacity(16 + known.len() * 32);
        enc.write_var_uint(known.len() as u64);
        for (client_id, clock) in known {
            enc.write_var_uint(client_id);
            enc.write_var_uint(clock);
            let json = self
                .states
                .get(&client_id)
                .map_or_else(|| "null".to_string(), Value::to_string);
            enc.write_var_string(&json);
        }
        enc.to_vec()
    }

    /// Encode every live state.
    pub fn encode_all(&self) -> Vec<u8> {
        let clients: Vec<ClientId> = self.states.keys().copied().collect();
        self.encode_update(&clients)
    }

    // ─── Removal ──────────────────────────────────────────────────────

    /// Remove states, keeping their clocks so the removal can be encoded.
    pub fn remove_states(&mut self, clients: &[ClientId]) -> Vec<ClientId> {
        let mut removed = Vec::new();
        for &client_id in clients {
            if self.states.remove(&client_id).is_some() {
                if client_id == self.client_id {
                    if let Some(meta) = self.meta.get_mut(&client_id) {
                        meta.clock = meta.clock.saturating_add(1);
                        meta.last_updated = Instant::now();
                    }
                }
                removed.push(client_id);
            }
        }
        removed
    }

    /// Drop remote clients not renewed within `timeout`.
    pub fn remove_outdated(&mut self, now: Instant, timeout: Duration) -> Vec<ClientId> {
        let stale: Vec<ClientId> = self
            .meta
            .iter()
            .filter(|(id, meta)| {
                **id != self.client_id
                    && self.states.contains_key(id)
                    && now.saturating_duration_since(meta.last_updated) >= timeout
            })
            .map(|(id, _)| *id)
            .collect();
        self.remove_states(&stale)
    }
}

type Entry = (ClientId, u64, Option<Value>);

fn decode_entries(bytes: &[u8]) -> Result<Vec<Entry>, AwarenessError> {
    let mut dec = Decoder::new(bytes);
    let count = dec.read_var_uint()?;
    let mut entries = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let client_id = dec.read_var_uint()?;
        let clock = dec.read_var_uint()?;
        let json = dec.read_var_string()?;
        let state = match serde_json::from_str::<Value>(json)? {
            Value::Null => None,
            value => Some(value),
        };
        entries.push((client_id, clock, state));
    }
    Ok(entries)
}

/// Random 32-bit id, the range yjs clients use.
pub fn random_client_id() -> ClientId {
    (uuid::Uuid::new_v4().as_u128() as u32) as ClientId
}
