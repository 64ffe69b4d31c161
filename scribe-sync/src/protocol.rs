//! y-sync wire protocol.
//!
//! Every binary frame carries one or more messages:
//! ```text
//! ┌──────────────────┬─────────────────────────────────────────────┐
//! │ VarUint msg_type │ body                                        │
//! ├──────────────────┼─────────────────────────────────────────────┤
//! │ 0  SYNC          │ VarUint sync_type, VarUint8Array payload    │
//! │ 1  AWARENESS     │ VarUint8Array awareness update              │
//! │ 3  QUERY_AWARE.  │ (empty)                                     │
//! └──────────────────┴─────────────────────────────────────────────┘
//! ```
//!
//! Sync sub-types: `0` step 1 (state vector), `1` step 2 (state diff),
//! `2` incremental update. Step 2 and update payloads are applied the same way.

use thiserror::Error;

use crate::codec::{CodecError, Decoder, Encoder};

/// Top-level message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Sync = 0,
    Awareness = 1,
    /// Reserved by y-protocols for auth; never accepted here.
    Auth = 2,
    QueryAwareness = 3,
}

/// Sync sub-message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncType {
    Step1 = 0,
    Step2 = 1,
    Update = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Sender's encoded state vector.
    SyncStep1(Vec<u8>),
    /// Update containing everything the receiver is missing.
    SyncStep2(Vec<u8>),
    /// Incremental update.
    Update(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    Awareness(Vec<u8>),
    QueryAwareness,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Codec(#[from] CodecError),
    #[error("unknown message type {0}")]
    UnknownMessageType(u64),
    #[error("unknown sync message type {0}")]
    UnknownSyncType(u64),
    #[error("empty frame")]
    EmptyFrame,
}

/// Per-connection handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Transport open, nothing exchanged yet.
    Connected,
    /// Our step 1 is out; waiting for the peer's step 2.
    Syncing,
    /// Peer's step 2 applied.
    Synced,
}

impl SyncState {
    /// State after sending step 1.
    pub fn on_step1_sent(self) -> Self {
        match self {
            SyncState::Connected => SyncState::Syncing,
            other => other,
        }
    }

    /// State after receiving the peer's step 2.
    pub fn on_step2_received(self) -> Self {
        SyncState::Synced
    }

    pub fn is_synced(self) -> bool {
        self == SyncState::Synced
    }
}

impl Message {
    pub fn sync_step1(state_vector: Vec<u8>) -> Self {
        Message::Sync(SyncMessage::SyncStep1(state_vector))
    }

    pub fn sync_step2(update: Vec<u8>) -> Self {
        Message::Sync(SyncMessage::SyncStep2(update))
    }

    pub fn update(update: Vec<u8>) -> Self {
        Message::Sync(SyncMessage::Update(update))
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Sync(_) => MessageType::Sync,
            Message::Awareness(_) => MessageType::Awareness,
            Message::QueryAwareness => MessageType::QueryAwareness,
        }
    }

    /// Append this message to an encoder.
    pub fn encode_into(&self, enc: &mut Encoder) {
        enc.write_var_uint(self.message_type() as u64);
        match self {
            Message::Sync(sync) => {
                let (kind, payload) = match sync {
                    SyncMessage::SyncStep1(sv) => (SyncType::Step1, sv),
                    SyncMessage::SyncStep2(u) => (SyncType::Step2, u),
                    SyncMessage::Update(u) => (SyncType::Update, u),
                };
                enc.write_var_uint(kind as u64);
                enc.write_var_u8_array(payload);
            }
            Message::Awareness(update) => enc.write_var_u8_array(update),
            Message::QueryAwareness => {}
        }
    }

    /// Encode as a standalone frame.
    pub fn encode(&self) -> Vec<u8> {
        let payload_len = match self {
            Message::Sync(SyncMessage::SyncStep1(p))
            | Message::Sync(SyncMessage::SyncStep2(p))
            | Message::Sync(SyncMessage::Update(p))
            | Message::Awareness(p) => p.len(),
            Message::QueryAwareness => 0,
        };
        let mut enc = Encoder::with_capacity(payload_len + 8);
        self.encode_into(&mut enc);
        enc.to_vec()
    }

    /// Read one message from the decoder.
    pub fn decode_from(dec: &mut Decoder<'_>) -> Result<Self, ProtocolError> {
        let msg_type = dec.read_var_uint()?;
        match msg_type {
            t if t == MessageType::Sync as u64 => {
                let sync_type = dec.read_var_uint()?;
                let payload = dec.read_var_u8_array()?.to_vec();
                let sync = match sync_type {
                    t if t == SyncType::Step1 as u64 => SyncMessage::SyncStep1(payload),
                    t if t == SyncType::Step2 as u64 => SyncMessage::SyncStep2(payload),
                    t if t == SyncType::Update as u64 => SyncMessage::Update(payload),
                    other => return Err(ProtocolError::UnknownSyncType(other)),
                };
                Ok(Message::Sync(sync))
            }
            t if t == MessageType::Awareness as u64 => {
                Ok(Message::Awareness(dec.read_var_u8_array()?.to_vec()))
            }
            t if t == MessageType::QueryAwareness as u64 => Ok(Message::QueryAwareness),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }

    /// Decode a frame holding exactly one message; trailing bytes are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }
        Self::decode_from(&mut Decoder::new(bytes))
    }

    /// Decode every message concatenated in a frame.
    pub fn decode_all(bytes: &[u8]) -> Result<Vec<Self>, ProtocolError> {
        if bytes.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }
        let mut dec = Decoder::new(bytes);
        let mut messages = Vec::new();
        while dec.has_content() {
            messages.push(Self::decode_from(&mut dec)?);
        }
        Ok(messages)
    }
}
