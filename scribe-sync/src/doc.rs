//! Replicated rich-text document backed by Yrs.
//!
//! A `CrdtDocument` owns one Yrs `Doc` with a single root text type.
//! Every mutation (local edit or applied remote update) is reported to the
//! registered `on_update` callbacks together with its [`Origin`], so the
//! owner can fan the update out without echoing it back to its source.
//!
//! ```text
//!   insert / remove / format ──┐
//!                              ├──► Yrs transaction ──► DocUpdate { update, origin }
//!   apply_update(bytes, origin)┘                              │
//!                                                             ▼
//!                                                    on_update callbacks
//! ```
//!
//! Reference: Shapiro et al. — Conflict-free Replicated Data Types (2011)

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use yrs::types::text::YChange;
use yrs::types::Attrs;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, Options, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use thiserror::Error;

use crate::update_check::check_update_v1;

/// Default name of the root text type.
pub const DEFAULT_TEXT_NAME: &str = "content";

/// Opaque document identifier, taken from the request path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifies one live transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Produced in-process (uploads, client-side edits).
    Local,
    /// Loaded from the backing store.
    Persistence,
    /// Received from a connection.
    Connection(ConnectionId),
}

impl Origin {
    /// Whether an update with this origin should be delivered to `recipient`.
    pub fn should_deliver_to(&self, recipient: ConnectionId) -> bool {
        *self != Origin::Connection(recipient)
    }
}

/// A single mutation event.
#[derive(Debug, Clone)]
pub struct DocUpdate {
    /// Yrs v1 update bytes
    pub update: Vec<u8>,
    pub origin: Origin,
}

/// One operation of a flat rich-text delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeltaOp {
    Insert {
        insert: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attributes: Option<serde_json::Map<String, serde_json::Value>>,
    },
    Retain {
        retain: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attributes: Option<serde_json::Map<String, serde_json::Value>>,
    },
    Delete {
        delete: u32,
    },
}

impl DeltaOp {
    pub fn insert(text: impl Into<String>) -> Self {
        DeltaOp::Insert {
            insert: text.into(),
            attributes: None,
        }
    }
}

/// Ordered sequence of delta operations.
pub type Delta = Vec<DeltaOp>;

/// Render a delta's inserted text.
pub fn delta_text(delta: &[DeltaOp]) -> String {
    delta
        .iter()
        .filter_map(|op| match op {
            DeltaOp::Insert { insert, .. } => Some(insert.as_str()),
            _ => None,
        })
        .collect()
}

/// CRDT layer errors. All of them are recoverable for the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrdtError {
    #[error("malformed update: {0}")]
    MalformedUpdate(String),
    #[error("malformed state vector: {0}")]
    MalformedStateVector(String),
    #[error("update rejected: {0}")]
    Apply(String),
}

type UpdateCallback = Box<dyn Fn(&DocUpdate) + Send + Sync>;

/// Construction options.
#[derive(Debug, Clone)]
pub struct CrdtOptions {
    /// Name of the root text type
    pub text_name: String,
    /// Garbage-collect deleted content. Off keeps full tombstone history.
    pub gc: bool,
}

impl Default for CrdtOptions {
    fn default() -> Self {
        Self {
            text_name: DEFAULT_TEXT_NAME.to_string(),
            gc: true,
        }
    }
}

/// Replicated text document.
pub struct CrdtDocument {
    doc: Doc,
    text: TextRef,
    observers: Vec<UpdateCallback>,
}

impl CrdtDocument {
    pub fn new() -> Self {
        Self::with_options(&CrdtOptions::default())
    }

    pub fn with_options(options: &CrdtOptions) -> Self {
        let doc = Doc::with_options(Options {
            skip_gc: !options.gc,
            ..Options::default()
        });
        let text = doc.get_or_insert_text(options.text_name.as_str());
        Self {
            doc,
            text,
            observers: Vec::new(),
        }
    }

    /// Register a callback fired synchronously after every mutation.
    pub fn on_update<F>(&mut self, callback: F)
    where
        F: Fn(&DocUpdate) + Send + Sync + 'static,
    {
        self.observers.push(Box::new(callback));
    }

    fn emit(&self, update: Vec<u8>, origin: Origin) {
        if self.observers.is_empty() {
            return;
        }
        let event = DocUpdate { update, origin };
        for observer in &self.observers {
            observer(&event);
        }
    }

    // ─── Remote state ─────────────────────────────────────────────────

    /// Merge a remote update.
    ///
    /// Duplicate and out-of-order updates are fine; updates whose
    /// dependencies are missing are held by Yrs until they arrive.
    pub fn apply_update(&self, bytes: &[u8], origin: Origin) -> Result<(), CrdtError> {
        check_update_v1(bytes).map_err(|e| CrdtError::MalformedUpdate(e.to_string()))?;
        let update =
            Update::decode_v1(bytes).map_err(|e| CrdtError::MalformedUpdate(e.to_string()))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| CrdtError::Apply(e.to_string()))?;
        }
        self.emit(bytes.to_vec(), origin);
        Ok(())
    }

    /// Encode the full state, or only what `state_vector` is missing.
    pub fn encode_state_as_update(&self, state_vector: Option<&[u8]>) -> Result<Vec<u8>, CrdtError> {
        let sv = match state_vector {
            Some(bytes) => StateVector::decode_v1(bytes)
                .map_err(|e| CrdtError::MalformedStateVector(e.to_string()))?,
            None => StateVector::default(),
        };
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Full state snapshot.
    pub fn snapshot(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Compact summary of what this replica has seen.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    // ─── Content ──────────────────────────────────────────────────────

    /// Current content as a flat delta of inserts.
    pub fn to_delta(&self) -> Delta {
        let txn = self.doc.transact();
        self.text
            .diff(&txn, YChange::identity)
            .into_iter()
            .map(|diff| {
                let attributes = diff.attributes.map(|attrs| {
                    attrs
                        .iter()
                        .map(|(key, value)| {
                            let json = serde_json::to_value(value)
                                .unwrap_or(serde_json::Value::Null);
                            (key.to_string(), json)
                        })
                        .collect::<serde_json::Map<_, _>>()
                });
                DeltaOp::Insert {
                    insert: diff.insert.to_string(&txn),
                    attributes,
                }
            })
            .collect()
    }

    /// Plain text content.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.text.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ─── Local mutation ───────────────────────────────────────────────

    pub fn insert(&self, index: u32, chunk: &str, origin: Origin) -> Vec<u8> {
        self.mutate(origin, |text, txn| {
            if !chunk.is_empty() {
                text.insert(txn, index, chunk);
            }
        })
    }

    pub fn insert_with_attributes(
        &self,
        index: u32,
        chunk: &str,
        attributes: Attrs,
        origin: Origin,
    ) -> Vec<u8> {
        self.mutate(origin, |text, txn| {
            if !chunk.is_empty() {
                text.insert_with_attributes(txn, index, chunk, attributes);
            }
        })
    }

    /// Remove up to `len` characters; the range is clipped to the content.
    pub fn remove_range(&self, index: u32, len: u32, origin: Origin) -> Vec<u8> {
        self.mutate(origin, |text, txn| {
            let len = clip_range(text.len(&*txn), index, len);
            if len > 0 {
                text.remove_range(txn, index, len);
            }
        })
    }

    /// Format up to `len` characters; the range is clipped to the content.
    pub fn format(&self, index: u32, len: u32, attributes: Attrs, origin: Origin) -> Vec<u8> {
        self.mutate(origin, |text, txn| {
            let len = clip_range(text.len(&*txn), index, len);
            if len > 0 {
                text.format(txn, index, len, attributes);
            }
        })
    }

    /// Replace the whole content in a single transaction.
    pub fn replace_text(&self, content: &str, origin: Origin) -> Vec<u8> {
        self.mutate(origin, |text, txn| {
            let len = text.len(&*txn);
            if len > 0 {
                text.remove_range(txn, 0, len);
            }
            if !content.is_empty() {
                text.insert(txn, 0, content);
            }
        })
    }

    fn mutate<F>(&self, origin: Origin, f: F) -> Vec<u8>
    where
        F: FnOnce(&TextRef, &mut yrs::TransactionMut),
    {
        let update = {
            let mut txn = self.doc.transact_mut();
            f(&self.text, &mut txn);
            txn.encode_update_v1()
        };
        self.emit(update.clone(), origin);
        update
    }
}

/// Length of `index..index + len` that lies inside `0..available`.
fn clip_range(available: u32, index: u32, len: u32) -> u32 {
    if index >= available {
        0
    } else {
        len.min(available - index)
    }
}

impl Default for CrdtDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CrdtDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrdtDocument")
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use yrs::Any;

    fn doc_with(content: &str) -> CrdtDocument {
        let doc = CrdtDocument::new();
        doc.insert(0, content, Origin::Local);
        doc
    }

    #[test]
    fn test_insert_and_text() {
        let doc = doc_with("hello");
        assert_eq!(doc.text(), "hello");
        assert_eq!(doc.len(), 5);
        assert_eq!(doc.to_delta(), vec![DeltaOp::insert("hello")]);
    }

    #[test]
    fn test_empty_document_has_empty_delta() {
        let doc = CrdtDocument::new();
        assert!(doc.is_empty());
        assert!(doc.to_delta().is_empty());
    }

    #[test]
    fn test_remote_update_applies() {
        let a = CrdtDocument::new();
        let update = a.insert(0, "hello", Origin::Local);

        let b = CrdtDocument::new();
        b.apply_update(&update, Origin::Local).unwrap();
        assert_eq!(b.text(), "hello");
    }

    #[test]
    fn test_apply_is_idempotent() {
        let a = doc_with("hello");
        let full = a.snapshot();

        let b = CrdtDocument::new();
        b.apply_update(&full, Origin::Local).unwrap();
        b.apply_update(&full, Origin::Local).unwrap();
        assert_eq!(b.text(), "hello");
        assert_eq!(b.to_delta(), a.to_delta());
    }

    #[test]
    fn test_convergence_any_order_with_duplicates() {
        let a = CrdtDocument::new();
        let b = CrdtDocument::new();
        let ua = a.insert(0, "alpha ", Origin::Local);
        let ub = b.insert(0, "beta ", Origin::Local);
        let ua2 = a.insert(3, "XX", Origin::Local);

        let r1 = CrdtDocument::new();
        for u in [&ua, &ub, &ua2] {
            r1.apply_update(u, Origin::Local).unwrap();
        }

        let r2 = CrdtDocument::new();
        for u in [&ua2, &ub, &ua, &ub, &ua2] {
            r2.apply_update(u, Origin::Local).unwrap();
        }

        assert_eq!(r1.to_delta(), r2.to_delta());
        assert_eq!(r1.text(), r2.text());
        assert_eq!(r1.len(), 13);
    }

    #[test]
    fn test_state_vector_diff_contains_only_missing() {
        let a = doc_with("hello");
        let b = CrdtDocument::new();
        b.apply_update(&a.snapshot(), Origin::Local).unwrap();

        a.insert(5, " world", Origin::Local);
        let diff = a
            .encode_state_as_update(Some(&b.encode_state_vector()))
            .unwrap();
        assert!(diff.len() < a.snapshot().len());

        b.apply_update(&diff, Origin::Local).unwrap();
        assert_eq!(b.text(), "hello world");
    }

    #[test]
    fn test_malformed_update_is_error() {
        let doc = doc_with("keep");
        assert!(matches!(
            doc.apply_update(&[], Origin::Local),
            Err(CrdtError::MalformedUpdate(_))
        ));
        assert!(matches!(
            doc.apply_update(&[0x80], Origin::Local),
            Err(CrdtError::MalformedUpdate(_))
        ));
        assert_eq!(doc.text(), "keep");
    }

    /// `insert(0, "hello world")` from a fixed client id.
    fn hello_world_update() -> Vec<u8> {
        let doc = Doc::with_client_id(1_678_013_502);
        let text = doc.get_or_insert_text(DEFAULT_TEXT_NAME);
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 0, "hello world");
        txn.encode_update_v1()
    }

    #[test]
    fn test_invalid_utf8_in_update_rejected() {
        let mut bad = hello_world_update();
        let at = bad.iter().position(|b| *b == b'r').unwrap();
        bad[at] = 0xFF;

        let doc = doc_with("keep");
        assert!(matches!(
            doc.apply_update(&bad, Origin::Local),
            Err(CrdtError::MalformedUpdate(_))
        ));
        assert_eq!(doc.text(), "keep");
    }

    #[test]
    fn test_known_garbled_update_rejected() {
        let garbled: [u8; 31] = [
            1, 1, 190, 232, 145, 160, 6, 0, 4, 1, 7, 99, 111, 110, 116, 101, 110, 116, 11, 104,
            101, 108, 108, 111, 32, 119, 111, 255, 108, 100, 0,
        ];
        let doc = CrdtDocument::new();
        assert!(matches!(
            doc.apply_update(&garbled, Origin::Local),
            Err(CrdtError::MalformedUpdate(_))
        ));
        assert!(doc.is_empty());

        // The same bytes with the 0xFF restored apply cleanly.
        let mut repaired = garbled;
        repaired[27] = b'r';
        doc.apply_update(&repaired, Origin::Local).unwrap();
        assert_eq!(doc.text(), "hello world");
    }

    #[test]
    fn test_single_byte_corruptions_never_crash() {
        let original = hello_world_update();
        for at in 0..original.len() {
            for byte in 0u8..0x80 {
                if original[at] == byte {
                    continue;
                }
                let mut corrupted = original.clone();
                corrupted[at] = byte;
                let doc = CrdtDocument::new();
                // Either outcome is fine as long as the document stays usable.
                let _ = doc.apply_update(&corrupted, Origin::Local);
                let _ = doc.text();
            }
        }
    }

    #[test]
    fn test_oversized_length_fields_rejected() {
        let doc = CrdtDocument::new();
        // Delete set claiming billions of ranges.
        let huge_ranges = [0, 1, 7, 0x9B, 0xEF, 0x8B, 0xE0, 0x08];
        assert!(matches!(
            doc.apply_update(&huge_ranges, Origin::Local),
            Err(CrdtError::MalformedUpdate(_))
        ));
        // String content longer than the buffer.
        let mut long = hello_world_update();
        let at = long.iter().position(|b| *b == 11).unwrap();
        long[at] = 0x7F;
        assert!(matches!(
            doc.apply_update(&long, Origin::Local),
            Err(CrdtError::MalformedUpdate(_))
        ));
    }

    #[test]
    fn test_remove_past_end_is_clipped() {
        let doc = doc_with("abc");
        doc.remove_range(2, 10, Origin::Local);
        assert_eq!(doc.text(), "ab");

        let update = doc.remove_range(5, 3, Origin::Local);
        assert_eq!(doc.text(), "ab");
        let replica = CrdtDocument::new();
        replica.apply_update(&update, Origin::Local).unwrap();
    }

    #[test]
    fn test_format_past_end_is_clipped() {
        let doc = doc_with("abc");
        let bold: Attrs = Attrs::from([("bold".into(), Any::Bool(true))]);
        doc.format(1, 100, bold.clone(), Origin::Local);
        doc.format(3, 1, bold, Origin::Local);
        assert_eq!(doc.text(), "abc");
        let delta = doc.to_delta();
        assert_eq!(delta.len(), 2);
        assert_eq!(delta[0], DeltaOp::insert("a"));
    }

    #[test]
    fn test_malformed_state_vector_is_error() {
        let doc = CrdtDocument::new();
        assert!(matches!(
            doc.encode_state_as_update(Some(&[0x80])),
            Err(CrdtError::MalformedStateVector(_))
        ));
    }

    #[test]
    fn test_on_update_carries_origin() {
        let seen: Arc<Mutex<Vec<Origin>>> = Arc::new(Mutex::new(Vec::new()));
        let mut doc = CrdtDocument::new();
        let sink = seen.clone();
        doc.on_update(move |event| sink.lock().unwrap().push(event.origin));

        let conn = ConnectionId::new();
        let remote = doc_with("x").snapshot();
        doc.insert(0, "a", Origin::Local);
        doc.apply_update(&remote, Origin::Connection(conn)).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![Origin::Local, Origin::Connection(conn)]);
    }

    #[test]
    fn test_on_update_not_fired_for_rejected_update() {
        let count = Arc::new(Mutex::new(0usize));
        let mut doc = CrdtDocument::new();
        let sink = count.clone();
        doc.on_update(move |_| *sink.lock().unwrap() += 1);

        let _ = doc.apply_update(&[0x80], Origin::Local);
        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[test]
    fn test_origin_delivery_filter() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert!(!Origin::Connection(a).should_deliver_to(a));
        assert!(Origin::Connection(a).should_deliver_to(b));
        assert!(Origin::Local.should_deliver_to(a));
    }

    #[test]
    fn test_formatting_in_delta() {
        let doc = CrdtDocument::new();
        let bold: Attrs = Attrs::from([("bold".into(), Any::Bool(true))]);
        doc.insert(0, "plain ", Origin::Local);
        doc.insert_with_attributes(6, "bold", bold, Origin::Local);

        let delta = doc.to_delta();
        assert_eq!(delta.len(), 2);
        assert_eq!(delta[0], DeltaOp::insert("plain "));
        match &delta[1] {
            DeltaOp::Insert { insert, attributes } => {
                assert_eq!(insert, "bold");
                let attrs = attributes.as_ref().unwrap();
                assert_eq!(attrs.get("bold"), Some(&serde_json::Value::Bool(true)));
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn test_replace_text_single_update() {
        let doc = doc_with("old content");
        let replica = CrdtDocument::new();
        replica.apply_update(&doc.snapshot(), Origin::Local).unwrap();

        let update = doc.replace_text("new", Origin::Local);
        assert_eq!(doc.text(), "new");

        replica.apply_update(&update, Origin::Local).unwrap();
        assert_eq!(replica.text(), "new");
    }

    #[test]
    fn test_no_gc_option() {
        let doc = CrdtDocument::with_options(&CrdtOptions {
            text_name: "body".into(),
            gc: false,
        });
        doc.insert(0, "abc", Origin::Local);
        doc.remove_range(0, 3, Origin::Local);
        assert!(doc.is_empty());
        assert!(doc.to_delta().is_empty());
    }

    #[test]
    fn test_delta_json_shape() {
        let op = DeltaOp::insert("hi");
        assert_eq!(serde_json::to_string(&op).unwrap(), r#"{"insert":"hi"}"#);

        let parsed: Delta =
            serde_json::from_str(r#"[{"insert":"a"},{"retain":2},{"delete":1}]"#).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[2], DeltaOp::Delete { delete: 1 });
        assert_eq!(delta_text(&parsed), "a");
    }
}
