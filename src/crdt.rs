//! Thin wrapper around the yrs document type.
//!
//! Clients produce v1-encoded binary updates; the server treats them as
//! opaque except for applying them to a cached document and encoding full
//! state for snapshots. All CRDT semantics (commutativity, causal order)
//! come from yrs itself.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

/// Root shared type every document edits.
pub const TEXT_ROOT: &str = "content";

#[derive(Debug, Error)]
pub enum CrdtError {
    #[error("malformed update: {0}")]
    Decode(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
}

pub fn new_doc() -> Doc {
    Doc::new()
}

pub fn apply_update(doc: &Doc, bytes: &[u8]) -> Result<(), CrdtError> {
    let update = Update::decode_v1(bytes).map_err(|err| CrdtError::Decode(err.to_string()))?;
    let mut txn = doc.transact_mut();
    txn.apply_update(update)
        .map_err(|err| CrdtError::Apply(err.to_string()))
}

/// Encodes the full document state as a single v1 update blob, suitable as
/// a snapshot: applying it to a fresh document reproduces the state.
pub fn encode_full_state(doc: &Doc) -> Vec<u8> {
    doc.transact().encode_state_as_update_v1(&StateVector::default())
}

/// Encodes `content` as the first update of a brand-new document.
pub fn encode_initial_content(content: &str) -> Vec<u8> {
    let doc = Doc::new();
    let text = doc.get_or_insert_text(TEXT_ROOT);
    {
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 0, content);
    }
    encode_full_state(&doc)
}

pub fn text_content(doc: &Doc) -> String {
    let text = doc.get_or_insert_text(TEXT_ROOT);
    let txn = doc.transact();
    text.get_string(&txn)
}
