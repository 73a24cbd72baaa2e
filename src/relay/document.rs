//! Automerge document wrapper for a relayed room.
//!
//! The relay never interprets document content beyond the title; everything
//! else is opaque CRDT state that is merged and serialized through Automerge.

use automerge::{
    transaction::Transactable, AutoCommit, Automerge, AutomergeError, LoadOptions, ObjType,
    OnPartialLoad, ReadDoc, ScalarValue, Value, ROOT,
};
use thiserror::Error;

/// Errors that can occur during document operations
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Automerge error: {0}")]
    Automerge(#[from] automerge::AutomergeError),
}

pub type DocumentResult<T> = Result<T, DocumentError>;

/// Keys used in the Automerge document structure
mod keys {
    pub const TITLE_MAP: &str = "title";
    pub const TITLE: &str = "title";
}

/// In-memory CRDT document shared by the peers of a room
pub struct RelayDocument {
    doc: AutoCommit,
}

impl RelayDocument {
    /// Create a new empty document
    pub fn new() -> Self {
        Self {
            doc: AutoCommit::new(),
        }
    }

    /// Build a document by applying `update` to a fresh empty document
    pub fn from_update(update: &[u8]) -> DocumentResult<Self> {
        let mut doc = Self::new();
        doc.apply_update(update)?;
        Ok(doc)
    }

    /// Merge a serialized update (full save or incremental changes).
    ///
    /// The update is parsed strictly first: `load_incremental` alone skips
    /// undecodable chunks, which would turn foreign bytes into a silent no-op.
    pub fn apply_update(&mut self, update: &[u8]) -> DocumentResult<()> {
        if update.is_empty() {
            return Ok(());
        }
        validate_chunks(update)?;
        self.doc.load_incremental(update)?;
        Ok(())
    }

    /// Merge another in-memory document into this one
    pub fn merge(&mut self, other: &mut RelayDocument) -> DocumentResult<()> {
        self.doc.merge(&mut other.doc)?;
        Ok(())
    }

    /// Serialize the full current state
    pub fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Serialize the changes made since the last save
    #[cfg(test)]
    pub fn save_incremental(&mut self) -> Vec<u8> {
        self.doc.save_incremental()
    }

    /// Independent copy that can be edited and merged back
    #[cfg(test)]
    pub fn fork(&mut self) -> Self {
        Self {
            doc: self.doc.fork(),
        }
    }

    /// True when the document holds no changes at all
    pub fn is_empty(&mut self) -> bool {
        self.doc.get_heads().is_empty()
    }

    /// Title stored under the reserved title map
    pub fn title(&self) -> Option<String> {
        match self.doc.get(ROOT, keys::TITLE_MAP).ok()?? {
            (Value::Object(ObjType::Map), map) => self
                .doc
                .get(&map, keys::TITLE)
                .ok()?
                .and_then(|(value, _)| scalar_str(&value)),
            // Older documents stored the title as a plain root string
            (value, _) => scalar_str(&value),
        }
    }

    pub fn set_title(&mut self, title: &str) -> DocumentResult<()> {
        let map = match self.doc.get(ROOT, keys::TITLE_MAP)? {
            Some((Value::Object(ObjType::Map), id)) => id,
            _ => self.doc.put_object(ROOT, keys::TITLE_MAP, ObjType::Map)?,
        };
        self.doc.put(&map, keys::TITLE, title)?;
        Ok(())
    }
}

impl Default for RelayDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RelayDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayDocument")
            .field("title", &self.title())
            .finish_non_exhaustive()
    }
}

/// Check that every chunk of `update` parses and passes its checksum.
///
/// Loading into a scratch document reports `MissingDeps` once all chunks
/// parsed but some changes depend on history the scratch document lacks,
/// which is the normal shape of an incremental update.
fn validate_chunks(update: &[u8]) -> Result<(), AutomergeError> {
    let strict = LoadOptions::new().on_partial_load(OnPartialLoad::Error);
    match Automerge::load_with_options(update, strict) {
        Ok(_) | Err(AutomergeError::MissingDeps) => Ok(()),
        Err(e) => Err(e),
    }
}

fn scalar_str(value: &Value<'_>) -> Option<String> {
    match value {
        Value::Scalar(scalar) => match scalar.as_ref() {
            ScalarValue::Str(text) => Some(text.to_string()),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_document_is_empty() {
        let mut doc = RelayDocument::new();
        assert!(doc.is_empty());
        assert_eq!(doc.title(), None);

        let restored = RelayDocument::from_update(&doc.save());
        assert!(restored.unwrap().is_empty());
    }

    #[test]
    fn test_title_survives_save_and_load() {
        let mut doc = RelayDocument::new();
        doc.set_title("Quarterly Report").unwrap();

        let saved = doc.save();
        let mut loaded = RelayDocument::from_update(&saved).unwrap();

        assert!(!loaded.is_empty());
        assert_eq!(loaded.title().as_deref(), Some("Quarterly Report"));
    }

    #[test]
    fn test_set_title_reuses_map() {
        let mut doc = RelayDocument::new();
        doc.set_title("Draft").unwrap();
        doc.set_title("Final").unwrap();
        assert_eq!(doc.title().as_deref(), Some("Final"));
    }

    #[test]
    fn test_plain_root_title_is_read() {
        let mut raw = AutoCommit::new();
        raw.put(ROOT, "title", "Legacy").unwrap();
        let doc = RelayDocument::from_update(&raw.save()).unwrap();
        assert_eq!(doc.title().as_deref(), Some("Legacy"));
    }

    #[test]
    fn test_garbage_update_is_rejected() {
        let mut doc = RelayDocument::new();
        assert!(doc.apply_update(&[1, 2, 3, 4, 5]).is_err());
        assert!(RelayDocument::from_update(b"definitely not automerge").is_err());
        assert!(doc.is_empty());
    }

    #[test]
    fn test_incremental_updates_merge() {
        let mut server = RelayDocument::new();
        server.set_title("Base").unwrap();
        let base = server.save();

        let mut peer = RelayDocument::from_update(&base).unwrap();
        peer.save_incremental();
        peer.set_title("Edited by peer").unwrap();
        let delta = peer.save_incremental();

        server.apply_update(&delta).unwrap();
        assert_eq!(server.title().as_deref(), Some("Edited by peer"));
    }

    #[test]
    fn test_corrupted_incremental_update_is_rejected() {
        let mut server = RelayDocument::new();
        server.set_title("Base").unwrap();
        let base = server.save();

        let mut peer = RelayDocument::from_update(&base).unwrap();
        peer.save_incremental();
        peer.set_title("Edited by peer").unwrap();
        let mut delta = peer.save_incremental();
        let last = delta.len() - 1;
        delta[last] ^= 0xFF;

        assert!(server.apply_update(&delta).is_err());
        assert_eq!(server.title().as_deref(), Some("Base"));
    }

    #[test]
    fn test_concurrent_edits_converge() {
        let mut a = RelayDocument::new();
        a.set_title("Start").unwrap();
        let mut b = a.fork();

        a.set_title("From A").unwrap();
        b.set_title("From B").unwrap();

        let mut b_copy = b.fork();
        a.merge(&mut b_copy).unwrap();
        b.apply_update(&a.save()).unwrap();

        assert_eq!(a.title(), b.title());
        let title = a.title().unwrap();
        assert!(title == "From A" || title == "From B");
    }
}
