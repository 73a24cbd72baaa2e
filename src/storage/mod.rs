//! Local persistence for saves the backend could not accept.
//!
//! When a save still fails after its retries, the serialized document is
//! journaled in a sled-backed outbox keyed by document id. Pending entries
//! are merged into the room when the document is loaded again and replayed
//! to the backend in the background, so a backend outage does not lose the
//! last merged state.

mod outbox;

pub use outbox::{OutboxError, SaveOutbox};

use serde::{Deserialize, Serialize};

/// A save that has not reached the backend yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSave {
    pub doc_id: String,
    /// Raw serialized document
    pub state: Vec<u8>,
    pub doc_title: Option<String>,
    pub username: Option<String>,
    pub api_key: Option<String>,
    /// Unix timestamp of the first failed delivery
    pub queued_at: i64,
    /// Delivery attempts made so far
    pub attempts: u32,
}

impl PendingSave {
    pub fn new(doc_id: impl Into<String>, state: Vec<u8>) -> Self {
        Self {
            doc_id: doc_id.into(),
            state,
            doc_title: None,
            username: None,
            api_key: None,
            queued_at: chrono::Utc::now().timestamp(),
            attempts: 1,
        }
    }

    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.doc_title = title;
        self
    }

    pub fn with_identity(mut self, username: Option<String>, api_key: Option<String>) -> Self {
        self.username = username;
        self.api_key = api_key;
        self
    }
}
