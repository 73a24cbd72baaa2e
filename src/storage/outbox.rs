//! Sled-backed outbox of pending saves.

use std::path::Path;
use std::sync::Arc;

use sled::{Db, Tree};
use thiserror::Error;

use super::PendingSave;

/// Errors that can occur during outbox operations
#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Outbox initialization failed: {0}")]
    InitFailed(String),
}

pub type OutboxResult<T> = Result<T, OutboxError>;

const TREE_PENDING: &str = "pending_saves";

/// Journal of saves waiting for the backend, one entry per document
#[derive(Clone)]
pub struct SaveOutbox {
    db: Arc<Db>,
    pending: Tree,
}

impl SaveOutbox {
    /// Open or create the outbox at the given path
    pub fn open(path: impl AsRef<Path>) -> OutboxResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                OutboxError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new().path(path).flush_every_ms(Some(500)).open()?;
        Self::from_db(db)
    }

    /// Outbox that lives only as long as the process
    pub fn temporary() -> OutboxResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> OutboxResult<Self> {
        let pending = db.open_tree(TREE_PENDING)?;
        Ok(Self {
            db: Arc::new(db),
            pending,
        })
    }

    /// Store the latest undelivered state for a document.
    ///
    /// A newer state replaces the older one; the attempt counter and the
    /// original queue time carry over.
    pub fn stash(&self, save: &PendingSave) -> OutboxResult<()> {
        let mut entry = save.clone();
        if let Some(previous) = self.get(&save.doc_id)? {
            entry.attempts = previous.attempts.saturating_add(save.attempts);
            entry.queued_at = previous.queued_at;
        }
        self.pending
            .insert(entry.doc_id.as_bytes(), bincode::serialize(&entry)?)?;
        Ok(())
    }

    pub fn get(&self, doc_id: &str) -> OutboxResult<Option<PendingSave>> {
        match self.pending.get(doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, doc_id: &str) -> OutboxResult<bool> {
        Ok(self.pending.remove(doc_id.as_bytes())?.is_some())
    }

    /// All pending entries ordered by document id
    pub fn list(&self) -> OutboxResult<Vec<PendingSave>> {
        let mut entries = Vec::new();
        for item in self.pending.iter() {
            let (_, value) = item?;
            entries.push(bincode::deserialize(&value)?);
        }
        Ok(entries)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> OutboxResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl Drop for SaveOutbox {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.db.flush();
    }
}
