//! In-memory snapshot store used by tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{BackendError, BackendResult, FetchRequest, FetchResponse, SaveRequest, SnapshotStore};
use crate::relay::codec;

#[derive(Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<String, String>>,
    fetches: Mutex<Vec<FetchRequest>>,
    saves: Mutex<Vec<SaveRequest>>,
    fetch_delay: Mutex<Option<Duration>>,
    fail_fetch: AtomicBool,
    fail_persist: AtomicBool,
    persist_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a stored snapshot with raw document bytes
    pub fn insert_state(&self, doc_id: &str, state: &[u8]) {
        let encoded = codec::encode_doc_bytes(state).unwrap();
        self.snapshots.lock().insert(doc_id.to_string(), encoded);
    }

    /// Seed a stored `doc_uint8` value verbatim
    pub fn insert_raw(&self, doc_id: &str, doc_uint8: &str) {
        self.snapshots
            .lock()
            .insert(doc_id.to_string(), doc_uint8.to_string());
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = Some(delay);
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn fail_persists(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().len()
    }

    pub fn fetches(&self) -> Vec<FetchRequest> {
        self.fetches.lock().clone()
    }

    pub fn persist_attempts(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }

    /// Successfully persisted requests, oldest first
    pub fn saves(&self) -> Vec<SaveRequest> {
        self.saves.lock().clone()
    }

    pub fn last_save(&self) -> Option<SaveRequest> {
        self.saves.lock().last().cloned()
    }

    /// Raw document bytes currently stored for a document
    pub fn stored_state(&self, doc_id: &str) -> Option<Vec<u8>> {
        let snapshots = self.snapshots.lock();
        codec::decode_doc_bytes(snapshots.get(doc_id)?).ok()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn fetch_snapshot(&self, request: &FetchRequest) -> BackendResult<FetchResponse> {
        self.fetches.lock().push(request.clone());
        let delay = *self.fetch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("connection refused".into()));
        }
        let stored = self.snapshots.lock().get(&request.doc_id).cloned();
        Ok(match stored {
            Some(doc_uint8) => FetchResponse::with_snapshot(doc_uint8),
            None => FetchResponse::default(),
        })
    }

    async fn persist(&self, request: &SaveRequest) -> BackendResult<()> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_persist.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("connection reset".into()));
        }
        self.snapshots
            .lock()
            .insert(request.doc_id.clone(), request.doc_uint8.clone());
        self.saves.lock().push(request.clone());
        Ok(())
    }
}
