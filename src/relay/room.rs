//! Rooms of peers sharing one document, and the registry that owns them.
//!
//! Concurrency model:
//! - `DashMap` of rooms keyed by `doc_id`; room handles are cloned out before
//!   any `.await`, map guards are never held across one
//! - one load per room through `tokio::sync::OnceCell`, later joiners wait
//!   for the first load and share its document
//! - the document sits behind a `parking_lot::Mutex` that is never held
//!   across `.await`
//! - saves of a room are serialized by an async mutex and always capture the
//!   state current at the moment the save starts

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, OnceCell};
use tracing::{debug, error, info, warn};

use super::document::RelayDocument;
use super::hooks::{DocSnapshot, DocSyncRelay, LoadOutcome};
use super::params::ConnectionParams;
use super::protocol::{PeerInfo, ServerMessage, WarningCode, PROTOCOL_VERSION};
use super::{DocId, PeerId, RelayError, RelayResult};
use crate::backend::BackendPool;
use crate::config::RoomConfig;
use crate::storage::{PendingSave, SaveOutbox};

/// Lifecycle phase of a room's document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomPhase {
    Unloaded,
    Loading,
    Loaded,
    /// Loaded, with a save in flight; edits keep being merged
    Saving,
}

/// A connected peer and the relay it joined with
struct PeerSlot {
    info: PeerInfo,
    joined_seq: u64,
    relay: Arc<DocSyncRelay>,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

/// A document and the peers currently editing it
pub struct Room {
    doc_id: DocId,
    document: OnceCell<Mutex<RelayDocument>>,
    peers: DashMap<PeerId, PeerSlot>,
    /// Relay whose credentials are used for saves
    save_relay: RwLock<Option<Arc<DocSyncRelay>>>,
    phase: RwLock<RoomPhase>,
    dirty: AtomicBool,
    save_lock: tokio::sync::Mutex<()>,
    join_seq: AtomicU64,
    /// Joins and replays currently holding the room open
    leases: AtomicUsize,
    load_warning: RwLock<Option<(WarningCode, String)>>,
    last_saved_at: RwLock<Option<i64>>,
    created_at: Instant,
}

impl Room {
    fn new(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            document: OnceCell::new(),
            peers: DashMap::new(),
            save_relay: RwLock::new(None),
            phase: RwLock::new(RoomPhase::Unloaded),
            dirty: AtomicBool::new(false),
            save_lock: tokio::sync::Mutex::new(()),
            join_seq: AtomicU64::new(0),
            leases: AtomicUsize::new(0),
            load_warning: RwLock::new(None),
            last_saved_at: RwLock::new(None),
            created_at: Instant::now(),
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn phase(&self) -> RoomPhase {
        *self.phase.read()
    }

    #[cfg(test)]
    pub fn is_loaded(&self) -> bool {
        self.document.initialized()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn title(&self) -> Option<String> {
        self.document.get().and_then(|doc| doc.lock().title())
    }

    /// Full serialized state of the loaded document
    pub fn full_state(&self) -> Option<Vec<u8>> {
        self.document.get().map(|doc| doc.lock().save())
    }

    pub fn load_warning(&self) -> Option<(WarningCode, String)> {
        self.load_warning.read().clone()
    }

    fn load_failed(&self) -> bool {
        matches!(*self.load_warning.read(), Some((WarningCode::LoadFailed, _)))
    }

    /// Load the document unless another caller already did.
    ///
    /// Returns true for the single caller that performed the load.
    pub async fn ensure_loaded(
        &self,
        relay: &Arc<DocSyncRelay>,
        outbox: Option<&SaveOutbox>,
    ) -> bool {
        let mut loaded_now = false;
        let flag = &mut loaded_now;
        self.document
            .get_or_init(move || async move {
                *flag = true;
                self.load_document(relay, outbox).await
            })
            .await;
        loaded_now
    }

    async fn load_document(
        &self,
        relay: &Arc<DocSyncRelay>,
        outbox: Option<&SaveOutbox>,
    ) -> Mutex<RelayDocument> {
        *self.phase.write() = RoomPhase::Loading;
        {
            let mut save_relay = self.save_relay.write();
            if save_relay.is_none() {
                *save_relay = Some(relay.clone());
            }
        }

        let started = Instant::now();
        let outcome = relay.load().await;
        info!(
            doc_id = %self.doc_id,
            outcome = outcome.label(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Room document loaded"
        );

        let warning = outcome.warning();
        let mut document = outcome.into_document();

        if let Some(outbox) = outbox {
            match outbox.get(&self.doc_id) {
                Ok(Some(pending)) => self.absorb_pending(&mut document, &pending, outbox),
                Ok(None) => {}
                Err(e) => error!(doc_id = %self.doc_id, error = %e, "Failed to read outbox"),
            }
        }

        *self.load_warning.write() = warning;
        *self.phase.write() = RoomPhase::Loaded;
        Mutex::new(document)
    }

    /// Merge a journaled save into the document
    fn absorb_pending(
        &self,
        document: &mut RelayDocument,
        pending: &PendingSave,
        outbox: &SaveOutbox,
    ) {
        let merged = RelayDocument::from_update(&pending.state)
            .and_then(|mut journaled| document.merge(&mut journaled));

        match merged {
            Ok(()) => {
                self.dirty.store(true, Ordering::SeqCst);
                info!(
                    doc_id = %self.doc_id,
                    attempts = pending.attempts,
                    queued_at = pending.queued_at,
                    "Merged pending save from outbox"
                );
            }
            Err(e) => {
                error!(doc_id = %self.doc_id, error = %e, "Discarding undecodable pending save");
                if let Err(e) = outbox.remove(&self.doc_id) {
                    warn!(doc_id = %self.doc_id, error = %e, "Failed to remove pending save");
                }
            }
        }
    }

    /// Merge a journaled save into an already loaded room
    fn merge_pending(&self, pending: &PendingSave, outbox: &SaveOutbox) -> RelayResult<()> {
        let document = self
            .document
            .get()
            .ok_or_else(|| RelayError::RoomNotLoaded(self.doc_id.clone()))?;
        self.absorb_pending(&mut document.lock(), pending, outbox);
        Ok(())
    }

    /// Add a peer and send it the welcome state.
    ///
    /// The welcome is sent under the document lock, so the peer receives
    /// every update merged after its snapshot and none merged before.
    fn admit(
        &self,
        relay: Arc<DocSyncRelay>,
        tx: mpsc::UnboundedSender<ServerMessage>,
        max_peers: usize,
    ) -> RelayResult<PeerInfo> {
        let document = self
            .document
            .get()
            .ok_or_else(|| RelayError::RoomNotLoaded(self.doc_id.clone()))?;

        if self.peers.len() >= max_peers {
            return Err(RelayError::RoomFull(self.doc_id.clone()));
        }

        let info = PeerInfo {
            peer_id: uuid::Uuid::new_v4().to_string(),
            username: relay.params().display_name().to_string(),
            color: generate_peer_color(),
            joined_at: chrono::Utc::now().timestamp(),
        };

        let mut doc = document.lock();
        let welcome = ServerMessage::Welcome {
            protocol_version: PROTOCOL_VERSION,
            peer_id: info.peer_id.clone(),
            doc_id: self.doc_id.clone(),
            color: info.color.clone(),
            document_state: doc.save(),
            title: doc.title(),
            peers: self.peers_info(),
        };
        let _ = tx.send(welcome);
        if let Some((code, message)) = self.load_warning() {
            let _ = tx.send(ServerMessage::Warning { code, message });
        }

        let joined_seq = self.join_seq.fetch_add(1, Ordering::SeqCst);
        self.peers.insert(
            info.peer_id.clone(),
            PeerSlot {
                info: info.clone(),
                joined_seq,
                relay,
                tx,
            },
        );
        drop(doc);

        self.refresh_save_relay();
        Ok(info)
    }

    fn remove_peer(&self, peer_id: &str) -> Option<PeerInfo> {
        let removed = self.peers.remove(peer_id).map(|(_, slot)| slot.info);
        self.refresh_save_relay();
        removed
    }

    /// Hand saves to the longest-connected peer; an empty room keeps the
    /// relay it had
    fn refresh_save_relay(&self) {
        let earliest = self
            .peers
            .iter()
            .min_by_key(|slot| slot.joined_seq)
            .map(|slot| slot.relay.clone());
        if let Some(relay) = earliest {
            *self.save_relay.write() = Some(relay);
        }
    }

    /// Use `relay` for saves while nobody is connected
    fn adopt_relay(&self, relay: Arc<DocSyncRelay>) {
        if self.peers.is_empty() {
            *self.save_relay.write() = Some(relay);
        }
    }

    /// Username whose credentials the next save will use
    pub fn save_identity(&self) -> Option<String> {
        self.save_relay
            .read()
            .as_ref()
            .and_then(|relay| relay.params().username().map(str::to_string))
    }

    pub fn peers_info(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<(u64, PeerInfo)> = self
            .peers
            .iter()
            .map(|slot| (slot.joined_seq, slot.info.clone()))
            .collect();
        peers.sort_by_key(|(seq, _)| *seq);
        peers.into_iter().map(|(_, info)| info).collect()
    }

    /// Merge a peer's update and relay it to everyone else
    pub fn apply_update(&self, peer_id: &str, update: &[u8]) -> RelayResult<()> {
        let document = self
            .document
            .get()
            .ok_or_else(|| RelayError::RoomNotLoaded(self.doc_id.clone()))?;
        if !self.peers.contains_key(peer_id) {
            return Err(RelayError::PeerNotFound(peer_id.to_string()));
        }

        let mut doc = document.lock();
        doc.apply_update(update)?;
        self.dirty.store(true, Ordering::SeqCst);
        self.broadcast_except(
            peer_id,
            ServerMessage::Update {
                update: update.to_vec(),
                from_peer: Some(peer_id.to_string()),
            },
        );
        drop(doc);

        debug!(doc_id = %self.doc_id, peer_id, bytes = update.len(), "Update merged");
        Ok(())
    }

    pub fn send_to(&self, peer_id: &str, msg: ServerMessage) -> bool {
        self.peers
            .get(peer_id)
            .map(|slot| slot.tx.send(msg).is_ok())
            .unwrap_or(false)
    }

    pub fn broadcast(&self, msg: ServerMessage) {
        for slot in self.peers.iter() {
            let _ = slot.tx.send(msg.clone());
        }
    }

    pub fn broadcast_except(&self, exclude_peer: &str, msg: ServerMessage) {
        for slot in self.peers.iter() {
            if slot.key() != exclude_peer {
                let _ = slot.tx.send(msg.clone());
            }
        }
    }

    /// Persist the current state if it changed since the last save.
    ///
    /// Returns whether anything was written. On failure the room stays
    /// dirty and the state is journaled in the outbox. A room whose initial
    /// load failed first fetches the stored snapshot again and merges it, so
    /// the save never replaces stored content with unrelated history.
    pub async fn save(
        &self,
        outbox: Option<&SaveOutbox>,
        notify_failure: bool,
    ) -> RelayResult<bool> {
        let _guard = self.save_lock.lock().await;

        let Some(document) = self.document.get() else {
            return Ok(false);
        };
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        let Some(relay) = self.save_relay.read().clone() else {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(RelayError::NoSaveRelay(self.doc_id.clone()));
        };

        *self.phase.write() = RoomPhase::Saving;
        let result = match self.reconcile_failed_load(&relay, document).await {
            Ok(()) => {
                let snapshot = DocSnapshot::capture(&mut document.lock());
                let saved = relay.save(&snapshot).await;
                saved.map(|()| snapshot)
            }
            Err(e) => Err(e),
        };
        *self.phase.write() = RoomPhase::Loaded;

        match result {
            Ok(snapshot) => {
                let saved_at = chrono::Utc::now().timestamp();
                *self.last_saved_at.write() = Some(saved_at);
                self.load_warning.write().take();
                if let Some(outbox) = outbox {
                    if let Err(e) = outbox.remove(&self.doc_id) {
                        warn!(doc_id = %self.doc_id, error = %e, "Failed to clear pending save");
                    }
                }
                self.broadcast(ServerMessage::Saved {
                    doc_title: snapshot.title,
                    saved_at,
                });
                Ok(true)
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                if let Some(outbox) = outbox {
                    let snapshot = DocSnapshot::capture(&mut document.lock());
                    self.journal(outbox, &relay, snapshot);
                }
                if notify_failure {
                    self.broadcast(ServerMessage::Warning {
                        code: WarningCode::SaveFailed,
                        message: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    /// Fetch the stored snapshot again after a failed initial load and merge
    /// it into the room; peers receive the stored state as an update
    async fn reconcile_failed_load(
        &self,
        relay: &Arc<DocSyncRelay>,
        document: &Mutex<RelayDocument>,
    ) -> RelayResult<()> {
        if !self.load_failed() {
            return Ok(());
        }

        match relay.load().await {
            LoadOutcome::Failed(reason) => Err(RelayError::SaveFailed {
                doc_id: self.doc_id.clone(),
                reason: format!("stored snapshot still unavailable: {}", reason),
            }),
            outcome => {
                let warning = outcome.warning();
                let label = outcome.label();
                let mut stored = outcome.into_document();
                let stored_state = stored.save();

                let mut doc = document.lock();
                doc.merge(&mut stored)?;
                *self.load_warning.write() = warning;
                self.broadcast(ServerMessage::Update {
                    update: stored_state,
                    from_peer: None,
                });
                drop(doc);

                info!(doc_id = %self.doc_id, outcome = label, "Stored snapshot merged after failed load");
                Ok(())
            }
        }
    }

    fn journal(&self, outbox: &SaveOutbox, relay: &DocSyncRelay, snapshot: DocSnapshot) {
        let params = relay.params();
        let pending = PendingSave::new(self.doc_id.clone(), snapshot.state)
            .with_title(snapshot.title)
            .with_identity(
                params.username().map(str::to_string),
                params.api_token().map(str::to_string),
            );
        match outbox.stash(&pending) {
            Ok(()) => info!(doc_id = %self.doc_id, "Save journaled to outbox"),
            Err(e) => error!(doc_id = %self.doc_id, error = %e, "Failed to journal save"),
        }
    }

    /// Whether the room can be dropped without losing anything
    fn is_idle(&self) -> bool {
        self.peers.is_empty()
            && self.leases.load(Ordering::SeqCst) == 0
            && !self.is_dirty()
            && self.save_lock.try_lock().is_ok()
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            doc_id: self.doc_id.clone(),
            peers: self.peer_count(),
            phase: self.phase(),
            dirty: self.is_dirty(),
            title: self.title(),
            warning: self.load_warning.read().as_ref().map(|(code, _)| *code),
            last_saved_at: *self.last_saved_at.read(),
            age_seconds: self.created_at.elapsed().as_secs(),
        }
    }
}

/// Summary of a room for the inspection endpoint
#[derive(Debug, Clone, Serialize)]
pub struct RoomInfo {
    pub doc_id: DocId,
    pub peers: usize,
    pub phase: RoomPhase,
    pub dirty: bool,
    pub title: Option<String>,
    pub warning: Option<WarningCode>,
    pub last_saved_at: Option<i64>,
    pub age_seconds: u64,
}

/// Keeps a room from being evicted while a join or replay is using it
struct RoomLease {
    room: Arc<Room>,
}

impl Drop for RoomLease {
    fn drop(&mut self) {
        self.room.leases.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Registry statistics
#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub active_rooms: usize,
    pub connected_peers: usize,
    pub pending_saves: usize,
    pub uptime_seconds: u64,
}

/// All live rooms of the relay
pub struct RoomRegistry {
    config: RoomConfig,
    rooms: DashMap<DocId, Arc<Room>>,
    pool: Arc<BackendPool>,
    outbox: Option<SaveOutbox>,
    started_at: Instant,
    shutdown_tx: broadcast::Sender<()>,
}

impl RoomRegistry {
    pub fn new(config: RoomConfig, pool: Arc<BackendPool>, outbox: Option<SaveOutbox>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            rooms: DashMap::new(),
            pool,
            outbox,
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    pub fn outbox(&self) -> Option<&SaveOutbox> {
        self.outbox.as_ref()
    }

    /// Relay for a newly accepted connection
    pub fn relay_for(&self, params: ConnectionParams) -> RelayResult<Arc<DocSyncRelay>> {
        let store = self.pool.connect()?;
        Ok(Arc::new(DocSyncRelay::new(
            params,
            store,
            self.config.load_timeout,
        )))
    }

    fn lease(&self, doc_id: &str) -> RoomLease {
        let entry = self.rooms.entry(doc_id.to_string()).or_insert_with(|| {
            debug!(doc_id, "Creating room");
            Arc::new(Room::new(doc_id))
        });
        entry.leases.fetch_add(1, Ordering::SeqCst);
        RoomLease {
            room: entry.value().clone(),
        }
    }

    pub fn get(&self, doc_id: &str) -> Option<Arc<Room>> {
        self.rooms.get(doc_id).map(|room| room.clone())
    }

    /// Join the room for the relay's document, loading it on first use.
    ///
    /// The welcome (and any load warning) is sent through `tx` before this
    /// returns.
    pub async fn join(
        &self,
        relay: Arc<DocSyncRelay>,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> RelayResult<(Arc<Room>, PeerInfo)> {
        let lease = self.lease(relay.doc_id());
        let room = lease.room.clone();

        room.ensure_loaded(&relay, self.outbox.as_ref()).await;
        let peer = room.admit(relay.clone(), tx, self.config.max_peers_per_room)?;
        drop(lease);

        room.broadcast_except(
            &peer.peer_id,
            ServerMessage::PeerJoined { peer: peer.clone() },
        );

        info!(
            doc_id = %room.doc_id,
            peer_id = %peer.peer_id,
            username = %peer.username,
            token = %relay.params().token_fingerprint(),
            peers = room.peer_count(),
            "Peer joined room"
        );
        Ok((room, peer))
    }

    /// Remove a peer; the last one out triggers a save
    pub async fn leave(&self, room: &Arc<Room>, peer_id: &str, reason: Option<String>) {
        if room.remove_peer(peer_id).is_none() {
            return;
        }

        room.broadcast(ServerMessage::PeerLeft {
            peer_id: peer_id.to_string(),
            reason,
        });
        info!(doc_id = %room.doc_id, peer_id, peers = room.peer_count(), "Peer left room");

        if room.is_empty() && room.is_dirty() {
            if let Err(e) = room.save(self.outbox.as_ref(), false).await {
                warn!(doc_id = %room.doc_id, error = %e, "Save after last peer left failed");
            }
        }
        self.evict_if_idle(&room.doc_id);
    }

    /// Save a room now
    pub async fn flush(&self, doc_id: &str) -> RelayResult<bool> {
        let room = self
            .get(doc_id)
            .ok_or_else(|| RelayError::RoomNotFound(doc_id.to_string()))?;
        room.save(
            self.outbox.as_ref(),
            self.config.notify_peers_on_save_failure,
        )
        .await
    }

    /// Save every dirty room, returning how many were persisted
    pub async fn save_dirty_rooms(&self) -> usize {
        let dirty: Vec<Arc<Room>> = self
            .rooms
            .iter()
            .filter(|entry| entry.is_dirty())
            .map(|entry| entry.value().clone())
            .collect();

        let mut saved = 0;
        for room in dirty {
            match room
                .save(
                    self.outbox.as_ref(),
                    self.config.notify_peers_on_save_failure,
                )
                .await
            {
                Ok(true) => saved += 1,
                Ok(false) => {}
                Err(e) => debug!(doc_id = %room.doc_id, error = %e, "Autosave failed"),
            }
        }
        saved
    }

    fn evict_if_idle(&self, doc_id: &str) -> bool {
        let evicted = self.rooms.remove_if(doc_id, |_, room| room.is_idle()).is_some();
        if evicted {
            info!(doc_id, "Room evicted");
        }
        evicted
    }

    /// Drop idle rooms, returning how many were removed
    pub fn cleanup(&self) -> usize {
        let idle: Vec<DocId> = self
            .rooms
            .iter()
            .filter(|entry| entry.is_idle())
            .map(|entry| entry.key().clone())
            .collect();

        idle.iter().filter(|doc_id| self.evict_if_idle(doc_id)).count()
    }

    /// Deliver journaled saves, returning how many reached the backend.
    ///
    /// Each entry goes through its room: the room is opened (loading the
    /// stored snapshot and merging the entry) or the entry is merged into
    /// the live room, and the merged state is saved. The backend's own state
    /// is therefore never overwritten by an older journaled one.
    pub async fn replay_outbox(&self) -> usize {
        let Some(outbox) = self.outbox.as_ref() else {
            return 0;
        };
        let entries = match outbox.list() {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "Failed to read outbox");
                return 0;
            }
        };

        let mut delivered = 0;
        for pending in entries {
            let doc_id = pending.doc_id.clone();
            let lease = self.lease(&doc_id);
            let room = lease.room.clone();

            let relay = Arc::new(DocSyncRelay::new(
                ConnectionParams::new(
                    doc_id.clone(),
                    pending.api_key.clone(),
                    pending.username.clone(),
                ),
                self.pool.shared(),
                self.config.load_timeout,
            ));
            room.adopt_relay(relay.clone());

            if room.ensure_loaded(&relay, Some(outbox)).await {
                if room.load_failed() && room.is_empty() {
                    // Backend still unreachable; keep the entry for later
                    drop(lease);
                    self.discard(&room);
                    continue;
                }
            } else if let Err(e) = room.merge_pending(&pending, outbox) {
                debug!(doc_id, error = %e, "Room not ready for replay");
                continue;
            }

            match room.save(Some(outbox), false).await {
                Ok(true) => {
                    delivered += 1;
                    info!(doc_id, attempts = pending.attempts, "Pending save delivered");
                }
                Ok(false) => {}
                Err(e) => debug!(doc_id, error = %e, "Pending save still undeliverable"),
            }

            drop(lease);
            self.evict_if_idle(&doc_id);
        }
        delivered
    }

    /// Drop a room opened only for replay, even though it is dirty
    fn discard(&self, room: &Arc<Room>) {
        self.rooms.remove_if(&room.doc_id, |_, current| {
            Arc::ptr_eq(current, room)
                && current.is_empty()
                && current.leases.load(Ordering::SeqCst) == 0
        });
    }

    pub fn rooms_info(&self) -> Vec<RoomInfo> {
        let mut rooms: Vec<RoomInfo> = self.rooms.iter().map(|entry| entry.info()).collect();
        rooms.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
        rooms
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_rooms: self.rooms.len(),
            connected_peers: self.rooms.iter().map(|r| r.peer_count()).sum(),
            pending_saves: self.outbox.as_ref().map(|o| o.len()).unwrap_or(0),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Start background tasks (autosave, cleanup, outbox replay)
    pub fn start_background_tasks(
        self: Arc<Self>,
        replay_interval: Duration,
    ) -> BackgroundTaskHandles {
        let registry = self.clone();
        let save_interval = registry.config.save_interval;

        // Save task
        let save_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(save_interval);
            let mut shutdown = registry.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let saved = registry.save_dirty_rooms().await;
                        if saved > 0 {
                            debug!(saved, "Autosaved rooms");
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Save task shutting down");
                        let saved = registry.save_dirty_rooms().await;
                        info!(saved, "Final save complete");
                        if let Some(outbox) = registry.outbox() {
                            if let Err(e) = outbox.flush() {
                                error!(error = %e, "Failed to flush outbox");
                            }
                        }
                        break;
                    }
                }
            }
        });

        let registry = self.clone();
        let cleanup_interval = registry.config.cleanup_interval;

        // Cleanup task
        let cleanup_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            let mut shutdown = registry.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let evicted = registry.cleanup();
                        if evicted > 0 {
                            debug!(evicted, "Idle rooms evicted");
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Cleanup task shutting down");
                        break;
                    }
                }
            }
        });

        let replay_handle = self.outbox.is_some().then(|| {
            let registry = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(replay_interval);
                let mut shutdown = registry.shutdown_receiver();

                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            registry.replay_outbox().await;
                        }
                        _ = shutdown.recv() => {
                            info!("Outbox replay task shutting down");
                            break;
                        }
                    }
                }
            })
        });

        BackgroundTaskHandles {
            save_task: save_handle,
            cleanup_task: cleanup_handle,
            replay_task: replay_handle,
        }
    }
}

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub save_task: tokio::task::JoinHandle<()>,
    pub cleanup_task: tokio::task::JoinHandle<()>,
    pub replay_task: Option<tokio::task::JoinHandle<()>>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = tokio::join!(self.save_task, self.cleanup_task);
        if let Some(replay) = self.replay_task {
            let _ = replay.await;
        }
    }
}

/// Pick a display color for a new peer
pub fn generate_peer_color() -> String {
    use rand::seq::SliceRandom;
    const COLORS: [&str; 12] = [
        "#3b82f6", // blue
        "#ef4444", // red
        "#22c55e", // green
        "#f59e0b", // amber
        "#8b5cf6", // violet
        "#ec4899", // pink
        "#06b6d4", // cyan
        "#f97316", // orange
        "#14b8a6", // teal
        "#84cc16", // lime
        "#6366f1", // indigo
        "#0ea5e9", // sky
    ];
    COLORS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(COLORS[0])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryStore;
    use automerge::{transaction::Transactable, AutoCommit, ReadDoc, ROOT};
    use futures_util::future::join_all;
    use tokio_test::assert_ok;

    type Inbox = mpsc::UnboundedReceiver<ServerMessage>;

    fn registry_with(store: &Arc<MemoryStore>, outbox: Option<SaveOutbox>) -> RoomRegistry {
        let pool = Arc::new(BackendPool::fixed(store.clone()));
        RoomRegistry::new(RoomConfig::default(), pool, outbox)
    }

    fn relay(registry: &RoomRegistry, doc_id: &str, username: &str) -> Arc<DocSyncRelay> {
        registry
            .relay_for(ConnectionParams::new(
                doc_id,
                Some(format!("token-{username}")),
                Some(username.to_string()),
            ))
            .unwrap()
    }

    async fn join(
        registry: &RoomRegistry,
        doc_id: &str,
        username: &str,
    ) -> (Arc<Room>, PeerInfo, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (room, peer) = registry
            .join(relay(registry, doc_id, username), tx)
            .await
            .unwrap();
        (room, peer, rx)
    }

    fn drain(rx: &mut Inbox) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            messages.push(msg);
        }
        messages
    }

    fn welcome_state(rx: &mut Inbox) -> (Vec<u8>, Option<String>) {
        match rx.try_recv().unwrap() {
            ServerMessage::Welcome {
                document_state,
                title,
                ..
            } => (document_state, title),
            other => panic!("expected welcome, got {other:?}"),
        }
    }

    /// Client-side edit on top of `state`, returned as a full save
    fn edit_title(state: &[u8], title: &str) -> Vec<u8> {
        let mut doc = RelayDocument::from_update(state).unwrap();
        doc.set_title(title).unwrap();
        doc.save()
    }

    fn titled_state(title: &str) -> Vec<u8> {
        edit_title(&[], title)
    }

    #[tokio::test]
    async fn test_first_joiner_loads_and_saves_title() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry_with(&store, None);

        let (room, peer, mut rx) = join(&registry, "abc", "ada").await;
        assert_eq!(store.fetch_count(), 1);
        assert!(room.is_loaded());
        assert_eq!(room.phase(), RoomPhase::Loaded);
        let (state, title) = welcome_state(&mut rx);
        assert_eq!(title, None);

        assert_ok!(room.apply_update(&peer.peer_id, &edit_title(&state, "Report 1")));
        assert!(room.is_dirty());
        assert!(assert_ok!(registry.flush("abc").await));

        let saved = store.last_save().unwrap();
        assert_eq!(saved.doc_id, "abc");
        assert_eq!(saved.doc_title.as_deref(), Some("Report 1"));
        assert_eq!(saved.username.as_deref(), Some("ada"));
        assert!(!room.is_dirty());
        assert!(matches!(
            drain(&mut rx).last(),
            Some(ServerMessage::Saved { doc_title: Some(t), .. }) if t == "Report 1"
        ));

        let stored = RelayDocument::from_update(&store.stored_state("abc").unwrap()).unwrap();
        assert_eq!(stored.title().as_deref(), Some("Report 1"));
    }

    #[tokio::test]
    async fn test_joiner_sees_stored_title_without_saving() {
        let store = Arc::new(MemoryStore::new());
        store.insert_state("doc-x", &titled_state("X"));
        let registry = registry_with(&store, None);

        let (room, _, mut rx) = join(&registry, "doc-x", "bob").await;
        let (_, title) = welcome_state(&mut rx);
        assert_eq!(title.as_deref(), Some("X"));
        assert_eq!(room.title().as_deref(), Some("X"));
        assert!(store.saves().is_empty());
        assert!(!room.is_dirty());
    }

    #[tokio::test]
    async fn test_concurrent_joiners_share_single_load() {
        let store = Arc::new(MemoryStore::new());
        store.insert_state("shared", &titled_state("Shared"));
        store.set_fetch_delay(Duration::from_millis(50));
        let registry = registry_with(&store, None);

        let joins = (0..8).map(|i| {
            let registry = &registry;
            async move { join(registry, "shared", &format!("peer-{i}")).await }
        });
        let joined = join_all(joins).await;

        assert_eq!(store.fetch_count(), 1);
        let first = &joined[0].0;
        for (room, _, _) in &joined {
            assert!(Arc::ptr_eq(room, first));
        }
        assert_eq!(first.peer_count(), 8);
        assert_eq!(first.title().as_deref(), Some("Shared"));
    }

    #[tokio::test]
    async fn test_fetch_failure_starts_empty_with_warning() {
        let store = Arc::new(MemoryStore::new());
        store.fail_fetches(true);
        let registry = registry_with(&store, None);

        let (room, peer, mut rx) = join(&registry, "abc", "ada").await;
        let (state, title) = welcome_state(&mut rx);
        assert!(RelayDocument::from_update(&state).unwrap().is_empty());
        assert_eq!(title, None);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::Warning { code: WarningCode::LoadFailed, .. }
        ));
        assert_eq!(room.info().warning, Some(WarningCode::LoadFailed));

        // Nothing was edited, so the empty document is never persisted
        registry.leave(&room, &peer.peer_id, None).await;
        assert_eq!(store.persist_attempts(), 0);
        assert!(registry.get("abc").is_none());
    }

    #[tokio::test]
    async fn test_save_after_failed_load_merges_stored_snapshot() {
        let store = Arc::new(MemoryStore::new());
        store.insert_state("abc", &titled_state("Stored"));
        store.fail_fetches(true);
        let registry = registry_with(&store, None);

        let (room, peer, mut rx) = join(&registry, "abc", "ada").await;
        let (state, _) = welcome_state(&mut rx);
        let mut edit = AutoCommit::load(&state).unwrap();
        edit.put(ROOT, "body", "hello").unwrap();
        assert_ok!(room.apply_update(&peer.peer_id, &edit.save()));

        // Still unreachable: nothing is written and the edit stays pending
        assert!(registry.flush("abc").await.is_err());
        assert_eq!(store.persist_attempts(), 0);
        assert!(room.is_dirty());

        store.fail_fetches(false);
        drain(&mut rx);
        assert!(assert_ok!(registry.flush("abc").await));

        let stored_state = store.stored_state("abc").unwrap();
        let stored = RelayDocument::from_update(&stored_state).unwrap();
        assert_eq!(stored.title().as_deref(), Some("Stored"));
        let raw = AutoCommit::load(&stored_state).unwrap();
        assert!(raw.get(ROOT, "body").unwrap().is_some());

        assert_eq!(room.title().as_deref(), Some("Stored"));
        assert_eq!(room.info().warning, None);
        assert!(drain(&mut rx)
            .iter()
            .any(|msg| matches!(msg, ServerMessage::Update { from_peer: None, .. })));
    }

    #[tokio::test]
    async fn test_updates_relay_to_other_peers_only() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry_with(&store, None);

        let (room, alice, mut alice_rx) = join(&registry, "abc", "alice").await;
        let (_, bob, mut bob_rx) = join(&registry, "abc", "bob").await;
        let (state, _) = welcome_state(&mut alice_rx);
        drain(&mut bob_rx);

        assert!(matches!(
            drain(&mut alice_rx).as_slice(),
            [ServerMessage::PeerJoined { peer }] if peer.peer_id == bob.peer_id
        ));

        let update = edit_title(&state, "Shared");
        room.apply_update(&alice.peer_id, &update).unwrap();

        assert!(drain(&mut alice_rx).is_empty());
        match drain(&mut bob_rx).as_slice() {
            [ServerMessage::Update { update: relayed, from_peer }] => {
                assert_eq!(relayed, &update);
                assert_eq!(from_peer.as_deref(), Some(alice.peer_id.as_str()));
            }
            other => panic!("unexpected messages: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_update_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry_with(&store, None);
        let (room, peer, _rx) = join(&registry, "abc", "ada").await;

        let err = room.apply_update(&peer.peer_id, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, RelayError::Document(_)));
        assert!(!room.is_dirty());

        let err = room.apply_update("stranger", &[]).unwrap_err();
        assert!(matches!(err, RelayError::PeerNotFound(_)));
    }

    #[tokio::test]
    async fn test_last_peer_leaving_saves_and_evicts() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry_with(&store, None);
        let (room, peer, mut rx) = join(&registry, "abc", "ada").await;
        let (state, _) = welcome_state(&mut rx);

        room.apply_update(&peer.peer_id, &edit_title(&state, "Bye"))
            .unwrap();
        registry.leave(&room, &peer.peer_id, Some("closed".into())).await;

        assert_eq!(store.last_save().unwrap().doc_title.as_deref(), Some("Bye"));
        assert!(registry.get("abc").is_none());
        assert_eq!(registry.stats().active_rooms, 0);
    }

    #[tokio::test]
    async fn test_save_credentials_hand_off_to_next_peer() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry_with(&store, None);

        let (room, ada, mut ada_rx) = join(&registry, "abc", "ada").await;
        let (_, bob, _bob_rx) = join(&registry, "abc", "bob").await;
        assert_eq!(room.save_identity().as_deref(), Some("ada"));

        let (state, _) = welcome_state(&mut ada_rx);
        room.apply_update(&ada.peer_id, &edit_title(&state, "v1"))
            .unwrap();
        registry.leave(&room, &ada.peer_id, None).await;
        assert_eq!(room.save_identity().as_deref(), Some("bob"));

        registry.flush("abc").await.unwrap();
        let saved = store.last_save().unwrap();
        assert_eq!(saved.username.as_deref(), Some("bob"));
        assert_eq!(saved.api_key.as_deref(), Some("token-bob"));

        // The empty room keeps the last relay for its final save
        let update = edit_title(&room.full_state().unwrap(), "v2");
        room.apply_update(&bob.peer_id, &update).unwrap();
        room.remove_peer(&bob.peer_id);
        assert_eq!(room.save_identity().as_deref(), Some("bob"));
        assert!(room.save(None, false).await.unwrap());
        assert_eq!(store.last_save().unwrap().doc_title.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_concurrent_saves_persist_once() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry_with(&store, None);
        let (room, peer, mut rx) = join(&registry, "abc", "ada").await;
        let (state, _) = welcome_state(&mut rx);
        room.apply_update(&peer.peer_id, &edit_title(&state, "Once"))
            .unwrap();

        let results = join_all((0..4).map(|_| room.save(None, false))).await;
        let written = results.into_iter().filter(|r| matches!(r, Ok(true))).count();
        assert_eq!(written, 1);
        assert_eq!(store.persist_attempts(), 1);
    }

    #[tokio::test]
    async fn test_failed_save_is_journaled_and_replayed() {
        let store = Arc::new(MemoryStore::new());
        let outbox = SaveOutbox::temporary().unwrap();
        let registry = registry_with(&store, Some(outbox.clone()));

        let (room, peer, mut rx) = join(&registry, "abc", "ada").await;
        let (state, _) = welcome_state(&mut rx);
        room.apply_update(&peer.peer_id, &edit_title(&state, "Offline"))
            .unwrap();

        store.fail_persists(true);
        let err = registry.flush("abc").await.unwrap_err();
        assert!(matches!(err, RelayError::SaveFailed { .. }));
        assert!(room.is_dirty());
        assert!(matches!(
            drain(&mut rx).last(),
            Some(ServerMessage::Warning { code: WarningCode::SaveFailed, .. })
        ));

        let pending = outbox.get("abc").unwrap().unwrap();
        assert_eq!(pending.doc_title.as_deref(), Some("Offline"));
        assert_eq!(pending.api_key.as_deref(), Some("token-ada"));

        // Peer disconnects while the backend is still down
        registry.leave(&room, &peer.peer_id, None).await;
        assert_eq!(registry.stats().pending_saves, 1);

        store.fail_persists(false);
        assert_eq!(registry.replay_outbox().await, 1);
        assert!(outbox.is_empty());
        assert_eq!(
            store.last_save().unwrap().doc_title.as_deref(),
            Some("Offline")
        );
        assert!(registry.get("abc").is_none());
    }

    #[tokio::test]
    async fn test_replay_merges_with_stored_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let outbox = SaveOutbox::temporary().unwrap();

        // Backend holds a snapshot edited elsewhere; the journal holds a
        // concurrent branch of the same document
        let mut base = RelayDocument::new();
        base.set_title("Base").unwrap();
        let mut branch = base.fork();
        branch.set_title("Journaled").unwrap();
        store.insert_state("abc", &base.save());
        outbox
            .stash(&PendingSave::new("abc", branch.save()).with_identity(Some("ada".into()), None))
            .unwrap();

        let registry = registry_with(&store, Some(outbox.clone()));
        assert_eq!(registry.replay_outbox().await, 1);
        assert!(outbox.is_empty());
        assert_eq!(store.fetch_count(), 1);

        let persisted = RelayDocument::from_update(&store.stored_state("abc").unwrap()).unwrap();
        assert_eq!(persisted.title().as_deref(), Some("Journaled"));
        assert_eq!(store.last_save().unwrap().username.as_deref(), Some("ada"));
    }

    #[tokio::test]
    async fn test_replay_keeps_entry_while_backend_is_down() {
        let store = Arc::new(MemoryStore::new());
        let outbox = SaveOutbox::temporary().unwrap();
        outbox
            .stash(&PendingSave::new("abc", titled_state("Kept")))
            .unwrap();
        store.fail_fetches(true);

        let registry = registry_with(&store, Some(outbox.clone()));
        assert_eq!(registry.replay_outbox().await, 0);
        assert_eq!(store.persist_attempts(), 0);
        assert_eq!(outbox.len(), 1);
        assert!(registry.get("abc").is_none());
    }

    #[tokio::test]
    async fn test_pending_save_is_merged_on_join() {
        let store = Arc::new(MemoryStore::new());
        let outbox = SaveOutbox::temporary().unwrap();
        outbox
            .stash(&PendingSave::new("abc", titled_state("Recovered")))
            .unwrap();
        let registry = registry_with(&store, Some(outbox));

        let (room, _, mut rx) = join(&registry, "abc", "ada").await;
        let (_, title) = welcome_state(&mut rx);
        assert_eq!(title.as_deref(), Some("Recovered"));
        assert!(room.is_dirty());

        assert_eq!(registry.save_dirty_rooms().await, 1);
        assert_eq!(registry.stats().pending_saves, 0);
    }

    #[tokio::test]
    async fn test_room_full() {
        let store = Arc::new(MemoryStore::new());
        let pool = Arc::new(BackendPool::fixed(store.clone()));
        let config = RoomConfig {
            max_peers_per_room: 1,
            ..RoomConfig::default()
        };
        let registry = RoomRegistry::new(config, pool, None);

        let _first = join(&registry, "abc", "ada").await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let Err(err) = registry.join(relay(&registry, "abc", "bob"), tx).await else {
            panic!("second peer should not fit in the room");
        };
        assert!(matches!(err, RelayError::RoomFull(_)));
        assert_eq!(registry.get("abc").unwrap().peer_count(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_dirty_rooms() {
        let store = Arc::new(MemoryStore::new());
        store.fail_persists(true);
        let registry = registry_with(&store, None);

        let (room, peer, mut rx) = join(&registry, "abc", "ada").await;
        let (state, _) = welcome_state(&mut rx);
        room.apply_update(&peer.peer_id, &edit_title(&state, "Unsaved"))
            .unwrap();
        registry.leave(&room, &peer.peer_id, None).await;

        assert_eq!(registry.cleanup(), 0);
        assert!(registry.get("abc").is_some());

        store.fail_persists(false);
        assert_eq!(registry.save_dirty_rooms().await, 1);
        assert_eq!(registry.cleanup(), 1);
        assert!(registry.rooms_info().is_empty());
    }

    #[tokio::test]
    async fn test_rooms_info() {
        let store = Arc::new(MemoryStore::new());
        store.insert_state("b-doc", &titled_state("Beta"));
        let registry = registry_with(&store, None);
        let _a = join(&registry, "a-doc", "ada").await;
        let _b = join(&registry, "b-doc", "bob").await;

        let rooms = registry.rooms_info();
        assert_eq!(rooms.len(), 2);
        assert_eq!(rooms[0].doc_id, "a-doc");
        assert_eq!(rooms[1].title.as_deref(), Some("Beta"));
        assert_eq!(rooms[1].phase, RoomPhase::Loaded);
        assert_eq!(registry.stats().connected_peers, 2);
    }

    #[test]
    fn test_generate_peer_color() {
        let color = generate_peer_color();
        assert!(color.starts_with('#'));
        assert_eq!(color.len(), 7);
    }
}
