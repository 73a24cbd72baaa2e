//! Load and save hooks binding one connection to the document backend.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::codec::{self, DOC_COLUMN};
use super::document::RelayDocument;
use super::params::ConnectionParams;
use super::protocol::WarningCode;
use super::{RelayError, RelayResult};
use crate::backend::{FetchRequest, SaveRequest, SnapshotStore};

/// Result of loading the stored snapshot of a document.
///
/// Loading never fails past this point: every outcome can be turned into a
/// document, empty when nothing usable was stored.
#[derive(Debug)]
pub enum LoadOutcome {
    /// The snapshot was decoded and applied
    Hydrated(RelayDocument),
    /// The backend has no snapshot for this document
    Empty,
    /// A snapshot exists but could not be decoded or applied
    Undecodable(String),
    /// The backend could not be reached in time
    Failed(String),
}

impl LoadOutcome {
    pub fn into_document(self) -> RelayDocument {
        match self {
            LoadOutcome::Hydrated(doc) => doc,
            _ => RelayDocument::new(),
        }
    }

    /// Warning to show peers of a room that loaded with this outcome
    pub fn warning(&self) -> Option<(WarningCode, String)> {
        match self {
            LoadOutcome::Undecodable(reason) => Some((
                WarningCode::SnapshotUndecodable,
                format!("stored snapshot could not be decoded, starting empty: {}", reason),
            )),
            LoadOutcome::Failed(reason) => Some((
                WarningCode::LoadFailed,
                format!("stored snapshot could not be fetched, starting empty: {}", reason),
            )),
            LoadOutcome::Hydrated(_) | LoadOutcome::Empty => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            LoadOutcome::Hydrated(_) => "hydrated",
            LoadOutcome::Empty => "empty",
            LoadOutcome::Undecodable(_) => "undecodable",
            LoadOutcome::Failed(_) => "failed",
        }
    }
}

/// Full serialized state of a document plus its title at capture time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocSnapshot {
    pub state: Vec<u8>,
    pub title: Option<String>,
}

impl DocSnapshot {
    pub fn capture(doc: &mut RelayDocument) -> Self {
        Self {
            state: doc.save(),
            title: doc.title(),
        }
    }
}

/// Per-connection bridge between a room and the backend.
///
/// Carries the parameters of the connection that created it, so loads and
/// saves are made with that connection's credentials.
pub struct DocSyncRelay {
    params: ConnectionParams,
    store: Arc<dyn SnapshotStore>,
    load_timeout: Duration,
}

impl DocSyncRelay {
    pub fn new(
        params: ConnectionParams,
        store: Arc<dyn SnapshotStore>,
        load_timeout: Duration,
    ) -> Self {
        Self {
            params,
            store,
            load_timeout,
        }
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    pub fn doc_id(&self) -> &str {
        self.params.doc_id()
    }

    pub fn fetch_request(&self) -> FetchRequest {
        FetchRequest {
            api_key: self.params.api_token().map(str::to_string),
            doc_id: self.params.doc_id().to_string(),
            col_name: DOC_COLUMN.to_string(),
            username: self.params.username().map(str::to_string),
        }
    }

    pub fn save_request(&self, snapshot: &DocSnapshot) -> RelayResult<SaveRequest> {
        Ok(SaveRequest::new(
            self.params.doc_id(),
            &snapshot.state,
            snapshot.title.clone(),
            self.params.username().map(str::to_string),
            self.params.api_token().map(str::to_string),
        )?)
    }

    /// Fetch and decode the stored snapshot
    pub async fn load(&self) -> LoadOutcome {
        let doc_id = self.params.doc_id();
        let request = self.fetch_request();

        let response =
            match tokio::time::timeout(self.load_timeout, self.store.fetch_snapshot(&request)).await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    error!(
                        doc_id,
                        token = %self.params.token_fingerprint(),
                        error = %e,
                        "Snapshot fetch failed"
                    );
                    return LoadOutcome::Failed(e.to_string());
                }
                Err(_) => {
                    error!(
                        doc_id,
                        timeout_ms = self.load_timeout.as_millis() as u64,
                        "Snapshot fetch timed out"
                    );
                    return LoadOutcome::Failed(format!(
                        "timed out after {}ms",
                        self.load_timeout.as_millis()
                    ));
                }
            };

        let Some(encoded) = codec::non_blank(response.doc_uint8()) else {
            info!(doc_id, "No stored snapshot, starting empty document");
            return LoadOutcome::Empty;
        };

        let outcome = codec::decode_doc_bytes(encoded)
            .map_err(RelayError::from)
            .and_then(|bytes| Ok(RelayDocument::from_update(&bytes)?));

        match outcome {
            Ok(doc) => {
                debug!(doc_id, bytes = encoded.len(), "Snapshot hydrated");
                LoadOutcome::Hydrated(doc)
            }
            Err(e) => {
                warn!(doc_id, error = %e, "Stored snapshot is undecodable, starting empty document");
                LoadOutcome::Undecodable(e.to_string())
            }
        }
    }

    /// Persist a captured document state
    pub async fn save(&self, snapshot: &DocSnapshot) -> RelayResult<()> {
        let doc_id = self.params.doc_id();
        let request = self.save_request(snapshot)?;

        match self.store.persist(&request).await {
            Ok(()) => {
                info!(
                    doc_id,
                    title = request.doc_title.as_deref().unwrap_or(""),
                    bytes = snapshot.state.len(),
                    "Document saved"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    doc_id,
                    token = %self.params.token_fingerprint(),
                    error = %e,
                    "Document save failed"
                );
                Err(RelayError::SaveFailed {
                    doc_id: doc_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

impl std::fmt::Debug for DocSyncRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocSyncRelay")
            .field("doc_id", &self.params.doc_id())
            .field("username", &self.params.username())
            .field("load_timeout", &self.load_timeout)
            .finish_non_exhaustive()
    }
}
