//! Document backend: the remote HTTP store that owns persisted snapshots.
//!
//! The relay only ever talks to the backend through the [`SnapshotStore`]
//! trait. [`HttpBackend`] is the production implementation; [`BackendPool`]
//! decides whether connections share one client or get their own.

mod http;
#[cfg(test)]
pub mod memory;
mod pool;

pub use http::HttpBackend;
pub use pool::BackendPool;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::relay::codec::{self, CodecResult};

/// Errors returned by a snapshot store
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("HTTP client setup failed: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Backend returned HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    /// Whether repeating the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Transport { .. } | BackendError::Unavailable(_) => true,
            BackendError::Status { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            BackendError::Client(_) | BackendError::InvalidResponse(_) => false,
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Body of the snapshot-fetch call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub doc_id: String,
    pub col_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Response of the snapshot-fetch call: `{ doc_data: { doc_uint8 } }`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchResponse {
    #[serde(default)]
    pub doc_data: Option<DocData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocData {
    #[serde(default)]
    pub doc_uint8: Option<String>,
}

impl FetchResponse {
    /// Response describing a stored snapshot
    pub fn with_snapshot(doc_uint8: impl Into<String>) -> Self {
        Self {
            doc_data: Some(DocData {
                doc_uint8: Some(doc_uint8.into()),
            }),
        }
    }

    pub fn doc_uint8(&self) -> Option<&str> {
        self.doc_data.as_ref()?.doc_uint8.as_deref()
    }
}

/// Body of the persistence call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveRequest {
    pub doc_uint8: String,
    pub doc_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl SaveRequest {
    /// Build a persistence body from raw document bytes
    pub fn new(
        doc_id: impl Into<String>,
        state: &[u8],
        doc_title: Option<String>,
        username: Option<String>,
        api_key: Option<String>,
    ) -> CodecResult<Self> {
        Ok(Self {
            doc_uint8: codec::encode_doc_bytes(state)?,
            doc_id: doc_id.into(),
            doc_title,
            username,
            api_key,
        })
    }
}

/// Remote store of persisted document snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Fetch the stored snapshot for a document
    async fn fetch_snapshot(&self, request: &FetchRequest) -> BackendResult<FetchResponse>;

    /// Persist a serialized document
    async fn persist(&self, request: &SaveRequest) -> BackendResult<()>;
}
