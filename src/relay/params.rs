//! Connection parameters carried by the WebSocket handshake URI.

use axum::extract::Query;
use axum::http::Uri;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{DocId, RelayError, RelayResult};

#[derive(Debug, Deserialize)]
struct RawParams {
    doc_id: Option<String>,
    api_token: Option<String>,
    username: Option<String>,
}

/// Identity and document parameters of one connection.
///
/// Parsed once from the query string of the handshake request; fields are
/// private so the parameters cannot change after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    doc_id: DocId,
    api_token: Option<String>,
    username: Option<String>,
}

impl ConnectionParams {
    /// Parse from the full handshake URI (path and query)
    pub fn from_uri(uri: &Uri) -> RelayResult<Self> {
        let Query(raw) = Query::<RawParams>::try_from_uri(uri)
            .map_err(|e| RelayError::InvalidParams(e.body_text()))?;

        let doc_id = raw
            .doc_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or(RelayError::MissingDocId)?;

        Ok(Self {
            doc_id,
            api_token: raw.api_token,
            username: raw.username,
        })
    }

    pub fn new(
        doc_id: impl Into<String>,
        api_token: Option<String>,
        username: Option<String>,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            api_token,
            username,
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn api_token(&self) -> Option<&str> {
        self.api_token.as_deref()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Name shown to other peers
    pub fn display_name(&self) -> &str {
        self.username
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or("Anonymous")
    }

    /// Short, non-reversible token identifier safe to put in logs
    pub fn token_fingerprint(&self) -> String {
        match self.api_token.as_deref() {
            Some(token) if !token.is_empty() => {
                let digest = Sha256::digest(token.as_bytes());
                hex::encode(&digest[..4])
            }
            _ => "none".to_string(),
        }
    }
}
