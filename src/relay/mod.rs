//! Document relay: rooms of peers sharing one CRDT document per `doc_id`.
//!
//! This module implements the relay logic:
//! - Connection parameters parsed from the handshake URI
//! - Load/save hooks bridging a room and the document backend
//! - Rooms with single-load semantics, broadcast and serialized saves
//! - Binary/JSON peer protocol

pub mod codec;
pub mod document;
pub mod hooks;
pub mod params;
pub mod protocol;
pub mod room;

pub use params::ConnectionParams;
pub use room::RoomRegistry;

use thiserror::Error;

use crate::backend::BackendError;
use crate::storage::OutboxError;

/// Identifier of a relayed document (and of its room)
pub type DocId = String;

/// Unique identifier for a connected peer
pub type PeerId = String;

pub type RelayResult<T> = Result<T, RelayError>;

/// Errors that can occur while relaying a document
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("missing doc_id query parameter")]
    MissingDocId,

    #[error("Invalid connection parameters: {0}")]
    InvalidParams(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Snapshot encoding error: {0}")]
    Codec(#[from] codec::CodecError),

    #[error("Document error: {0}")]
    Document(#[from] document::DocumentError),

    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("Saving document {doc_id} failed: {reason}")]
    SaveFailed { doc_id: DocId, reason: String },

    #[error("Room is full: {0}")]
    RoomFull(DocId),

    #[error("Room not found: {0}")]
    RoomNotFound(DocId),

    #[error("Room {0} has not finished loading")]
    RoomNotLoaded(DocId),

    #[error("No connection credentials available to save document {0}")]
    NoSaveRelay(DocId),

    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),
}
