//! Peer protocol spoken over the relay WebSocket.
//!
//! Binary frames carry a bincode payload behind a 5-byte header:
//! `[version u8][type u8][payload length u24 BE]`. Document updates travel as
//! raw Automerge bytes inside the payload. Clients without a binary codec may
//! send the same messages as JSON text frames instead.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use super::{DocId, PeerId};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum frame size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

/// Message type identifiers carried in the frame header
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Connection
    Welcome = 0x02,
    Goodbye = 0x03,
    Error = 0x04,
    Warning = 0x05,

    // Document
    SyncRequest = 0x10,
    Update = 0x11,
    Saved = 0x12,

    // Membership
    PeerJoined = 0x22,
    PeerLeft = 0x23,

    // Keepalive
    Ping = 0xF0,
    Pong = 0xF1,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x02 => Ok(MessageType::Welcome),
            0x03 => Ok(MessageType::Goodbye),
            0x04 => Ok(MessageType::Error),
            0x05 => Ok(MessageType::Warning),
            0x10 => Ok(MessageType::SyncRequest),
            0x11 => Ok(MessageType::Update),
            0x12 => Ok(MessageType::Saved),
            0x22 => Ok(MessageType::PeerJoined),
            0x23 => Ok(MessageType::PeerLeft),
            0xF0 => Ok(MessageType::Ping),
            0xF1 => Ok(MessageType::Pong),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

/// Messages sent from a peer to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// CRDT update (incremental changes or a full save) to merge and relay
    Update { update: Vec<u8> },

    /// Ask for the full current document state
    SyncRequest,

    /// Keepalive
    Ping { timestamp: u64 },

    /// Graceful disconnect
    Goodbye { reason: Option<String> },
}

impl ClientMessage {
    fn message_type(&self) -> MessageType {
        match self {
            ClientMessage::Update { .. } => MessageType::Update,
            ClientMessage::SyncRequest => MessageType::SyncRequest,
            ClientMessage::Ping { .. } => MessageType::Ping,
            ClientMessage::Goodbye { .. } => MessageType::Goodbye,
        }
    }
}

/// Messages sent from the relay to a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// First message after joining a room
    Welcome {
        protocol_version: u8,
        peer_id: PeerId,
        doc_id: DocId,
        color: String,
        /// Full document state (Automerge binary)
        document_state: Vec<u8>,
        title: Option<String>,
        /// Other peers already in the room
        peers: Vec<PeerInfo>,
    },

    /// CRDT update relayed from another peer, or the full state when
    /// `from_peer` is `None`
    Update {
        update: Vec<u8>,
        from_peer: Option<PeerId>,
    },

    PeerJoined { peer: PeerInfo },

    PeerLeft {
        peer_id: PeerId,
        reason: Option<String>,
    },

    /// The document was persisted to the backend
    Saved {
        doc_title: Option<String>,
        saved_at: i64,
    },

    /// Degraded but non-fatal condition in the room
    Warning { code: WarningCode, message: String },

    Error { code: ErrorCode, message: String },

    Pong { timestamp: u64, server_time: i64 },
}

impl ServerMessage {
    fn message_type(&self) -> MessageType {
        match self {
            ServerMessage::Welcome { .. } => MessageType::Welcome,
            ServerMessage::Update { .. } => MessageType::Update,
            ServerMessage::PeerJoined { .. } => MessageType::PeerJoined,
            ServerMessage::PeerLeft { .. } => MessageType::PeerLeft,
            ServerMessage::Saved { .. } => MessageType::Saved,
            ServerMessage::Warning { .. } => MessageType::Warning,
            ServerMessage::Error { .. } => MessageType::Error,
            ServerMessage::Pong { .. } => MessageType::Pong,
        }
    }
}

/// Information about a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub username: String,
    pub color: String,
    pub joined_at: i64,
}

/// Error codes for relay responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0,
    InvalidMessage = 1,
    InvalidUpdate = 2,
    VersionMismatch = 3,
    RoomFull = 4,
    ServerError = 5,
}

/// Warning codes for degraded room conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum WarningCode {
    /// The stored snapshot could not be fetched; the room started empty
    LoadFailed = 1,
    /// The stored snapshot could not be decoded; the room started empty
    SnapshotUndecodable = 2,
    /// The document could not be persisted; it stays pending
    SaveFailed = 3,
}

/// Protocol codec for encoding/decoding messages
pub struct SyncProtocol;

impl SyncProtocol {
    /// Encode a client message to a binary frame
    pub fn encode_client(msg: &ClientMessage) -> Result<Bytes, ProtocolError> {
        frame(msg.message_type(), &bincode::serialize(msg)?)
    }

    /// Encode a server message to a binary frame
    pub fn encode_server(msg: &ServerMessage) -> Result<Bytes, ProtocolError> {
        frame(msg.message_type(), &bincode::serialize(msg)?)
    }

    /// Decode a client message from a binary frame
    pub fn decode_client(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
        let (msg_type, payload) = unframe(data)?;
        let msg: ClientMessage = bincode::deserialize(payload)?;
        check_type(msg_type, msg.message_type())?;
        Ok(msg)
    }

    /// Decode a server message from a binary frame
    pub fn decode_server(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
        let (msg_type, payload) = unframe(data)?;
        let msg: ServerMessage = bincode::deserialize(payload)?;
        check_type(msg_type, msg.message_type())?;
        Ok(msg)
    }

    /// Decode a client message from a JSON text frame
    pub fn decode_client_json(text: &str) -> Result<ClientMessage, ProtocolError> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(text.len(), MAX_MESSAGE_SIZE));
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Encode a server message as a JSON text frame
    pub fn encode_server_json(msg: &ServerMessage) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(msg)?)
    }

    /// Create an error response message
    pub fn error_response(code: ErrorCode, message: impl Into<String>) -> ServerMessage {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }
}

fn frame(msg_type: MessageType, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    if payload.len() + HEADER_LEN > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(
            payload.len() + HEADER_LEN,
            MAX_MESSAGE_SIZE,
        ));
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(msg_type as u8);
    buf.put_uint(payload.len() as u64, 3);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

fn unframe(data: &[u8]) -> Result<(MessageType, &[u8]), ProtocolError> {
    if data.len() < HEADER_LEN {
        return Err(ProtocolError::InvalidFormat(
            "Message too short".to_string(),
        ));
    }

    let mut cursor = Cursor::new(data);

    let version = cursor.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
    }

    let msg_type = MessageType::try_from(cursor.get_u8())?;
    let payload_len = cursor.get_uint(3) as usize;

    if data.len() != HEADER_LEN + payload_len {
        return Err(ProtocolError::InvalidFormat(format!(
            "Expected {} bytes, got {}",
            HEADER_LEN + payload_len,
            data.len()
        )));
    }

    Ok((msg_type, &data[HEADER_LEN..]))
}

fn check_type(header: MessageType, decoded: MessageType) -> Result<(), ProtocolError> {
    if header != decoded {
        return Err(ProtocolError::InvalidFormat(format!(
            "Header announces {:?} but payload is {:?}",
            header, decoded
        )));
    }
    Ok(())
}
