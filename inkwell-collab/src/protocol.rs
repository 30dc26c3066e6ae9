//! Wire protocol between participants and the collaboration server.
//!
//! Two framings carry the same messages:
//! - WebSocket binary frames: bincode (compact, native clients)
//! - WebSocket text frames: JSON (browser clients)
//!
//! A connection is answered in the framing of its first message.
//!
//! ```text
//! client                                   server
//!   │── Join {document_id, user} ─────────────►│
//!   │◄──────────── State {content, version, …} │──► ParticipantJoined (others)
//!   │── Operation {op, base_version} ─────────►│
//!   │◄──────── Operation {op', version, user}  │──► Operation (everyone)
//!   │── Cursor / Selection ───────────────────►│──► Cursor / Selection (others)
//!   │◄──────────────────────── Rejected {…}    │    (originator only)
//! ```

use inkwell_ot::Operation;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::{CursorPosition, ParticipantInfo, SelectionRange};
use crate::store::DocumentMetadata;

/// Transport-assigned identity of one participant socket.
pub type ConnectionId = Uuid;

/// Opaque identifier of a shared document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Verified identity supplied on join. Authentication happens upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
}

impl UserInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Framing used on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Binary,
    Json,
}

/// Messages sent by participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        document_id: DocumentId,
        user: UserInfo,
    },
    /// `base_version` is signed on the wire so that a negative base is
    /// reported as a stale base rather than a decode failure.
    Operation {
        document_id: DocumentId,
        operation: Operation,
        base_version: i64,
    },
    Cursor {
        document_id: DocumentId,
        position: CursorPosition,
    },
    Selection {
        document_id: DocumentId,
        range: SelectionRange,
    },
    Leave {
        document_id: DocumentId,
    },
    Ping,
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerEvent {
    /// Synchronization baseline for a joining participant.
    State {
        document_id: DocumentId,
        content: String,
        version: u64,
        metadata: DocumentMetadata,
        participants: Vec<ParticipantInfo>,
    },
    ParticipantJoined {
        document_id: DocumentId,
        participant: ParticipantInfo,
    },
    ParticipantLeft {
        document_id: DocumentId,
        connection_id: ConnectionId,
    },
    /// Server-transformed operation; every replica applies exactly this.
    Operation {
        document_id: DocumentId,
        operation: Operation,
        version: u64,
        user_id: String,
    },
    Cursor {
        document_id: DocumentId,
        connection_id: ConnectionId,
        position: CursorPosition,
    },
    Selection {
        document_id: DocumentId,
        connection_id: ConnectionId,
        range: SelectionRange,
    },
    Saved {
        document_id: DocumentId,
        version: u64,
    },
    /// Negative acknowledgement, sent to the originator only.
    Rejected {
        document_id: Option<DocumentId>,
        reason: String,
        current_version: Option<u64>,
    },
    Pong,
}

impl ClientMessage {
    pub fn document_id(&self) -> Option<&DocumentId> {
        match self {
            ClientMessage::Join { document_id, .. }
            | ClientMessage::Operation { document_id, .. }
            | ClientMessage::Cursor { document_id, .. }
            | ClientMessage::Selection { document_id, .. }
            | ClientMessage::Leave { document_id } => Some(document_id),
            ClientMessage::Ping => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_binary(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_binary(bytes)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

impl ServerEvent {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_binary(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_binary(bytes)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Short event name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::State { .. } => "state",
            ServerEvent::ParticipantJoined { .. } => "participant-joined",
            ServerEvent::ParticipantLeft { .. } => "participant-left",
            ServerEvent::Operation { .. } => "operation",
            ServerEvent::Cursor { .. } => "cursor",
            ServerEvent::Selection { .. } => "selection",
            ServerEvent::Saved { .. } => "saved",
            ServerEvent::Rejected { .. } => "rejected",
            ServerEvent::Pong => "pong",
        }
    }
}

fn encode_binary<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_binary<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessage(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessage(e) => write!(f, "Invalid message: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
