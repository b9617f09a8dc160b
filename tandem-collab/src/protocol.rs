//! Binary protocol for operation synchronization.
//!
//! Frame layout (bincode):
//! ```text
//! ┌──────────┬───────────┬────────────┬───────────┬──────────┐
//! │ msg_type │ sender    │ project_id │ file_id   │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes   │ 16 bytes  │ variable │
//! └──────────┴───────────┴────────────┴───────────┴──────────┘
//! ```
//!
//! Performance target: serialization < 500ns for a typical operation.
//! Reference: Kleppmann, Chapter 4 (Encoding and Evolution)

use serde::{Deserialize, Serialize};
use tandem_ot::Operation;
use uuid::Uuid;

use crate::presence::CursorPosition;

/// Discriminant for [`SyncMessage`] payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Text operation from a client, or its relayed form from the server
    Operation = 1,
    /// Server acknowledgment of one applied operation
    OperationAck = 2,
    /// Cursor/selection presence update
    CursorPosition = 3,
    /// Authoritative file snapshot (late join or resync)
    FileChange = 4,
    /// Comment posted on a file
    CommentAdded = 5,
    /// User joined notification
    UserJoined = 6,
    /// User left notification
    UserLeft = 7,
    /// Keep-alive probe
    Ping = 8,
    /// Keep-alive answer
    Pong = 9,
}

/// User identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub user_id: Uuid,
    pub name: String,
}

impl Participant {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            name: name.into(),
        }
    }

    /// Create with explicit user_id (for testing and stored identities)
    pub fn with_id(user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
        }
    }
}

/// Authoritative copy of one file, sent to late joiners and to clients
/// the server could not reconcile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileSnapshot {
    pub file_id: Uuid,
    pub name: String,
    pub content: String,
    pub revision: u64,
    /// Unix milliseconds of the last applied operation
    pub updated_at: u64,
}

/// Notification that a comment was posted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommentNotice {
    pub comment_id: Uuid,
    pub file_id: Uuid,
    pub author: Uuid,
    pub body: String,
}

/// The envelope every frame travels in.
///
/// bincode-encoded as a whole; a typical Operation frame is a
/// 49-byte header plus the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Originating user, or nil when the server itself speaks
    pub sender: Uuid,
    pub project_id: Uuid,
    /// File the message concerns, nil for room-level messages
    pub file_id: Uuid,
    /// Interpreted per `msg_type`
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Create an operation message.
    pub fn operation(sender: Uuid, project_id: Uuid, file_id: Uuid, op: &Operation) -> Self {
        let payload = bincode::serde::encode_to_vec(op, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::Operation,
            sender,
            project_id,
            file_id,
            payload,
        }
    }

    /// Create an acknowledgment for one applied operation.
    pub fn operation_ack(project_id: Uuid, file_id: Uuid, op_id: Uuid) -> Self {
        let payload = bincode::serde::encode_to_vec(op_id, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::OperationAck,
            sender: Uuid::nil(),
            project_id,
            file_id,
            payload,
        }
    }

    /// Create a cursor presence update.
    pub fn cursor(sender: Uuid, project_id: Uuid, position: &CursorPosition) -> Self {
        let payload = bincode::serde::encode_to_vec(position, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::CursorPosition,
            sender,
            project_id,
            file_id: position.file_id,
            payload,
        }
    }

    /// Create a file snapshot message.
    pub fn file_change(project_id: Uuid, snapshot: &FileSnapshot) -> Self {
        let payload = bincode::serde::encode_to_vec(snapshot, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::FileChange,
            sender: Uuid::nil(),
            project_id,
            file_id: snapshot.file_id,
            payload,
        }
    }

    /// Create a comment notification.
    pub fn comment_added(sender: Uuid, project_id: Uuid, notice: &CommentNotice) -> Self {
        let payload = bincode::serde::encode_to_vec(notice, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::CommentAdded,
            sender,
            project_id,
            file_id: notice.file_id,
            payload,
        }
    }

    /// Create a user joined notification.
    pub fn user_joined(sender: Uuid, project_id: Uuid, participant: &Participant) -> Self {
        let payload = bincode::serde::encode_to_vec(participant, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::UserJoined,
            sender,
            project_id,
            file_id: Uuid::nil(),
            payload,
        }
    }

    /// Create a user left notification.
    pub fn user_left(sender: Uuid, project_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::UserLeft,
            sender,
            project_id,
            file_id: Uuid::nil(),
            payload: Vec::new(),
        }
    }

    /// Keep-alive probe.
    pub fn ping(sender: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            sender,
            project_id: Uuid::nil(),
            file_id: Uuid::nil(),
            payload: Vec::new(),
        }
    }

    /// Answer to a ping.
    pub fn pong(sender: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            sender,
            project_id: Uuid::nil(),
            file_id: Uuid::nil(),
            payload: Vec::new(),
        }
    }

    /// Encode for the socket.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decode a frame received off the socket.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse operation payload.
    pub fn operation_payload(&self) -> Result<Operation, ProtocolError> {
        if self.msg_type != MessageType::Operation {
            return Err(ProtocolError::UnexpectedType);
        }
        let (op, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(op)
    }

    /// Parse the acknowledged operation id.
    pub fn ack_id(&self) -> Result<Uuid, ProtocolError> {
        if self.msg_type != MessageType::OperationAck {
            return Err(ProtocolError::UnexpectedType);
        }
        let (id, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(id)
    }

    /// Parse cursor payload.
    pub fn cursor_payload(&self) -> Result<CursorPosition, ProtocolError> {
        if self.msg_type != MessageType::CursorPosition {
            return Err(ProtocolError::UnexpectedType);
        }
        let (pos, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(pos)
    }

    /// Parse file snapshot payload.
    pub fn file_snapshot(&self) -> Result<FileSnapshot, ProtocolError> {
        if self.msg_type != MessageType::FileChange {
            return Err(ProtocolError::UnexpectedType);
        }
        let (snap, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(snap)
    }

    /// Parse comment payload.
    pub fn comment(&self) -> Result<CommentNotice, ProtocolError> {
        if self.msg_type != MessageType::CommentAdded {
            return Err(ProtocolError::UnexpectedType);
        }
        let (notice, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(notice)
    }

    /// Parse participant payload.
    pub fn participant(&self) -> Result<Participant, ProtocolError> {
        if self.msg_type != MessageType::UserJoined {
            return Err(ProtocolError::UnexpectedType);
        }
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(info)
    }
}

/// Failures in encoding, decoding, or transporting frames.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    UnexpectedType,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedType => write!(f, "Unexpected message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
