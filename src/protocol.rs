//! Wire protocol: storage operations and the binary message envelope.
//!
//! Frame format (bincode-encoded):
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ doc_id   │ actor    │ seq      │ payload  │
//! │ 1 byte   │ 16 bytes │ 4 bytes  │ 8 bytes  │ variable │
//! └──────────┴──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! The payload is a JSON-encoded body (presence objects and storage ops
//! carry arbitrary JSON, which a non-self-describing format cannot hold
//! directly). Ops must survive a full JSON round-trip so that replaying
//! a serialized op log against an empty document reconstructs the tree.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Identifier of a node in the replicated tree (assigned at attach time).
pub type NodeId = String;

/// Identifier of a single operation, used for ack matching.
pub type OpId = String;

/// Numeric identifier of a live peer session. Distinct from the stable
/// user id: one user may hold several connections.
pub type ConnectionId = u32;

/// A JSON object, the shape of presence data and object fields.
pub type JsonObject = serde_json::Map<String, Value>;

// ───────────────────────────────────────────────────────────────────
// Storage operations
// ───────────────────────────────────────────────────────────────────

/// Where an applied op came from. Only locally-originated ops record
/// their reverse ops on the undo stack; remote, ack, and undo/redo
/// replays must not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpSource {
    Local,
    Remote,
    Ack,
    UndoRedo,
}

impl OpSource {
    pub fn is_local(self) -> bool {
        matches!(self, OpSource::Local)
    }
}

/// A storage mutation. Every applied op yields either a reverse op
/// sequence sufficient to undo it, or an explicit no-op result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    CreateObject {
        id: NodeId,
        op_id: OpId,
        parent_id: NodeId,
        parent_key: String,
        data: JsonObject,
    },
    CreateList {
        id: NodeId,
        op_id: OpId,
        parent_id: NodeId,
        parent_key: String,
    },
    CreateMap {
        id: NodeId,
        op_id: OpId,
        parent_id: NodeId,
        parent_key: String,
    },
    CreateRegister {
        id: NodeId,
        op_id: OpId,
        parent_id: NodeId,
        parent_key: String,
        data: Value,
    },
    /// Set plain JSON fields on a LiveObject.
    UpdateObject {
        id: NodeId,
        op_id: OpId,
        data: JsonObject,
    },
    /// Remove a single field from a LiveObject.
    DeleteObjectKey {
        id: NodeId,
        op_id: OpId,
        key: String,
    },
    /// Reposition a list child (its parent key is its position).
    SetParentKey {
        id: NodeId,
        op_id: OpId,
        parent_key: String,
    },
    /// Delete a node (and its subtree) from the tree.
    DeleteCrdt { id: NodeId, op_id: OpId },
}

impl Op {
    /// The node this op targets.
    pub fn target_id(&self) -> &str {
        match self {
            Op::CreateObject { id, .. }
            | Op::CreateList { id, .. }
            | Op::CreateMap { id, .. }
            | Op::CreateRegister { id, .. }
            | Op::UpdateObject { id, .. }
            | Op::DeleteObjectKey { id, .. }
            | Op::SetParentKey { id, .. }
            | Op::DeleteCrdt { id, .. } => id,
        }
    }

    pub fn op_id(&self) -> &str {
        match self {
            Op::CreateObject { op_id, .. }
            | Op::CreateList { op_id, .. }
            | Op::CreateMap { op_id, .. }
            | Op::CreateRegister { op_id, .. }
            | Op::UpdateObject { op_id, .. }
            | Op::DeleteObjectKey { op_id, .. }
            | Op::SetParentKey { op_id, .. }
            | Op::DeleteCrdt { op_id, .. } => op_id,
        }
    }
}

/// Persisted representation of a single node, as stored by the server.
/// The parent fields are absent on the root object only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SerializedNode {
    Object {
        parent_id: Option<NodeId>,
        parent_key: Option<String>,
        data: JsonObject,
    },
    List {
        parent_id: Option<NodeId>,
        parent_key: Option<String>,
    },
    Map {
        parent_id: Option<NodeId>,
        parent_key: Option<String>,
    },
    Register {
        parent_id: Option<NodeId>,
        parent_key: Option<String>,
        data: Value,
    },
}

// ───────────────────────────────────────────────────────────────────
// Message bodies (JSON-encoded payloads)
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceBody {
    pub data: JsonObject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageOpsBody {
    /// Connection that originated these ops; `None` for server-side edits.
    pub origin: Option<ConnectionId>,
    pub ops: Vec<Op>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionBody {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub user_info: Option<Value>,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckBody {
    pub op_ids: Vec<OpId>,
}

// ───────────────────────────────────────────────────────────────────
// Frame envelope
// ───────────────────────────────────────────────────────────────────

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Full presence snapshot for one connection
    PresenceFull = 1,
    /// Incremental presence patch for one connection
    PresencePatch = 2,
    /// Storage operations (client → server and fan-out back)
    StorageOps = 3,
    /// Server acknowledgement of applied op ids
    StorageAck = 4,
    /// A connection joined the document
    ConnectionJoined = 5,
    /// A connection left the document
    ConnectionLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// Top-level protocol message.
///
/// The envelope is bincode; the payload is JSON (see module docs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub msg_type: MessageType,
    pub doc_id: Uuid,
    /// Connection the message is from (or about, for server fan-out).
    pub actor: ConnectionId,
    /// Per-sender monotonic sequence number.
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    fn with_json_payload<T: Serialize>(
        msg_type: MessageType,
        doc_id: Uuid,
        actor: ConnectionId,
        seq: u64,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_vec(body).map_err(|e| ProtocolError::Serialize(e.to_string()))?;
        Ok(Self { msg_type, doc_id, actor, seq, payload })
    }

    pub fn presence_full(
        doc_id: Uuid,
        actor: ConnectionId,
        seq: u64,
        data: &JsonObject,
    ) -> Result<Self, ProtocolError> {
        Self::with_json_payload(
            MessageType::PresenceFull,
            doc_id,
            actor,
            seq,
            &PresenceBody { data: data.clone() },
        )
    }

    pub fn presence_patch(
        doc_id: Uuid,
        actor: ConnectionId,
        seq: u64,
        data: &JsonObject,
    ) -> Result<Self, ProtocolError> {
        Self::with_json_payload(
            MessageType::PresencePatch,
            doc_id,
            actor,
            seq,
            &PresenceBody { data: data.clone() },
        )
    }

    pub fn storage_ops(
        doc_id: Uuid,
        actor: ConnectionId,
        seq: u64,
        body: &StorageOpsBody,
    ) -> Result<Self, ProtocolError> {
        Self::with_json_payload(MessageType::StorageOps, doc_id, actor, seq, body)
    }

    pub fn storage_ack(
        doc_id: Uuid,
        actor: ConnectionId,
        seq: u64,
        body: &AckBody,
    ) -> Result<Self, ProtocolError> {
        Self::with_json_payload(MessageType::StorageAck, doc_id, actor, seq, body)
    }

    pub fn connection_joined(
        doc_id: Uuid,
        seq: u64,
        body: &ConnectionBody,
    ) -> Result<Self, ProtocolError> {
        Self::with_json_payload(MessageType::ConnectionJoined, doc_id, body.connection_id, seq, body)
    }

    pub fn connection_left(
        doc_id: Uuid,
        actor: ConnectionId,
        seq: u64,
    ) -> Result<Self, ProtocolError> {
        Ok(Self { msg_type: MessageType::ConnectionLeft, doc_id, actor, seq, payload: Vec::new() })
    }

    pub fn ping(doc_id: Uuid, actor: ConnectionId) -> Self {
        Self { msg_type: MessageType::Ping, doc_id, actor, seq: 0, payload: Vec::new() }
    }

    pub fn pong(doc_id: Uuid, actor: ConnectionId) -> Self {
        Self { msg_type: MessageType::Pong, doc_id, actor, seq: 0, payload: Vec::new() }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialize(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialize(e.to_string()))?;
        Ok(frame)
    }

    fn json_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        serde_json::from_slice(&self.payload).map_err(|e| ProtocolError::Deserialize(e.to_string()))
    }

    /// Parse a presence payload (full or patch).
    pub fn presence(&self) -> Result<PresenceBody, ProtocolError> {
        match self.msg_type {
            MessageType::PresenceFull | MessageType::PresencePatch => self.json_payload(),
            _ => Err(ProtocolError::InvalidMessageType),
        }
    }

    /// Parse a storage-ops payload.
    pub fn ops(&self) -> Result<StorageOpsBody, ProtocolError> {
        if self.msg_type != MessageType::StorageOps {
            return Err(ProtocolError::InvalidMessageType);
        }
        self.json_payload()
    }

    /// Parse an ack payload.
    pub fn ack(&self) -> Result<AckBody, ProtocolError> {
        if self.msg_type != MessageType::StorageAck {
            return Err(ProtocolError::InvalidMessageType);
        }
        self.json_payload()
    }

    /// Parse a connection-joined payload.
    pub fn connection(&self) -> Result<ConnectionBody, ProtocolError> {
        if self.msg_type != MessageType::ConnectionJoined {
            return Err(ProtocolError::InvalidMessageType);
        }
        self.json_payload()
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialize(String),
    #[error("deserialization error: {0}")]
    Deserialize(String),
    #[error("invalid message type")]
    InvalidMessageType,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("outbox full")]
    OutboxFull,
}

// ===================================================================
// Tests
// ===================================================================
