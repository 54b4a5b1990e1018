//! Binary wire protocol between clients and rooms.
//!
//! Every frame is one bincode-encoded [`Message`]:
//! ```text
//! ┌──────────┬───────────┬──────────────────────────────┐
//! │ room_id  │ timestamp │ payload (tagged enum)        │
//! │ 16 bytes │ varint    │ variable                     │
//! └──────────┴───────────┴──────────────────────────────┘
//! ```
//!
//! Snapshot payloads inside `SyncReply` are bincode + LZ4 compressed.

use forma_core::{
    CollabError, Conflict, DocumentSnapshot, Operation, ResolutionStrategy, Role, SnapshotReason,
    SyncDecision, SyncState,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::presence::{PresenceState, SelectionRange};

/// Room member as announced to other participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: String,
    pub display_name: String,
    pub role: Role,
    pub joined_at: u64,
}

/// Outcome of a conflict, broadcast to every member of the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictNotice {
    pub conflict_id: Uuid,
    pub document_id: Uuid,
    pub strategy: ResolutionStrategy,
    pub winner: Uuid,
    pub winner_author: String,
    pub losers: Vec<Uuid>,
}

impl ConflictNotice {
    /// Build a notice from a resolved conflict.
    pub fn from_conflict(conflict: &Conflict) -> Option<Self> {
        let winner = conflict.winner.as_ref()?;
        Some(Self {
            conflict_id: conflict.id,
            document_id: conflict.document_id,
            strategy: conflict.strategy?,
            winner: winner.id(),
            winner_author: winner.author_id().to_string(),
            losers: conflict.losers.iter().map(Operation::id).collect(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub state: SyncState,
    /// Skip reconciliation and reset to the canonical snapshot.
    pub force_snapshot: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncOutcome {
    UpToDate { version: u64 },
    CatchUp { operations: Vec<Operation> },
    Snapshot {
        reason: SnapshotReason,
        version: u64,
        /// LZ4-compressed bincode [`DocumentSnapshot`].
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReply {
    pub document_id: Uuid,
    pub outcome: SyncOutcome,
}

impl SyncReply {
    pub fn from_decision(
        document_id: Uuid,
        version: u64,
        decision: SyncDecision,
    ) -> Result<Self, ProtocolError> {
        let outcome = match decision {
            SyncDecision::UpToDate => SyncOutcome::UpToDate { version },
            SyncDecision::CatchUp(operations) => SyncOutcome::CatchUp { operations },
            SyncDecision::Snapshot { snapshot, reason } => SyncOutcome::Snapshot {
                reason,
                version: snapshot.version,
                data: encode_snapshot(&snapshot)?,
            },
        };
        Ok(Self { document_id, outcome })
    }
}

/// Typed message payloads.
///
/// `Joined`, `Ack`, `Rejected` and `SyncReply` only ever travel from the room
/// to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Client to room: an edit issued against `version`. Room to client: an
    /// edit sequenced at `version`.
    Operation { operation: Operation, version: u64 },
    Presence { user_id: String, state: PresenceState },
    Cursor { user_id: String, document_id: Uuid, position: usize },
    Selection { user_id: String, document_id: Uuid, range: SelectionRange },
    Join {
        user_id: String,
        display_name: String,
        document_id: Uuid,
        /// Replica state to reconcile as part of joining.
        sync: Option<SyncState>,
    },
    Leave { user_id: String },
    Conflict(ConflictNotice),
    Sync(SyncRequest),
    Heartbeat { nonce: u64, reply: bool },
    Joined {
        user_id: String,
        role: Role,
        strategy: ResolutionStrategy,
        participants: Vec<ParticipantInfo>,
    },
    Ack { operation_id: Uuid, version: u64 },
    Rejected {
        operation_id: Option<Uuid>,
        error: CollabError,
        /// The sender's replica no longer matches the room and must resync.
        resync: bool,
    },
    SyncReply(SyncReply),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Operation { .. } => "operation",
            Payload::Presence { .. } => "presence",
            Payload::Cursor { .. } => "cursor",
            Payload::Selection { .. } => "selection",
            Payload::Join { .. } => "join",
            Payload::Leave { .. } => "leave",
            Payload::Conflict(_) => "conflict",
            Payload::Sync(_) => "sync",
            Payload::Heartbeat { .. } => "heartbeat",
            Payload::Joined { .. } => "joined",
            Payload::Ack { .. } => "ack",
            Payload::Rejected { .. } => "rejected",
            Payload::SyncReply(_) => "sync_reply",
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub room_id: Uuid,
    /// Milliseconds since the Unix epoch at the sender.
    pub timestamp: u64,
    pub payload: Payload,
}

impl Message {
    pub fn new(room_id: Uuid, payload: Payload) -> Self {
        Self {
            room_id,
            timestamp: forma_core::now_millis(),
            payload,
        }
    }

    pub fn operation(room_id: Uuid, operation: Operation, version: u64) -> Self {
        Self::new(room_id, Payload::Operation { operation, version })
    }

    pub fn ack(room_id: Uuid, operation_id: Uuid, version: u64) -> Self {
        Self::new(room_id, Payload::Ack { operation_id, version })
    }

    pub fn rejected(room_id: Uuid, operation_id: Option<Uuid>, error: CollabError, resync: bool) -> Self {
        Self::new(room_id, Payload::Rejected { operation_id, error, resync })
    }

    pub fn heartbeat(room_id: Uuid, nonce: u64) -> Self {
        Self::new(room_id, Payload::Heartbeat { nonce, reply: false })
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

/// Compress a snapshot for the wire or for storage.
pub fn encode_snapshot(snapshot: &DocumentSnapshot) -> Result<Vec<u8>, ProtocolError> {
    let raw = bincode::serde::encode_to_vec(snapshot, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

pub fn decode_snapshot(data: &[u8]) -> Result<DocumentSnapshot, ProtocolError> {
    let raw = lz4_flex::decompress_size_prepended(data)
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;
    let (snapshot, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(snapshot)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Unexpected {0} message")]
    Unexpected(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use forma_core::{Document, FieldValue, OpKind};

    #[test]
    fn test_operation_message_roundtrip() {
        let op = Operation::new(
            OpKind::Update {
                path: "fields.0".into(),
                value: FieldValue::from(field_definition()),
            },
            Uuid::new_v4(),
            "alice",
            7,
        )
        .rebased(3);
        let msg = Message::operation(Uuid::new_v4(), op.clone(), 3);

        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        match decoded.payload {
            Payload::Operation { operation, version } => {
                assert_eq!(operation.id(), op.id());
                assert_eq!(operation.base_version(), 3);
                assert_eq!(version, 3);
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }

    fn field_definition() -> FieldValue {
        FieldValue::Map(
            [
                ("label".to_string(), FieldValue::from("Email")),
                ("required".to_string(), FieldValue::Bool(true)),
                ("width".to_string(), FieldValue::Number(0.5)),
            ]
            .into_iter()
            .collect(),
        )
    }

    #[test]
    fn test_rejection_carries_error() {
        let msg = Message::rejected(
            Uuid::new_v4(),
            Some(Uuid::new_v4()),
            CollabError::PermissionDenied { user_id: "v".into(), role: Role::Viewer },
            true,
        );
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert!(matches!(
            decoded.payload,
            Payload::Rejected { error: CollabError::PermissionDenied { role: Role::Viewer, .. }, resync: true, .. }
        ));
    }

    #[test]
    fn test_snapshot_compression() {
        let doc = Document::from_text(Uuid::new_v4(), &"field ".repeat(500));
        let snapshot = doc.snapshot();
        let data = encode_snapshot(&snapshot).unwrap();
        assert!(data.len() < snapshot.content.len());
        assert_eq!(decode_snapshot(&data).unwrap(), snapshot);
    }

    #[test]
    fn test_sync_reply_from_decision() {
        let doc = Document::from_text(Uuid::new_v4(), "abc");
        let reply = SyncReply::from_decision(
            doc.id(),
            0,
            SyncDecision::Snapshot { snapshot: doc.snapshot(), reason: SnapshotReason::Divergence },
        )
        .unwrap();
        match reply.outcome {
            SyncOutcome::Snapshot { reason, data, .. } => {
                assert_eq!(reason, SnapshotReason::Divergence);
                assert_eq!(decode_snapshot(&data).unwrap().content, "abc");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(matches!(
            Message::decode(&[0xFF, 0xFF, 0xFF]),
            Err(ProtocolError::Deserialization(_))
        ));
        assert!(decode_snapshot(&[1, 2]).is_err());
    }

    #[test]
    fn test_payload_kinds() {
        let room = Uuid::new_v4();
        assert_eq!(Message::heartbeat(room, 1).payload.kind(), "heartbeat");
        assert_eq!(Message::ack(room, Uuid::new_v4(), 2).payload.kind(), "ack");
    }
}
