use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::role::Role;

/// Errors raised by the synchronization core.
///
/// Serializable so the room can report operation-level failures back to the
/// originating participant unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum CollabError {
    #[error("position {position} is outside the document (length {len})")]
    InvalidPosition { position: usize, len: usize },

    #[error("range {position}+{length} exceeds the document (length {len})")]
    InvalidRange {
        position: usize,
        length: usize,
        len: usize,
    },

    #[error("user '{user_id}' with role {role} may not modify the document")]
    PermissionDenied { user_id: String, role: Role },

    #[error("replica of document {document_id} diverged at version {version}")]
    TransformDivergence { document_id: Uuid, version: u64 },

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("operation log no longer holds version {requested} (oldest retained {oldest})")]
    LogTruncated { requested: u64, oldest: u64 },

    #[error("user '{user_id}' is not a member of the room")]
    NotMember { user_id: String },

    #[error("unknown document {0}")]
    UnknownDocument(Uuid),

    #[error("room {0} is full")]
    RoomFull(Uuid),

    #[error("operation {operation_id} lost a conflict to {winner}")]
    ConflictLost { operation_id: Uuid, winner: Uuid },
}

impl CollabError {
    /// Errors that leave the originator's optimistic replica out of step with
    /// the room.
    pub fn requires_resync(&self) -> bool {
        !matches!(self, CollabError::TransportUnavailable(_) | CollabError::RoomFull(_))
    }
}
