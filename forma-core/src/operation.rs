use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CollabError;
use crate::value::FieldValue;

/// What an operation does. Positions and lengths count chars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    Insert { position: usize, text: String },
    Delete { position: usize, length: usize },
    Update { path: String, value: FieldValue },
    Move { position: usize, length: usize, target: usize },
    Format { position: usize, length: usize, attribute: String, value: FieldValue },
    Comment { position: usize, length: usize, text: String },
    Cursor { position: usize },
    Selection { position: usize, length: usize },
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Insert { .. } => "insert",
            OpKind::Delete { .. } => "delete",
            OpKind::Update { .. } => "update",
            OpKind::Move { .. } => "move",
            OpKind::Format { .. } => "format",
            OpKind::Comment { .. } => "comment",
            OpKind::Cursor { .. } => "cursor",
            OpKind::Selection { .. } => "selection",
        }
    }

    /// Cursor and selection kinds describe presence, not content.
    pub fn is_presence(&self) -> bool {
        matches!(self, OpKind::Cursor { .. } | OpKind::Selection { .. })
    }

    /// Half-open char range touched by this kind, if it is positional.
    pub fn range(&self) -> Option<(usize, usize)> {
        match self {
            OpKind::Insert { position, text } => Some((*position, position + char_len(text))),
            OpKind::Delete { position, length }
            | OpKind::Move { position, length, .. }
            | OpKind::Format { position, length, .. }
            | OpKind::Comment { position, length, .. }
            | OpKind::Selection { position, length } => Some((*position, position + length)),
            OpKind::Cursor { position } => Some((*position, *position)),
            OpKind::Update { .. } => None,
        }
    }

    /// Bounds check against a document of `len` chars.
    pub fn validate(&self, len: usize) -> Result<(), CollabError> {
        match self {
            OpKind::Insert { position, .. } | OpKind::Cursor { position } => {
                check_position(*position, len)
            }
            OpKind::Delete { position, length }
            | OpKind::Format { position, length, .. }
            | OpKind::Comment { position, length, .. }
            | OpKind::Selection { position, length } => check_range(*position, *length, len),
            OpKind::Move { position, length, target } => {
                check_range(*position, *length, len)?;
                // target is an index into the content with the moved span removed
                check_position(*target, len - length)
            }
            OpKind::Update { .. } => Ok(()),
        }
    }

    fn has_no_effect(&self) -> bool {
        match self {
            OpKind::Insert { text, .. } => text.is_empty(),
            OpKind::Delete { length, .. }
            | OpKind::Move { length, .. }
            | OpKind::Format { length, .. } => *length == 0,
            _ => false,
        }
    }
}

fn check_position(position: usize, len: usize) -> Result<(), CollabError> {
    if position > len {
        return Err(CollabError::InvalidPosition { position, len });
    }
    Ok(())
}

fn check_range(position: usize, length: usize, len: usize) -> Result<(), CollabError> {
    check_position(position, len)?;
    if position.saturating_add(length) > len {
        return Err(CollabError::InvalidRange { position, length, len });
    }
    Ok(())
}

pub(crate) fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// A single edit to a document.
///
/// Fields are read-only once the id is assigned. Transformation and rebasing
/// derive new values that keep the id, so the room can acknowledge and
/// deduplicate the logical edit regardless of how it was rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    id: Uuid,
    kind: OpKind,
    document_id: Uuid,
    author_id: String,
    timestamp: u64,
    base_version: u64,
    #[serde(default)]
    void: bool,
}

impl Operation {
    pub fn new(kind: OpKind, document_id: Uuid, author_id: impl Into<String>, timestamp: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            document_id,
            author_id: author_id.into(),
            timestamp,
            base_version: 0,
            void: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn author_id(&self) -> &str {
        &self.author_id
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    /// True when applying this operation changes nothing: it was voided by a
    /// transformation or has zero width.
    pub fn is_noop(&self) -> bool {
        self.void || self.kind.has_no_effect()
    }

    /// Same edit, issued against canonical version `base_version`.
    pub fn rebased(&self, base_version: u64) -> Self {
        Self {
            base_version,
            ..self.clone()
        }
    }

    /// Total order used wherever concurrent operations need a deterministic
    /// winner: timestamp, then author, then id.
    pub fn precedence(&self) -> (u64, &str, Uuid) {
        (self.timestamp, &self.author_id, self.id)
    }

    pub(crate) fn with_kind(&self, kind: OpKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }

    pub(crate) fn voided(&self) -> Self {
        Self {
            void: true,
            ..self.clone()
        }
    }
}

/// Lamport logical clock.
#[derive(Debug, Clone, Default)]
pub struct LamportClock {
    time: u64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance for a local event and return the new time.
    pub fn tick(&mut self) -> u64 {
        self.time += 1;
        self.time
    }

    /// Merge a timestamp received from another replica.
    pub fn observe(&mut self, remote: u64) {
        self.time = self.time.max(remote);
    }

    pub fn now(&self) -> u64 {
        self.time
    }
}
