use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::CollabError;
use crate::operation::{OpKind, Operation};
use crate::transform::transform_range;
use crate::value::FieldValue;

/// Range annotation written by `format` or `comment` operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// Id of the operation that created the annotation.
    pub id: Uuid,
    pub author_id: String,
    pub position: usize,
    pub length: usize,
    pub kind: AnnotationKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AnnotationKind {
    Format { attribute: String, value: FieldValue },
    Comment { text: String },
}

/// Serializable full state of a document, used for persistence and for
/// resetting replicas that cannot catch up from the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub document_id: Uuid,
    pub version: u64,
    pub content: String,
    pub properties: BTreeMap<String, FieldValue>,
    pub annotations: Vec<Annotation>,
    pub last_modified: u64,
}

/// A form definition being edited: free text content, property tree and
/// range annotations.
#[derive(Debug, Clone)]
pub struct Document {
    id: Uuid,
    content: Vec<char>,
    properties: BTreeMap<String, FieldValue>,
    /// Kept sorted by (position, length, id) so every replica hashes the same.
    annotations: Vec<Annotation>,
    version: u64,
    last_modified: u64,
}

impl Document {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            content: Vec::new(),
            properties: BTreeMap::new(),
            annotations: Vec::new(),
            version: 0,
            last_modified: 0,
        }
    }

    pub fn from_text(id: Uuid, text: &str) -> Self {
        Self {
            content: text.chars().collect(),
            ..Self::new(id)
        }
    }

    pub fn from_snapshot(snapshot: DocumentSnapshot) -> Self {
        let mut doc = Self {
            id: snapshot.document_id,
            content: snapshot.content.chars().collect(),
            properties: snapshot.properties,
            annotations: snapshot.annotations,
            version: snapshot.version,
            last_modified: snapshot.last_modified,
        };
        doc.sort_annotations();
        doc
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            document_id: self.id,
            version: self.version,
            content: self.content(),
            properties: self.properties.clone(),
            annotations: self.annotations.clone(),
            last_modified: self.last_modified,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn content(&self) -> String {
        self.content.iter().collect()
    }

    /// Length in chars.
    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn last_modified(&self) -> u64 {
        self.last_modified
    }

    pub fn properties(&self) -> &BTreeMap<String, FieldValue> {
        &self.properties
    }

    pub fn property(&self, path: &str) -> Option<&FieldValue> {
        self.properties.get(path)
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    /// Validate and apply an operation, returning the new version.
    ///
    /// Cursor and selection kinds are validated but change nothing. A no-op
    /// still advances the version.
    pub fn apply(&mut self, op: &Operation) -> Result<u64, CollabError> {
        if op.kind().is_presence() {
            op.kind().validate(self.len())?;
            return Ok(self.version);
        }
        if op.is_noop() {
            return Ok(self.advance());
        }
        op.kind().validate(self.len())?;
        self.execute(op.kind(), op);
        Ok(self.version)
    }

    /// Apply an operation whose bounds may have drifted, clamping it into the
    /// document instead of failing.
    pub fn apply_clamped(&mut self, op: &Operation) -> u64 {
        if op.kind().is_presence() {
            return self.version;
        }
        if op.is_noop() {
            return self.advance();
        }
        let kind = clamp(op.kind(), self.len());
        if kind != *op.kind() {
            log::debug!("Clamped {} operation {} to {} chars", kind.name(), op.id(), self.len());
        }
        self.execute(&kind, op);
        self.version
    }

    pub(crate) fn advance(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn execute(&mut self, kind: &OpKind, op: &Operation) {
        match kind {
            OpKind::Insert { position, text } => {
                let at = *position;
                self.content.splice(at..at, text.chars());
            }
            OpKind::Delete { position, length } => {
                self.content.drain(*position..position + length);
            }
            OpKind::Move { position, length, target } => {
                let moved: Vec<char> = self.content.drain(*position..position + length).collect();
                let at = (*target).min(self.content.len());
                self.content.splice(at..at, moved);
            }
            OpKind::Update { path, value } => {
                if value.is_null() {
                    self.properties.remove(path);
                } else {
                    self.properties.insert(path.clone(), value.clone());
                }
            }
            OpKind::Format { .. } | OpKind::Comment { .. } => {}
            OpKind::Cursor { .. } | OpKind::Selection { .. } => return,
        }

        let edited = op.with_kind(kind.clone());
        for annotation in &mut self.annotations {
            (annotation.position, annotation.length) =
                transform_range(annotation.position, annotation.length, &edited);
        }
        self.annotations
            .retain(|a| a.length > 0 || matches!(a.kind, AnnotationKind::Comment { .. }));

        match kind {
            OpKind::Format { position, length, attribute, value } => {
                self.annotations.push(Annotation {
                    id: op.id(),
                    author_id: op.author_id().to_string(),
                    position: *position,
                    length: *length,
                    kind: AnnotationKind::Format {
                        attribute: attribute.clone(),
                        value: value.clone(),
                    },
                });
            }
            OpKind::Comment { position, length, text } => {
                self.annotations.push(Annotation {
                    id: op.id(),
                    author_id: op.author_id().to_string(),
                    position: *position,
                    length: *length,
                    kind: AnnotationKind::Comment { text: text.clone() },
                });
            }
            _ => {}
        }
        self.sort_annotations();

        self.version += 1;
        self.last_modified = crate::now_millis();
    }

    fn sort_annotations(&mut self) {
        self.annotations
            .sort_by(|a, b| (a.position, a.length, a.id).cmp(&(b.position, b.length, b.id)));
    }

    /// Checksum over content, properties and annotations.
    ///
    /// Version and timestamps are excluded: two replicas with equal state
    /// hash equally however they got there.
    pub fn checksum(&self) -> u64 {
        let mut hasher = Sha256::new();

        let content = self.content();
        hasher.update((content.len() as u64).to_le_bytes());
        hasher.update(content.as_bytes());

        hasher.update((self.properties.len() as u64).to_le_bytes());
        for (path, value) in &self.properties {
            hasher.update((path.len() as u64).to_le_bytes());
            hasher.update(path.as_bytes());
            value.digest(&mut hasher);
        }

        hasher.update((self.annotations.len() as u64).to_le_bytes());
        for annotation in &self.annotations {
            hasher.update(annotation.id.as_bytes());
            hasher.update((annotation.position as u64).to_le_bytes());
            hasher.update((annotation.length as u64).to_le_bytes());
            match &annotation.kind {
                AnnotationKind::Format { attribute, value } => {
                    hasher.update([0u8]);
                    hasher.update(attribute.as_bytes());
                    value.digest(&mut hasher);
                }
                AnnotationKind::Comment { text } => {
                    hasher.update([1u8]);
                    hasher.update(text.as_bytes());
                }
            }
        }

        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(bytes)
    }
}

/// Clamp positions and lengths of `kind` into a document of `len` chars.
fn clamp(kind: &OpKind, len: usize) -> OpKind {
    let range = |position: usize, length: usize| {
        let position = position.min(len);
        (position, length.min(len - position))
    };
    match kind.clone() {
        OpKind::Insert { position, text } => OpKind::Insert { position: position.min(len), text },
        OpKind::Cursor { position } => OpKind::Cursor { position: position.min(len) },
        OpKind::Delete { position, length } => {
            let (position, length) = range(position, length);
            OpKind::Delete { position, length }
        }
        OpKind::Selection { position, length } => {
            let (position, length) = range(position, length);
            OpKind::Selection { position, length }
        }
        OpKind::Move { position, length, target } => {
            let (position, length) = range(position, length);
            OpKind::Move { position, length, target: target.min(len - length) }
        }
        OpKind::Format { position, length, attribute, value } => {
            let (position, length) = range(position, length);
            OpKind::Format { position, length, attribute, value }
        }
        OpKind::Comment { position, length, text } => {
            let (position, length) = range(position, length);
            OpKind::Comment { position, length, text }
        }
        update @ OpKind::Update { .. } => update,
    }
}
