use crate::document::{Document, DocumentSnapshot};
use crate::error::CollabError;
use crate::operation::{LamportClock, OpKind, Operation};
use crate::oplog::OperationLog;
use crate::sync::SyncState;
use crate::transform::{mergeable, transform};

/// Outcome of sequencing an operation on the canonical replica.
#[derive(Debug, Clone, PartialEq)]
pub struct Sequenced {
    /// The operation as applied to the canonical document.
    pub operation: Operation,
    /// Canonical version it produced.
    pub version: u64,
    /// The id had been sequenced before; nothing was applied this time.
    pub duplicate: bool,
}

/// The room's canonical copy of one document.
///
/// Operations are applied strictly one at a time, in arrival order. Each
/// incoming operation is transformed against everything logged after the
/// version it was issued against before it is applied.
#[derive(Debug, Clone)]
pub struct AuthoritativeDocument {
    document: Document,
    log: OperationLog,
    clock: LamportClock,
    dirty: bool,
}

impl AuthoritativeDocument {
    pub fn new(document: Document, max_retained: usize) -> Self {
        Self {
            log: OperationLog::new(document.version(), document.len(), max_retained),
            document,
            clock: LamportClock::new(),
            dirty: false,
        }
    }

    pub fn from_snapshot(snapshot: DocumentSnapshot, max_retained: usize) -> Self {
        Self::new(Document::from_snapshot(snapshot), max_retained)
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn version(&self) -> u64 {
        self.document.version()
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        self.document.snapshot()
    }

    pub fn sync_state(&self) -> SyncState {
        SyncState {
            document_id: self.document.id(),
            version: self.document.version(),
            checksum: self.document.checksum(),
        }
    }

    /// Logged operations the sender of `op` had not seen when issuing it.
    pub fn concurrent_with(&self, op: &Operation) -> Result<Vec<Operation>, CollabError> {
        let base = op.base_version();
        if base < self.log.floor() {
            return Err(CollabError::LogTruncated {
                requested: base,
                oldest: self.log.floor(),
            });
        }
        Ok(self
            .log
            .entries_since(base)
            .map(|entry| entry.operation.clone())
            .collect())
    }

    /// Transform, validate, apply and log an incoming operation.
    ///
    /// A duplicate submission returns the original sequencing without
    /// applying anything again.
    pub fn apply_sequenced(&mut self, op: Operation) -> Result<Sequenced, CollabError> {
        if let Some(entry) = self.log.get(&op.id()) {
            log::debug!("Operation {} already sequenced at version {}", op.id(), entry.version);
            return Ok(Sequenced {
                operation: entry.operation.clone(),
                version: entry.version,
                duplicate: true,
            });
        }
        if op.document_id() != self.document.id() {
            return Err(CollabError::UnknownDocument(op.document_id()));
        }
        if op.kind().is_presence() {
            op.kind().validate(self.document.len())?;
            return Ok(Sequenced {
                operation: op,
                version: self.document.version(),
                duplicate: false,
            });
        }

        let behind = op.base_version() < self.document.version();
        let rebased = self.rebase(&op)?;
        self.sequence(rebased, behind)
    }

    /// Bring `op` forward from its base version to the current one.
    ///
    /// The operation is validated against the document length its author
    /// saw, then transformed through every logged operation since. When it
    /// cannot be reconciled with one of them the logged operation wins and
    /// `ConflictLost` names it.
    pub fn rebase(&self, op: &Operation) -> Result<Operation, CollabError> {
        let concurrent = self.concurrent_with(op)?;
        let seen_len = self.log.len_at(op.base_version()).unwrap_or(self.document.len());
        op.kind().validate(seen_len)?;

        let mut rebased = op.clone();
        for against in &concurrent {
            if !mergeable(&rebased, against) {
                log::debug!(
                    "Operation {} cannot be reconciled with sequenced {}",
                    op.id(),
                    against.id()
                );
                return Err(CollabError::ConflictLost {
                    operation_id: op.id(),
                    winner: against.id(),
                });
            }
            rebased = transform(&rebased, against);
        }
        Ok(rebased)
    }

    /// Sequence an operation originated by the room itself on behalf of
    /// `author_id`, timestamped after everything seen so far.
    pub fn issue(&mut self, kind: OpKind, author_id: &str) -> Result<Sequenced, CollabError> {
        let op = Operation::new(kind, self.document.id(), author_id, self.clock.tick())
            .rebased(self.document.version());
        self.sequence(op, false)
    }

    fn sequence(&mut self, op: Operation, transformed: bool) -> Result<Sequenced, CollabError> {
        // a transformed operation may drift by a boundary char; clamp it
        // rather than refuse an edit the author already sees applied
        let version = if transformed {
            self.document.apply_clamped(&op)
        } else {
            self.document.apply(&op)?
        };
        self.clock.observe(op.timestamp());
        self.log.append(version, op.clone(), self.document.len());
        self.dirty = true;
        log::trace!(
            "Sequenced {} {} from {} at version {version}",
            op.kind().name(),
            op.id(),
            op.author_id()
        );
        Ok(Sequenced {
            operation: op,
            version,
            duplicate: false,
        })
    }

    /// Whether anything changed since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}
