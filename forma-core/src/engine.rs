//! Client-side replica.
//!
//! The engine keeps two documents: the local replica the user sees, with
//! optimistic edits applied immediately, and a shadow of the canonical room
//! state built only from acknowledged and remote operations. Local edits wait
//! in a pending queue; at most one of them is in flight to the room at a time
//! so every acknowledgement advances the shadow by exactly one version.

use std::collections::{HashSet, VecDeque};

use uuid::Uuid;

use crate::document::{Document, DocumentSnapshot};
use crate::error::CollabError;
use crate::operation::{LamportClock, OpKind, Operation};
use crate::sync::SyncState;
use crate::transform::{mergeable, transform};

const SEEN_CAPACITY: usize = 4096;

/// Result of applying an operation to a replica.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// The operation as executed (after transformation for remote ones).
    pub operation: Operation,
    /// Replica version after application.
    pub version: u64,
}

pub struct Engine {
    author_id: String,
    document: Document,
    shadow: Document,
    pending: VecDeque<Operation>,
    in_flight: bool,
    discarded: Vec<Operation>,
    clock: LamportClock,
    seen: HashSet<Uuid>,
    seen_order: VecDeque<Uuid>,
}

impl Engine {
    pub fn new(author_id: impl Into<String>, document: Document) -> Self {
        Self {
            author_id: author_id.into(),
            shadow: document.clone(),
            document,
            pending: VecDeque::new(),
            in_flight: false,
            discarded: Vec::new(),
            clock: LamportClock::new(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    pub fn author_id(&self) -> &str {
        &self.author_id
    }

    /// Local replica, including unacknowledged edits.
    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Last known canonical state.
    pub fn shadow(&self) -> &Document {
        &self.shadow
    }

    pub fn pending(&self) -> impl Iterator<Item = &Operation> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight(&self) -> Option<&Operation> {
        if self.in_flight {
            self.pending.front()
        } else {
            None
        }
    }

    pub fn clock(&self) -> u64 {
        self.clock.now()
    }

    /// Create and apply a local operation.
    ///
    /// Cursor and selection kinds are validated and returned without
    /// touching the replica or the pending queue.
    pub fn apply_local(&mut self, kind: OpKind) -> Result<Applied, CollabError> {
        kind.validate(self.document.len())?;
        let op = Operation::new(kind, self.document.id(), self.author_id.clone(), self.clock.tick());

        if op.kind().is_presence() {
            return Ok(Applied {
                operation: op,
                version: self.document.version(),
            });
        }

        let version = self.document.apply(&op)?;
        self.remember(op.id());
        self.pending.push_back(op.clone());
        log::trace!(
            "Local {} {} at version {version} ({} pending)",
            op.kind().name(),
            op.id(),
            self.pending.len()
        );
        Ok(Applied { operation: op, version })
    }

    /// Integrate an operation sequenced by the room.
    ///
    /// The operation is transformed against every pending local operation,
    /// and each pending operation is transformed against it in turn so later
    /// remote operations still line up. Operations already seen are ignored.
    ///
    /// A pending operation that cannot be reconciled with the remote one
    /// loses: it and everything queued after it are dropped, the replica is
    /// rebuilt from the shadow, and the dropped operations wait in
    /// [`Engine::take_discarded`]. The room makes the same call for the
    /// in-flight operation, so no resync is needed.
    pub fn apply_remote(&mut self, op: Operation) -> Result<Applied, CollabError> {
        if op.document_id() != self.document.id() {
            return Err(CollabError::UnknownDocument(op.document_id()));
        }
        if self.seen.contains(&op.id()) {
            log::trace!("Ignoring already seen operation {}", op.id());
            return Ok(Applied {
                operation: op,
                version: self.document.version(),
            });
        }
        self.clock.observe(op.timestamp());
        self.shadow.apply_clamped(&op);

        let mut incoming = op;
        let mut lost = None;
        for (index, pending) in self.pending.iter_mut().enumerate() {
            if !mergeable(pending, &incoming) {
                lost = Some(index);
                break;
            }
            let next = transform(&incoming, pending);
            *pending = transform(pending, &incoming);
            incoming = next;
        }

        let version = match lost {
            Some(index) => self.discard_from(index),
            None => self.document.apply_clamped(&incoming),
        };
        self.remember(incoming.id());
        Ok(Applied {
            operation: incoming,
            version,
        })
    }

    /// Pending operations dropped because a remote edit won against them.
    pub fn take_discarded(&mut self) -> Vec<Operation> {
        std::mem::take(&mut self.discarded)
    }

    fn discard_from(&mut self, index: usize) -> u64 {
        if index == 0 {
            self.in_flight = false;
        }
        let dropped: Vec<Operation> = self.pending.drain(index..).collect();
        log::info!(
            "Remote edit on document {} won against {} pending operation(s)",
            self.shadow.id(),
            dropped.len()
        );
        self.discarded.extend(dropped);

        let mut document = self.shadow.clone();
        for op in &self.pending {
            document.apply_clamped(op);
        }
        self.document = document;
        self.document.version()
    }

    /// Hand out the next operation to send, if nothing is in flight.
    ///
    /// The operation is stamped with the shadow version it applies on.
    pub fn next_outgoing(&mut self) -> Option<Operation> {
        if self.in_flight {
            return None;
        }
        let base = self.shadow.version();
        let front = self.pending.front_mut()?;
        *front = front.rebased(base);
        self.in_flight = true;
        Some(front.clone())
    }

    /// Record the room's acknowledgement of the in-flight operation.
    ///
    /// Returns false for stale or unknown acknowledgements.
    pub fn acknowledge(&mut self, operation_id: Uuid, version: u64) -> bool {
        match self.pending.front() {
            Some(front) if front.id() == operation_id => {}
            _ => return false,
        }
        let Some(op) = self.pending.pop_front() else {
            return false;
        };
        self.in_flight = false;
        self.shadow.apply_clamped(&op);
        if self.shadow.version() != version {
            log::warn!(
                "Acknowledged version {version} differs from shadow version {}",
                self.shadow.version()
            );
            self.shadow.set_version(version);
        }
        true
    }

    /// Drop a pending operation the room refused.
    pub fn reject(&mut self, operation_id: Uuid) -> Option<Operation> {
        let index = self.pending.iter().position(|op| op.id() == operation_id)?;
        if index == 0 {
            self.in_flight = false;
        }
        self.pending.remove(index)
    }

    /// Forget the in-flight marker after the connection dropped; the
    /// operation stays pending and is sent again.
    pub fn reset_in_flight(&mut self) {
        self.in_flight = false;
    }

    /// Replace both replicas with a canonical snapshot.
    ///
    /// Returns the pending operations that were discarded.
    pub fn reset_to_snapshot(&mut self, snapshot: DocumentSnapshot) -> Vec<Operation> {
        let document = Document::from_snapshot(snapshot);
        self.shadow = document.clone();
        self.document = document;
        self.in_flight = false;
        let discarded: Vec<Operation> = self.pending.drain(..).collect();
        if !discarded.is_empty() {
            log::info!(
                "Reset document {} to version {}, discarded {} pending operation(s)",
                self.document.id(),
                self.document.version(),
                discarded.len()
            );
        }
        discarded
    }

    /// `(version, checksum)` of the canonical shadow, for the sync protocol.
    pub fn sync_state(&self) -> SyncState {
        SyncState {
            document_id: self.shadow.id(),
            version: self.shadow.version(),
            checksum: self.shadow.checksum(),
        }
    }

    fn remember(&mut self, id: Uuid) {
        if self.seen.insert(id) {
            self.seen_order.push_back(id);
            if self.seen_order.len() > SEEN_CAPACITY {
                if let Some(old) = self.seen_order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
    }
}
