use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::authority::AuthoritativeDocument;
use crate::document::DocumentSnapshot;
use crate::error::CollabError;
use crate::operation::Operation;

/// A replica's claim about one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub document_id: Uuid,
    pub version: u64,
    pub checksum: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotReason {
    /// The log no longer holds the client's version.
    LogTruncated,
    /// The client claims a version the room never produced.
    ClientAhead,
    /// Same version, different checksum.
    Divergence,
    /// The client asked for it.
    Requested,
}

/// What the room must send a replica to bring it to canonical state.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncDecision {
    UpToDate,
    CatchUp(Vec<Operation>),
    Snapshot {
        snapshot: DocumentSnapshot,
        reason: SnapshotReason,
    },
}

impl SyncDecision {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncDecision::UpToDate => "up_to_date",
            SyncDecision::CatchUp(_) => "catch_up",
            SyncDecision::Snapshot { .. } => "snapshot",
        }
    }
}

/// Compare a replica's `(version, checksum)` with the canonical document.
///
/// Equal state is a no-op, so repeating a sync is harmless. A checksum
/// mismatch at equal versions means the replica diverged and is logged as
/// [`CollabError::TransformDivergence`] before a snapshot is prescribed.
pub fn reconcile(
    authority: &AuthoritativeDocument,
    client: &SyncState,
    force_snapshot: bool,
) -> SyncDecision {
    let snapshot = |reason| SyncDecision::Snapshot {
        snapshot: authority.snapshot(),
        reason,
    };
    if force_snapshot {
        return snapshot(SnapshotReason::Requested);
    }

    let canonical = authority.sync_state();
    if client.version == canonical.version {
        if client.checksum == canonical.checksum {
            return SyncDecision::UpToDate;
        }
        let err = CollabError::TransformDivergence {
            document_id: canonical.document_id,
            version: canonical.version,
        };
        log::error!("{err}: client checksum {:x}, canonical {:x}", client.checksum, canonical.checksum);
        return snapshot(SnapshotReason::Divergence);
    }
    if client.version > canonical.version {
        log::warn!(
            "Client claims version {} of document {} but room is at {}",
            client.version,
            canonical.document_id,
            canonical.version
        );
        return snapshot(SnapshotReason::ClientAhead);
    }

    match authority.log().since(client.version) {
        Some(operations) => SyncDecision::CatchUp(operations),
        None => snapshot(SnapshotReason::LogTruncated),
    }
}
