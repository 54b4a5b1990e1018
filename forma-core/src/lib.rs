//! # forma-core
//!
//! Pure synchronization core for collaborative form editing. Nothing in this
//! crate performs I/O; the networked pieces live in `forma-collab`.
//!
//! ## Architecture
//!
//! ```text
//!   client replica                         room (authoritative)
//! ┌──────────────────────┐              ┌──────────────────────────┐
//! │ Engine               │  operation   │ AuthoritativeDocument    │
//! │  ├─ Document (local) │ ───────────► │  ├─ Document (canonical) │
//! │  ├─ Document (shadow)│              │  ├─ OperationLog         │
//! │  └─ pending ops      │ ◄─────────── │  └─ ConflictResolver     │
//! └──────────────────────┘  ack/remote  └──────────────────────────┘
//!            ▲                                     │
//!            └──────── sync::reconcile ◄───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`]: document model, annotations, checksums
//! - [`value`]: form property values
//! - [`operation`]: operations and the Lamport clock
//! - [`transform`]: pairwise operational transformation
//! - [`engine`]: client replica with pending/in-flight bookkeeping
//! - [`oplog`]: bounded per-document operation log
//! - [`authority`]: canonical sequencing of incoming operations
//! - [`conflict`]: conflict detection and resolution strategies
//! - [`sync`]: version/checksum reconciliation
//! - [`role`]: participant roles
//! - [`error`]: error type shared by every module

pub mod authority;
pub mod conflict;
pub mod document;
pub mod engine;
pub mod error;
pub mod oplog;
pub mod operation;
pub mod role;
pub mod sync;
pub mod transform;
pub mod value;

pub use authority::{AuthoritativeDocument, Sequenced};
pub use conflict::{Conflict, ConflictResolver, ConflictStatus, Resolution, ResolutionStrategy};
pub use document::{Annotation, AnnotationKind, Document, DocumentSnapshot};
pub use engine::{Applied, Engine};
pub use error::CollabError;
pub use oplog::{LogEntry, OperationLog};
pub use operation::{LamportClock, OpKind, Operation};
pub use role::Role;
pub use sync::{reconcile, SnapshotReason, SyncDecision, SyncState};
pub use transform::{mergeable, transform};
pub use value::FieldValue;

/// Milliseconds since the Unix epoch, saturating to zero on clock skew.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
