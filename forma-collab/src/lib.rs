//! # forma-collab
//!
//! Networked half of the form sync core: rooms, presence, transport,
//! persistence, and the WebSocket server and client built on them.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐      WebSocket       ┌─────────────┐
//! │ SyncClient  │ ◄──────────────────► │ SyncServer  │
//! │ (per user)  │    bincode frames    │ (central)   │
//! └──────┬──────┘                      └──────┬──────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌─────────────┐                      ┌─────────────┐
//! │ Transport   │                      │ RoomRegistry│
//! │ + Engine    │                      │  └─ Room    │── SnapshotStore
//! └─────────────┘                      └──────┬──────┘
//!                                             │
//!                                     ┌───────┴────────┐
//!                                     │ BroadcastGroup │
//!                                     │ (per-peer fan) │
//!                                     └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: binary wire protocol (bincode-encoded `Message`)
//! - [`presence`]: online state, cursors and selections per room
//! - [`broadcast`]: per-peer outboxes with lag eviction
//! - [`identity`]: role lookup on join
//! - [`storage`]: snapshot persistence (memory, RocksDB)
//! - [`room`]: room tasks and the registry that owns them
//! - [`transport`]: reconnecting client transport with an offline queue
//! - [`client`]: sync client driving a local [`forma_core::Engine`]
//! - [`server`]: WebSocket sync server

pub mod broadcast;
pub mod client;
pub mod identity;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{ClientConfig, SyncClient, SyncEvent};
pub use identity::{RoleResolver, StaticRoleResolver};
pub use presence::{PresenceRecord, PresenceState, PresenceTracker, SelectionRange};
pub use protocol::{ConflictNotice, Message, ParticipantInfo, Payload, ProtocolError, SyncOutcome, SyncReply};
pub use room::{
    CollabEvent, DocumentSummary, JoinRequest, LeaveReason, RoomConfig, RoomHandle, RoomRegistry, RoomSummary,
};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use storage::{MemorySnapshotStore, RocksSnapshotStore, SnapshotStore, StoreConfig, StoreError};
pub use transport::{
    Backoff, Channel, ConnectionState, Connector, OutboundQueue, TransportAdapter, TransportConfig,
    TransportError, TransportEvent, TransportHandle, WebSocketConnector,
};
