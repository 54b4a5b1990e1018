//! WebSocket sync server.
//!
//! ```text
//! Client A ──┐                         ┌── Room (room_id) ── SnapshotStore
//!             ├── connection task ─────┤        │             (RocksDB or memory)
//! Client B ──┘   decode / forward      │        ▼
//!                 ◄── outbox frames ───┘   per-peer outboxes
//! ```
//!
//! A connection's first frame must be a `Join`. After that the connection
//! task only moves bytes: decoded messages go to the room's inbox, frames
//! from the room's outbox go to the socket. All room logic lives in the
//! room task.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use forma_core::{CollabError, Role};
use futures_util::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

use crate::identity::{RoleResolver, StaticRoleResolver};
use crate::protocol::{Message, Payload};
use crate::room::{CollabEvent, JoinRequest, LeaveReason, RoomConfig, RoomRegistry};
use crate::storage::{MemorySnapshotStore, RocksSnapshotStore, SnapshotStore, StoreConfig, StoreError};

/// How long a fresh connection may take to send its `Join`.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Frames buffered per connection before the peer counts as lagging.
    pub outbox_capacity: usize,
    pub event_capacity: usize,
    /// RocksDB directory; `None` keeps snapshots in memory.
    pub storage_path: Option<PathBuf>,
    pub default_role: Role,
    /// Roles by user id, overriding `default_role`.
    pub roles: BTreeMap<String, Role>,
    pub room: RoomConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbox_capacity: 256,
            event_capacity: 1024,
            storage_path: None,
            default_role: Role::Editor,
            roles: BTreeMap::new(),
            room: RoomConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub messages_sent: u64,
    pub messages_dropped: u64,
}

#[derive(Default)]
struct ConnectionCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    counters: Arc<ConnectionCounters>,
    sessions: Arc<AtomicU64>,
}

impl SyncServer {
    /// Build a server, opening RocksDB if a storage path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => {
                let store = RocksSnapshotStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                log::info!("Persisting snapshots to {}", path.display());
                Arc::new(store)
            }
            None => Arc::new(MemorySnapshotStore::new()),
        };
        let roles = config
            .roles
            .iter()
            .fold(StaticRoleResolver::new(config.default_role), |roles, (user, role)| {
                roles.with_role(user.clone(), *role)
            });
        Ok(Self::with_collaborators(config, store, Arc::new(roles)))
    }

    /// Default configuration, in-memory storage.
    pub fn with_defaults() -> Self {
        let config = ServerConfig::default();
        let roles = Arc::new(StaticRoleResolver::new(config.default_role));
        Self::with_collaborators(config, Arc::new(MemorySnapshotStore::new()), roles)
    }

    pub fn with_collaborators(
        config: ServerConfig,
        store: Arc<dyn SnapshotStore>,
        roles: Arc<dyn RoleResolver>,
    ) -> Self {
        let registry = RoomRegistry::new(config.room.clone(), store, roles, config.event_capacity);
        Self {
            config,
            registry,
            counters: Arc::new(ConnectionCounters::default()),
            sessions: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Close every room, saving unsaved documents first.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CollabEvent> {
        self.registry.subscribe()
    }

    pub async fn stats(&self) -> ServerStats {
        let broadcast = self.registry.stats().await;
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            total_messages: self.counters.total_messages.load(Ordering::Relaxed),
            total_bytes: self.counters.total_bytes.load(Ordering::Relaxed),
            active_rooms: self.registry.room_count().await,
            messages_sent: broadcast.messages_sent,
            messages_dropped: broadcast.messages_dropped,
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let connection = Connection {
                registry: self.registry.clone(),
                counters: self.counters.clone(),
                session: self.sessions.fetch_add(1, Ordering::Relaxed),
                outbox_capacity: self.config.outbox_capacity.max(1),
                addr,
            };
            tokio::spawn(async move {
                if let Err(e) = connection.run(stream).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

struct Connection {
    registry: Arc<RoomRegistry>,
    counters: Arc<ConnectionCounters>,
    session: u64,
    outbox_capacity: usize,
    addr: SocketAddr,
}

impl Connection {
    async fn run(self, stream: TcpStream) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        self.counters.active_connections.fetch_add(1, Ordering::Relaxed);

        let result = self.session(&mut ws_sender, &mut ws_receiver).await;

        self.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        let _ = ws_sender.close().await;
        result
    }

    async fn session<S, R>(&self, ws_sender: &mut S, ws_receiver: &mut R) -> Result<(), BoxError>
    where
        S: futures_util::Sink<WsMessage, Error = tungstenite::Error> + Unpin,
        R: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
    {
        let first = match tokio::time::timeout(JOIN_TIMEOUT, self.next_message(ws_receiver)).await {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            Err(_) => {
                log::info!("{} sent no join within {JOIN_TIMEOUT:?}", self.addr);
                return Ok(());
            }
        };
        let room_id = first.room_id;
        let Payload::Join {
            user_id,
            display_name,
            document_id,
            sync,
        } = first.payload
        else {
            log::warn!("{} opened with {} instead of join", self.addr, first.payload.kind());
            let error = CollabError::NotMember { user_id: String::new() };
            let frame = Message::rejected(room_id, None, error, false).encode()?;
            ws_sender.send(WsMessage::Binary(frame.into())).await?;
            return Ok(());
        };

        let (outbox, mut outbox_rx) = mpsc::channel(self.outbox_capacity);
        let request = JoinRequest {
            user_id: user_id.clone(),
            display_name,
            document_id,
            sync,
            session: self.session,
            outbox,
        };
        let handle = match self.registry.join(room_id, request).await {
            Ok(handle) => handle,
            Err(error) => {
                log::info!("{user_id} could not join room {room_id}: {error}");
                let frame = Message::rejected(room_id, None, error, false).encode()?;
                ws_sender.send(WsMessage::Binary(frame.into())).await?;
                return Ok(());
            }
        };
        log::info!("{user_id} connected from {} (session {})", self.addr, self.session);

        let result: Result<(), BoxError> = loop {
            tokio::select! {
                frame = outbox_rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = ws_sender.send(WsMessage::Binary(frame.to_vec().into())).await {
                            break Err(e.into());
                        }
                    }
                    // dropped by the room: left, expired or lagging
                    None => break Ok(()),
                },
                message = self.next_message(ws_receiver) => match message {
                    Some(message) => {
                        if handle.send(&user_id, message).await.is_err() {
                            break Ok(());
                        }
                    }
                    None => break Ok(()),
                },
            }
        };

        handle.leave(&user_id, Some(self.session), LeaveReason::Disconnected).await;
        log::info!("{user_id} disconnected (session {})", self.session);
        result
    }

    /// Next decodable protocol message; `None` once the socket is done.
    async fn next_message<R>(&self, ws_receiver: &mut R) -> Option<Message>
    where
        R: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
    {
        loop {
            match ws_receiver.next().await? {
                Ok(WsMessage::Binary(data)) => {
                    self.counters.total_messages.fetch_add(1, Ordering::Relaxed);
                    self.counters.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                    match Message::decode(&data) {
                        Ok(message) => return Some(message),
                        Err(e) => log::warn!("Undecodable frame from {}: {e}", self.addr),
                    }
                }
                Ok(WsMessage::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => {
                    log::debug!("WebSocket error from {}: {e}", self.addr);
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_config_defaults_and_partial_json() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"bind_addr":"0.0.0.0:7000","room":{"strategy":"first_writer_wins"}}"#).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.outbox_capacity, 256);
        assert_eq!(config.default_role, Role::Editor);
        assert_eq!(config.room.strategy, forma_core::ResolutionStrategy::FirstWriterWins);
        assert!(config.storage_path.is_none());

        // strategies use their snake_case wire names
        assert!(serde_json::from_str::<ServerConfig>(r#"{"room":{"strategy":"FirstWriterWins"}}"#).is_err());
    }

    #[tokio::test]
    async fn test_stats_start_empty() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats, ServerStats::default());
        assert!(server.registry().get(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_roles_from_config() {
        let mut config = ServerConfig::default();
        config.roles.insert("olga".into(), Role::Owner);
        config.default_role = Role::Viewer;
        let server = SyncServer::new(config).unwrap();
        assert_eq!(server.config().roles.get("olga"), Some(&Role::Owner));
    }
}
