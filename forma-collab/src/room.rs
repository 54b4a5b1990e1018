//! Room/session manager.
//!
//! ```text
//!   connection tasks                 room task (one per room)
//! ┌──────────────┐  RoomCommand   ┌───────────────────────────────────┐
//! │ alice (ws)   │ ─────────────► │ documents: AuthoritativeDocument  │
//! │ bob   (ws)   │   (bounded)    │ resolver:  ConflictResolver       │
//! └──────▲───────┘                │ presence:  PresenceTracker        │
//!        │        per-peer        │ peers:     BroadcastGroup         │
//!        └─────── outboxes ◄───── │                                   │
//!                                 └──────┬─────────────────┬──────────┘
//!                                        │ autosave        │ CollabEvent
//!                                        ▼                 ▼
//!                                  SnapshotStore     event subscribers
//! ```
//!
//! A room is created by its first join and destroyed when its last member
//! leaves, after its documents have been saved. Everything a room owns is
//! owned by value inside its task, so operations on one document apply
//! strictly in arrival order without locks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use forma_core::{
    reconcile, AuthoritativeDocument, CollabError, Conflict, ConflictResolver, Document, FieldValue,
    OpKind, Operation, ResolutionStrategy, Role, SyncState,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, BroadcastStats, Frame, Outbox, StatsHandle};
use crate::identity::RoleResolver;
use crate::presence::{PresenceState, PresenceTracker, SelectionRange};
use crate::protocol::{ConflictNotice, Message, ParticipantInfo, Payload, SyncReply};
use crate::storage::SnapshotStore;

const JOIN_ATTEMPTS: usize = 40;
const JOIN_RETRY_DELAY: Duration = Duration::from_millis(25);

// ─── Configuration ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    pub strategy: ResolutionStrategy,
    /// Lamport distance beyond which concurrent edits do not conflict.
    pub conflict_window: Option<u64>,
    pub presence_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub autosave_interval_secs: u64,
    /// Operations kept per document for catch-up.
    pub max_retained_ops: usize,
    pub inbox_capacity: usize,
    pub max_participants: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            strategy: ResolutionStrategy::LastWriterWins,
            conflict_window: None,
            presence_timeout_secs: 5 * 60,
            sweep_interval_secs: 60,
            autosave_interval_secs: 10,
            max_retained_ops: forma_core::oplog::DEFAULT_MAX_RETAINED,
            inbox_capacity: 256,
            max_participants: 100,
        }
    }
}

impl RoomConfig {
    pub fn presence_timeout(&self) -> Duration {
        Duration::from_secs(self.presence_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_interval_secs.max(1))
    }
}

// ─── Events ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaveReason {
    Requested,
    Disconnected,
    /// No activity within the presence timeout.
    Expired,
    /// Outbox overflowed.
    Evicted,
}

/// Informational events for observers (audit, metrics, UI bridges).
#[derive(Debug, Clone)]
pub enum CollabEvent {
    OperationApplied {
        room_id: Uuid,
        operation: Operation,
        version: u64,
    },
    PresenceChanged {
        room_id: Uuid,
        user_id: String,
        state: PresenceState,
    },
    ConflictResolved {
        room_id: Uuid,
        conflict: Conflict,
    },
    DocumentSynced {
        room_id: Uuid,
        document_id: Uuid,
        user_id: String,
        outcome: &'static str,
    },
    UserJoined {
        room_id: Uuid,
        user_id: String,
        role: Role,
    },
    UserLeft {
        room_id: Uuid,
        user_id: String,
        reason: LeaveReason,
    },
}

// ─── Commands & handles ──────────────────────────────────

/// Everything a connection hands over when joining a room.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub user_id: String,
    pub display_name: String,
    pub document_id: Uuid,
    /// Replica state to reconcile; `None` asks for a full snapshot.
    pub sync: Option<SyncState>,
    /// Identifies the connection, so a stale disconnect cannot remove a
    /// newer session of the same user.
    pub session: u64,
    pub outbox: Outbox,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSummary {
    pub state: SyncState,
    pub content: String,
    pub editors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoomSummary {
    pub room_id: Uuid,
    pub participants: Vec<ParticipantInfo>,
    pub active_users: Vec<String>,
    pub documents: Vec<DocumentSummary>,
}

enum RoomCommand {
    Join {
        request: JoinRequest,
        role: Role,
        reply: oneshot::Sender<Result<(), CollabError>>,
    },
    Leave {
        user_id: String,
        session: Option<u64>,
        reason: LeaveReason,
    },
    Inbound {
        user_id: String,
        message: Message,
    },
    Inspect {
        reply: oneshot::Sender<RoomSummary>,
    },
    /// Save and stop; `done` fires once the documents are stored.
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Sending side of a room task.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: Uuid,
    generation: u64,
    commands: mpsc::Sender<RoomCommand>,
    stats: StatsHandle,
}

impl RoomHandle {
    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    /// Forward a decoded message from `user_id`. Waits for inbox capacity.
    pub async fn send(&self, user_id: &str, message: Message) -> Result<(), CollabError> {
        self.commands
            .send(RoomCommand::Inbound {
                user_id: user_id.to_string(),
                message,
            })
            .await
            .map_err(|_| CollabError::TransportUnavailable(format!("room {} closed", self.room_id)))
    }

    pub async fn leave(&self, user_id: &str, session: Option<u64>, reason: LeaveReason) {
        let command = RoomCommand::Leave {
            user_id: user_id.to_string(),
            session,
            reason,
        };
        if self.commands.send(command).await.is_err() {
            log::debug!("Room {} already closed when {user_id} left", self.room_id);
        }
    }

    pub async fn inspect(&self) -> Option<RoomSummary> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(RoomCommand::Inspect { reply }).await.ok()?;
        rx.await.ok()
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats.snapshot()
    }

    /// Close the room whatever its membership. Returns once it has saved
    /// its documents, or at once if it was already gone.
    pub async fn close(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(RoomCommand::Close { done }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

// ─── Registry ────────────────────────────────────────────

/// Maps room ids to running room tasks.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, RoomHandle>>,
    generation: AtomicU64,
    config: RoomConfig,
    store: Arc<dyn SnapshotStore>,
    roles: Arc<dyn RoleResolver>,
    events: broadcast::Sender<CollabEvent>,
}

impl RoomRegistry {
    pub fn new(
        config: RoomConfig,
        store: Arc<dyn SnapshotStore>,
        roles: Arc<dyn RoleResolver>,
        event_capacity: usize,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            config,
            store,
            roles,
            events,
        })
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollabEvent> {
        self.events.subscribe()
    }

    /// Join `room_id`, creating the room if needed.
    ///
    /// The role is resolved before the room sees the request. A room that is
    /// shutting down refuses the join; the attempt is repeated until its
    /// replacement exists.
    pub async fn join(self: &Arc<Self>, room_id: Uuid, request: JoinRequest) -> Result<RoomHandle, CollabError> {
        let role = self.roles.resolve_role(room_id, &request.user_id).await;
        for attempt in 1..=JOIN_ATTEMPTS {
            let handle = self.get_or_create(room_id).await;
            let (reply, rx) = oneshot::channel();
            let command = RoomCommand::Join {
                request: request.clone(),
                role,
                reply,
            };
            if handle.commands.send(command).await.is_ok() {
                if let Ok(result) = rx.await {
                    return result.map(|()| handle);
                }
            }
            log::debug!("Room {room_id} closed during join of {} (attempt {attempt})", request.user_id);
            tokio::time::sleep(JOIN_RETRY_DELAY).await;
        }
        Err(CollabError::TransportUnavailable(format!("room {room_id} is shutting down")))
    }

    async fn get_or_create(self: &Arc<Self>, room_id: Uuid) -> RoomHandle {
        {
            let rooms = self.rooms.read().await;
            if let Some(handle) = rooms.get(&room_id) {
                return handle.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(handle) = rooms.get(&room_id) {
            return handle.clone();
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (commands, inbox) = mpsc::channel(self.config.inbox_capacity.max(1));
        let room = Room::new(room_id, generation, self, inbox);
        let handle = RoomHandle {
            room_id,
            generation,
            commands,
            stats: room.peers.stats_handle(),
        };
        rooms.insert(room_id, handle.clone());
        tokio::spawn(room.run());
        log::info!("Room {room_id} created");
        handle
    }

    /// Forget a room, unless it has already been replaced.
    async fn remove(&self, room_id: Uuid, generation: u64) -> bool {
        let mut rooms = self.rooms.write().await;
        if rooms.get(&room_id).is_some_and(|h| h.generation == generation) {
            rooms.remove(&room_id);
            return true;
        }
        false
    }

    pub async fn get(&self, room_id: Uuid) -> Option<RoomHandle> {
        self.rooms.read().await.get(&room_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_ids(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().copied().collect()
    }

    /// Users with fresh, non-offline presence in `room_id`.
    pub async fn active_users(&self, room_id: Uuid) -> Vec<String> {
        match self.get(room_id).await {
            Some(handle) => handle.inspect().await.map(|s| s.active_users).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Close every running room and wait for their final saves.
    pub async fn shutdown(&self) {
        let handles: Vec<RoomHandle> = self.rooms.read().await.values().cloned().collect();
        if handles.is_empty() {
            return;
        }
        log::info!("Closing {} room(s)", handles.len());
        futures_util::future::join_all(handles.iter().map(RoomHandle::close)).await;
    }

    pub async fn stats(&self) -> BroadcastStats {
        let rooms = self.rooms.read().await;
        rooms.values().fold(BroadcastStats::default(), |mut total, handle| {
            let stats = handle.stats();
            total.messages_sent += stats.messages_sent;
            total.messages_dropped += stats.messages_dropped;
            total.active_peers += stats.active_peers;
            total
        })
    }
}

// ─── Room task ───────────────────────────────────────────

/// What the room does with an operation that took part in a conflict.
struct Verdict {
    apply: bool,
    resync: bool,
}

struct Room {
    id: Uuid,
    generation: u64,
    config: RoomConfig,
    documents: HashMap<Uuid, AuthoritativeDocument>,
    resolver: ConflictResolver,
    participants: BTreeMap<String, ParticipantInfo>,
    editors: HashMap<Uuid, BTreeSet<String>>,
    presence: PresenceTracker,
    peers: BroadcastGroup,
    /// Users whose outbox overflowed, removed after the current command.
    evicted: Vec<String>,
    store: Arc<dyn SnapshotStore>,
    events: broadcast::Sender<CollabEvent>,
    registry: Weak<RoomRegistry>,
    inbox: mpsc::Receiver<RoomCommand>,
    /// Set by a close request; answered after the final save.
    closing: Option<oneshot::Sender<()>>,
}

impl Room {
    fn new(id: Uuid, generation: u64, registry: &Arc<RoomRegistry>, inbox: mpsc::Receiver<RoomCommand>) -> Self {
        let config = registry.config.clone();
        Self {
            id,
            generation,
            resolver: ConflictResolver::new(config.strategy).with_window(config.conflict_window),
            presence: PresenceTracker::with_timeout(id, config.presence_timeout()),
            config,
            documents: HashMap::new(),
            participants: BTreeMap::new(),
            editors: HashMap::new(),
            peers: BroadcastGroup::new(),
            evicted: Vec::new(),
            store: registry.store.clone(),
            events: registry.events.clone(),
            registry: Arc::downgrade(registry),
            inbox,
            closing: None,
        }
    }

    async fn run(mut self) {
        let sweep_period = self.config.sweep_interval();
        let autosave_period = self.config.autosave_interval();
        let mut sweep = interval_at(Instant::now() + sweep_period, sweep_period);
        let mut autosave = interval_at(Instant::now() + autosave_period, autosave_period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        autosave.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let membership_changed = tokio::select! {
                command = self.inbox.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = sweep.tick() => {
                    self.sweep();
                    true
                }
                _ = autosave.tick() => {
                    self.autosave();
                    false
                }
            };
            let evicted = self.drain_evictions();
            if self.closing.is_some() || ((membership_changed || evicted) && self.participants.is_empty()) {
                break;
            }
        }
        self.shutdown().await;
    }

    /// Returns whether membership may have changed.
    async fn handle(&mut self, command: RoomCommand) -> bool {
        match command {
            RoomCommand::Join { request, role, reply } => {
                let result = self.join(request, role).await;
                let _ = reply.send(result);
                true
            }
            RoomCommand::Leave { user_id, session, reason } => {
                self.leave(&user_id, session, reason);
                true
            }
            RoomCommand::Inbound { user_id, message } => {
                self.handle_inbound(&user_id, message).await;
                !self.participants.contains_key(&user_id)
            }
            RoomCommand::Inspect { reply } => {
                let _ = reply.send(self.summary());
                false
            }
            RoomCommand::Close { done } => {
                self.closing = Some(done);
                false
            }
        }
    }

    async fn shutdown(mut self) {
        self.inbox.close();
        for authority in self.documents.values_mut() {
            if !authority.take_dirty() {
                continue;
            }
            let snapshot = authority.snapshot();
            match self.store.save_snapshot(snapshot.document_id, snapshot.version, &snapshot).await {
                Ok(()) => log::info!(
                    "Saved document {} at version {} (room {} closing)",
                    snapshot.document_id,
                    snapshot.version,
                    self.id
                ),
                Err(e) => log::error!("Failed to save document {}: {e}", snapshot.document_id),
            }
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id, self.generation).await;
        }
        log::info!("Room {} destroyed", self.id);
        if let Some(done) = self.closing.take() {
            let _ = done.send(());
        }
    }

    // ─── Membership ──────────────────────────────────────

    async fn join(&mut self, request: JoinRequest, role: Role) -> Result<(), CollabError> {
        let JoinRequest {
            user_id,
            display_name,
            document_id,
            sync,
            session,
            outbox,
        } = request;
        if !self.participants.contains_key(&user_id) && self.participants.len() >= self.config.max_participants {
            log::warn!("Room {} is full, refusing {user_id}", self.id);
            return Err(CollabError::RoomFull(self.id));
        }
        self.open_document(document_id).await?;

        let info = ParticipantInfo {
            user_id: user_id.clone(),
            display_name: display_name.clone(),
            role,
            joined_at: forma_core::now_millis(),
        };
        self.participants.insert(user_id.clone(), info);
        self.editors.entry(document_id).or_default().insert(user_id.clone());
        self.peers.add_peer(&user_id, session, outbox);
        self.presence.update_presence(&user_id, PresenceState::Online);

        let participants = self.participants.values().cloned().collect();
        self.send_to(
            &user_id,
            Payload::Joined {
                user_id: user_id.clone(),
                role,
                strategy: self.resolver.strategy(),
                participants,
            },
        );
        self.fan_out(
            Payload::Join {
                user_id: user_id.clone(),
                display_name,
                document_id,
                sync: None,
            },
            Some(&user_id),
        );
        match sync {
            Some(state) => self.sync(&user_id, state, false),
            None => self.sync_snapshot(&user_id, document_id),
        }

        log::info!("{user_id} joined room {} as {role}", self.id);
        self.emit(CollabEvent::UserJoined {
            room_id: self.id,
            user_id,
            role,
        });
        Ok(())
    }

    async fn open_document(&mut self, document_id: Uuid) -> Result<(), CollabError> {
        if self.documents.contains_key(&document_id) {
            return Ok(());
        }
        let max_retained = self.config.max_retained_ops;
        let authority = match self.store.load_snapshot(document_id).await {
            Ok(Some(snapshot)) => {
                log::info!("Loaded document {document_id} at version {}", snapshot.version);
                AuthoritativeDocument::from_snapshot(snapshot, max_retained)
            }
            Ok(None) => AuthoritativeDocument::new(Document::new(document_id), max_retained),
            Err(e) => {
                log::error!("Failed to load document {document_id}: {e}");
                return Err(CollabError::UnknownDocument(document_id));
            }
        };
        self.documents.insert(document_id, authority);
        Ok(())
    }

    fn leave(&mut self, user_id: &str, session: Option<u64>, reason: LeaveReason) {
        if let (Some(session), Some(current)) = (session, self.peers.session_of(user_id)) {
            if session != current {
                log::debug!("Ignoring leave of stale session {session} for {user_id}");
                return;
            }
        }
        if self.participants.remove(user_id).is_none() {
            return;
        }
        self.peers.remove_peer(user_id, None);
        self.presence.remove(user_id);
        for editors in self.editors.values_mut() {
            editors.remove(user_id);
        }
        self.fan_out(
            Payload::Leave {
                user_id: user_id.to_string(),
            },
            None,
        );
        log::info!("{user_id} left room {} ({reason:?})", self.id);
        self.emit(CollabEvent::UserLeft {
            room_id: self.id,
            user_id: user_id.to_string(),
            reason,
        });
    }

    /// Returns whether anyone was evicted.
    fn drain_evictions(&mut self) -> bool {
        let mut any = false;
        while let Some(user_id) = self.evicted.pop() {
            log::warn!("Evicting {user_id} from room {}: outbox full", self.id);
            self.leave(&user_id, None, LeaveReason::Evicted);
            any = true;
        }
        any
    }

    fn sweep(&mut self) {
        for user_id in self.presence.sweep() {
            if self.participants.contains_key(&user_id) {
                self.leave(&user_id, None, LeaveReason::Expired);
            }
        }
    }

    fn autosave(&mut self) {
        for authority in self.documents.values_mut() {
            if !authority.take_dirty() {
                continue;
            }
            let snapshot = authority.snapshot();
            let store = self.store.clone();
            tokio::spawn(async move {
                let (document_id, version) = (snapshot.document_id, snapshot.version);
                match store.save_snapshot(document_id, version, &snapshot).await {
                    Ok(()) => log::debug!("Autosaved document {document_id} at version {version}"),
                    Err(e) => log::error!("Autosave of document {document_id} failed: {e}"),
                }
            });
        }
    }

    fn summary(&self) -> RoomSummary {
        let mut documents: Vec<DocumentSummary> = self
            .documents
            .values()
            .map(|authority| {
                let state = authority.sync_state();
                DocumentSummary {
                    state,
                    content: authority.document().content(),
                    editors: self
                        .editors
                        .get(&state.document_id)
                        .map(|set| set.iter().cloned().collect())
                        .unwrap_or_default(),
                }
            })
            .collect();
        documents.sort_by_key(|d| d.state.document_id);
        RoomSummary {
            room_id: self.id,
            participants: self.participants.values().cloned().collect(),
            active_users: self.presence.active_users().into_iter().map(|r| r.user_id).collect(),
            documents,
        }
    }

    // ─── Inbound messages ────────────────────────────────

    async fn handle_inbound(&mut self, user_id: &str, message: Message) {
        if message.room_id != self.id {
            log::warn!("Dropping {} for room {} sent to room {}", message.payload.kind(), message.room_id, self.id);
            return;
        }
        if !self.participants.contains_key(user_id) {
            log::warn!("Dropping {} from non-member {user_id}", message.payload.kind());
            return;
        }
        log::trace!("Room {} received {} from {user_id}", self.id, message.payload.kind());

        match message.payload {
            Payload::Operation { operation, .. } => self.handle_operation(user_id, operation),
            Payload::Presence { state, .. } => self.update_presence(user_id, state),
            Payload::Cursor { document_id, position, .. } => self.move_cursor(user_id, document_id, position),
            Payload::Selection { document_id, range, .. } => self.select(user_id, document_id, range),
            Payload::Sync(request) => self.sync(user_id, request.state, request.force_snapshot),
            Payload::Heartbeat { nonce, reply } => {
                self.presence.touch(user_id);
                if !reply {
                    self.send_to(user_id, Payload::Heartbeat { nonce, reply: true });
                }
            }
            Payload::Leave { .. } => self.leave(user_id, None, LeaveReason::Requested),
            Payload::Join { document_id, sync, .. } => {
                // an existing member opening another document
                if let Err(error) = self.open_document(document_id).await {
                    self.reject(user_id, None, error, false);
                    return;
                }
                self.editors.entry(document_id).or_default().insert(user_id.to_string());
                match sync {
                    Some(state) => self.sync(user_id, state, false),
                    None => self.sync_snapshot(user_id, document_id),
                }
            }
            other => log::warn!("Ignoring {} message from {user_id}", other.kind()),
        }
    }

    fn is_editing(&self, user_id: &str, document_id: Uuid) -> bool {
        self.editors
            .get(&document_id)
            .is_some_and(|editors| editors.contains(user_id))
    }

    fn role_of(&self, user_id: &str) -> Role {
        self.participants
            .get(user_id)
            .map(|info| info.role)
            .unwrap_or_default()
    }

    fn handle_operation(&mut self, user_id: &str, op: Operation) {
        let operation_id = op.id();
        match op.kind() {
            OpKind::Cursor { position } => return self.move_cursor(user_id, op.document_id(), *position),
            OpKind::Selection { position, length } => {
                let range = SelectionRange {
                    position: *position,
                    length: *length,
                };
                return self.select(user_id, op.document_id(), range);
            }
            _ => {}
        }
        if op.author_id() != user_id {
            let error = CollabError::NotMember {
                user_id: op.author_id().to_string(),
            };
            return self.reject(user_id, Some(operation_id), error, false);
        }
        let role = self.role_of(user_id);
        if !role.can_write() {
            log::info!("Refusing {} from {user_id}: role {role} is read-only", op.kind().name());
            let error = CollabError::PermissionDenied {
                user_id: user_id.to_string(),
                role,
            };
            return self.reject(user_id, Some(operation_id), error, true);
        }
        if !self.is_editing(user_id, op.document_id()) {
            return self.reject(user_id, Some(operation_id), CollabError::UnknownDocument(op.document_id()), false);
        }
        let Some(authority) = self.documents.get(&op.document_id()) else {
            return self.reject(user_id, Some(operation_id), CollabError::UnknownDocument(op.document_id()), false);
        };

        if let Some(entry) = authority.log().get(&operation_id) {
            let version = entry.version;
            log::debug!("Re-acknowledging duplicate {operation_id} from {user_id}");
            self.send_to(user_id, Payload::Ack { operation_id, version });
            return;
        }
        let concurrent = match authority.rebase(&op).and_then(|_| authority.concurrent_with(&op)) {
            Ok(concurrent) => concurrent,
            Err(CollabError::ConflictLost { winner, .. }) => {
                return match authority.log().get(&winner).map(|entry| entry.operation.clone()) {
                    Some(winner) => self.settle(user_id, op, winner),
                    None => {
                        let error = CollabError::ConflictLost { operation_id, winner };
                        self.reject(user_id, Some(operation_id), error, true)
                    }
                };
            }
            Err(error) => {
                log::debug!("Refusing {operation_id} from {user_id}: {error}");
                let resync = error.requires_resync();
                return self.reject(user_id, Some(operation_id), error, resync);
            }
        };

        let mut conflict = self.resolver.detect(&op, &concurrent);
        let verdict = match conflict.as_mut() {
            Some(conflict) => self.arbitrate(conflict),
            None => Verdict {
                apply: true,
                resync: false,
            },
        };

        if verdict.apply {
            self.sequence(user_id, op);
        } else if let Some(winner) = conflict.as_ref().and_then(|c| c.winner.as_ref()) {
            let error = CollabError::ConflictLost {
                operation_id,
                winner: winner.id(),
            };
            self.reject(user_id, Some(operation_id), error, verdict.resync);
        }

        if let Some(conflict) = conflict {
            self.publish_conflict(conflict);
        }
    }

    /// Decide whether the incoming operation may take effect.
    ///
    /// Applying an operation transforms it, and for field updates the
    /// transform already lets the greatest `(timestamp, author, id)` win.
    /// When the configured strategy picks a different winner, the incoming
    /// operation is refused or the winner's value is re-issued afterwards.
    fn arbitrate(&self, conflict: &mut Conflict) -> Verdict {
        let Some(resolution) = self.resolver.resolve(conflict, |user| self.role_of(user)) else {
            return Verdict {
                apply: true,
                resync: false,
            };
        };
        let Some(incoming) = conflict.operations.first() else {
            return Verdict {
                apply: true,
                resync: false,
            };
        };
        if self.resolver.strategy() == ResolutionStrategy::OperationalTransform {
            return Verdict {
                apply: true,
                resync: false,
            };
        }

        let natural = match incoming.kind() {
            OpKind::Update { .. } => conflict
                .operations
                .iter()
                .max_by(|a, b| a.precedence().cmp(&b.precedence()))
                .map_or(incoming.id(), Operation::id),
            _ => incoming.id(),
        };
        let winner = resolution.winner.id();
        let apply = winner == natural || winner == incoming.id();
        Verdict {
            apply,
            // the sender saw its own edit win locally
            resync: !apply && natural == incoming.id(),
        }
    }

    /// The incoming operation clashes with `winner`, which was sequenced
    /// first. Its author's engine drops it on its own, so no resync.
    fn settle(&mut self, user_id: &str, op: Operation, winner: Operation) {
        let operation_id = op.id();
        log::info!(
            "{} {operation_id} from {user_id} lost to sequenced {} {}",
            op.kind().name(),
            winner.kind().name(),
            winner.id()
        );
        let error = CollabError::ConflictLost {
            operation_id,
            winner: winner.id(),
        };
        self.reject(user_id, Some(operation_id), error, false);
        self.publish_conflict(Conflict::settled(op, winner));
    }

    fn sequence(&mut self, user_id: &str, op: Operation) {
        let operation_id = op.id();
        let Some(authority) = self.documents.get_mut(&op.document_id()) else {
            return;
        };
        match authority.apply_sequenced(op) {
            Ok(sequenced) if sequenced.duplicate => {
                self.send_to(
                    user_id,
                    Payload::Ack {
                        operation_id,
                        version: sequenced.version,
                    },
                );
            }
            Ok(sequenced) => {
                self.publish_operation(sequenced.operation.clone(), sequenced.version, Some(user_id));
                self.send_to(
                    user_id,
                    Payload::Ack {
                        operation_id,
                        version: sequenced.version,
                    },
                );
            }
            Err(error) => {
                log::debug!("Refusing {operation_id} from {user_id}: {error}");
                let resync = error.requires_resync();
                self.reject(user_id, Some(operation_id), error, resync);
            }
        }
    }

    fn publish_operation(&mut self, operation: Operation, version: u64, except: Option<&str>) {
        self.presence.transform_cursors(&operation);
        let document_id = operation.document_id();
        self.fan_out_document(
            document_id,
            Payload::Operation {
                operation: operation.clone(),
                version,
            },
            except,
        );
        self.emit(CollabEvent::OperationApplied {
            room_id: self.id,
            operation,
            version,
        });
    }

    fn publish_conflict(&mut self, conflict: Conflict) {
        if let Some(notice) = ConflictNotice::from_conflict(&conflict) {
            self.fan_out_document(conflict.document_id, Payload::Conflict(notice), None);
        }
        self.reissue_winner(&conflict);
        self.emit(CollabEvent::ConflictResolved {
            room_id: self.id,
            conflict,
        });
    }

    /// Make the canonical field hold the winning update's value.
    fn reissue_winner(&mut self, conflict: &Conflict) {
        let Some(winner) = conflict.winner.as_ref() else {
            return;
        };
        let OpKind::Update { path, value } = winner.kind() else {
            return;
        };
        let Some(authority) = self.documents.get_mut(&conflict.document_id) else {
            return;
        };
        if holds(authority.document(), path, value) {
            return;
        }
        let kind = OpKind::Update {
            path: path.clone(),
            value: value.clone(),
        };
        match authority.issue(kind, winner.author_id()) {
            Ok(sequenced) => {
                log::debug!("Re-issued winning value of '{path}' at version {}", sequenced.version);
                self.publish_operation(sequenced.operation, sequenced.version, None);
            }
            Err(e) => log::error!("Failed to re-issue winner of conflict {}: {e}", conflict.id),
        }
    }

    // ─── Presence ────────────────────────────────────────

    fn update_presence(&mut self, user_id: &str, state: PresenceState) {
        self.presence.update_presence(user_id, state);
        self.fan_out(
            Payload::Presence {
                user_id: user_id.to_string(),
                state,
            },
            Some(user_id),
        );
        self.emit(CollabEvent::PresenceChanged {
            room_id: self.id,
            user_id: user_id.to_string(),
            state,
        });
    }

    fn move_cursor(&mut self, user_id: &str, document_id: Uuid, position: usize) {
        let Some(authority) = self.documents.get(&document_id) else {
            return;
        };
        let position = position.min(authority.document().len());
        self.presence.update_cursor(user_id, document_id, position);
        self.fan_out_document(
            document_id,
            Payload::Cursor {
                user_id: user_id.to_string(),
                document_id,
                position,
            },
            Some(user_id),
        );
    }

    fn select(&mut self, user_id: &str, document_id: Uuid, range: SelectionRange) {
        let Some(authority) = self.documents.get(&document_id) else {
            return;
        };
        let len = authority.document().len();
        let position = range.position.min(len);
        let range = SelectionRange {
            position,
            length: range.length.min(len - position),
        };
        self.presence.update_selection(user_id, document_id, range);
        self.fan_out_document(
            document_id,
            Payload::Selection {
                user_id: user_id.to_string(),
                document_id,
                range,
            },
            Some(user_id),
        );
    }

    // ─── Synchronization ─────────────────────────────────

    fn sync(&mut self, user_id: &str, state: SyncState, force_snapshot: bool) {
        let document_id = state.document_id;
        if !self.is_editing(user_id, document_id) {
            return self.reject(user_id, None, CollabError::UnknownDocument(document_id), false);
        }
        let Some(authority) = self.documents.get(&document_id) else {
            return self.reject(user_id, None, CollabError::UnknownDocument(document_id), false);
        };
        let decision = reconcile(authority, &state, force_snapshot);
        let outcome = decision.kind();
        log::debug!(
            "Sync of {document_id} for {user_id}: client at {}, room at {} -> {outcome}",
            state.version,
            authority.version()
        );
        match SyncReply::from_decision(document_id, authority.version(), decision) {
            Ok(reply) => self.send_to(user_id, Payload::SyncReply(reply)),
            Err(e) => {
                log::error!("Failed to build sync reply for {user_id}: {e}");
                return;
            }
        }
        self.emit(CollabEvent::DocumentSynced {
            room_id: self.id,
            document_id,
            user_id: user_id.to_string(),
            outcome,
        });
    }

    fn sync_snapshot(&mut self, user_id: &str, document_id: Uuid) {
        if let Some(state) = self.documents.get(&document_id).map(AuthoritativeDocument::sync_state) {
            self.sync(user_id, state, true);
        }
    }

    // ─── Outbound ────────────────────────────────────────

    fn reject(&mut self, user_id: &str, operation_id: Option<Uuid>, error: CollabError, resync: bool) {
        self.send_to(
            user_id,
            Payload::Rejected {
                operation_id,
                error,
                resync,
            },
        );
    }

    fn frame(&self, payload: Payload) -> Option<Frame> {
        match Message::new(self.id, payload).encode() {
            Ok(bytes) => Some(Arc::new(bytes)),
            Err(e) => {
                log::error!("Failed to encode message in room {}: {e}", self.id);
                None
            }
        }
    }

    fn send_to(&mut self, user_id: &str, payload: Payload) {
        let Some(frame) = self.frame(payload) else {
            return;
        };
        if !self.peers.send_to(user_id, frame) && self.participants.contains_key(user_id) {
            self.evicted.push(user_id.to_string());
        }
    }

    fn fan_out(&mut self, payload: Payload, except: Option<&str>) {
        let Some(frame) = self.frame(payload) else {
            return;
        };
        let lagging = self.peers.broadcast(frame, except);
        self.evicted.extend(lagging);
    }

    /// Send to the editors of one document.
    fn fan_out_document(&mut self, document_id: Uuid, payload: Payload, except: Option<&str>) {
        let Some(frame) = self.frame(payload) else {
            return;
        };
        let recipients: Vec<String> = self
            .editors
            .get(&document_id)
            .map(|editors| {
                editors
                    .iter()
                    .filter(|user| Some(user.as_str()) != except)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for user_id in recipients {
            if !self.peers.send_to(&user_id, frame.clone()) && self.participants.contains_key(&user_id) {
                self.evicted.push(user_id);
            }
        }
    }

    fn emit(&self, event: CollabEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

fn holds(document: &Document, path: &str, value: &FieldValue) -> bool {
    match document.property(path) {
        Some(current) => current == value,
        None => value.is_null(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticRoleResolver;
    use crate::protocol::{decode_snapshot, SyncOutcome};
    use crate::storage::MemorySnapshotStore;
    use forma_core::SnapshotReason;

    struct Member {
        user_id: String,
        handle: RoomHandle,
        outbox: mpsc::Receiver<Frame>,
    }

    impl Member {
        async fn next(&mut self) -> Payload {
            let frame = tokio::time::timeout(Duration::from_secs(2), self.outbox.recv())
                .await
                .expect("timed out waiting for a frame")
                .expect("outbox closed");
            Message::decode(&frame).unwrap().payload
        }

        /// Skip frames until one matches.
        async fn expect(&mut self, matches: impl Fn(&Payload) -> bool) -> Payload {
            loop {
                let payload = self.next().await;
                if matches(&payload) {
                    return payload;
                }
            }
        }

        fn quiet(&mut self) -> bool {
            self.outbox.try_recv().is_err()
        }

        async fn submit(&self, operation: Operation) {
            let message = Message::operation(self.handle.room_id(), operation, 0);
            self.handle.send(&self.user_id, message).await.unwrap();
        }
    }

    fn registry(strategy: ResolutionStrategy, roles: StaticRoleResolver) -> Arc<RoomRegistry> {
        let config = RoomConfig {
            strategy,
            ..RoomConfig::default()
        };
        RoomRegistry::new(config, Arc::new(MemorySnapshotStore::new()), Arc::new(roles), 64)
    }

    async fn join(registry: &Arc<RoomRegistry>, room: Uuid, doc: Uuid, user: &str) -> Member {
        let (outbox, rx) = mpsc::channel(64);
        let request = JoinRequest {
            user_id: user.to_string(),
            display_name: user.to_uppercase(),
            document_id: doc,
            sync: None,
            session: 1,
            outbox,
        };
        let handle = registry.join(room, request).await.unwrap();
        let mut member = Member {
            user_id: user.to_string(),
            handle,
            outbox: rx,
        };
        member.expect(|p| matches!(p, Payload::SyncReply(_))).await;
        member
    }

    fn insert(doc: Uuid, author: &str, position: usize, text: &str, base: u64) -> Operation {
        Operation::new(OpKind::Insert { position, text: text.into() }, doc, author, base + 1).rebased(base)
    }

    #[tokio::test]
    async fn test_join_sends_joined_and_snapshot() {
        let registry = registry(ResolutionStrategy::LastWriterWins, StaticRoleResolver::default());
        let (room, doc) = (Uuid::new_v4(), Uuid::new_v4());
        let (outbox, mut rx) = mpsc::channel(16);
        let request = JoinRequest {
            user_id: "alice".into(),
            display_name: "Alice".into(),
            document_id: doc,
            sync: None,
            session: 1,
            outbox,
        };
        registry.join(room, request).await.unwrap();

        let joined = Message::decode(&rx.recv().await.unwrap()).unwrap().payload;
        assert!(matches!(joined, Payload::Joined { role: Role::Editor, .. }));
        match Message::decode(&rx.recv().await.unwrap()).unwrap().payload {
            Payload::SyncReply(SyncReply {
                outcome: SyncOutcome::Snapshot { reason, data, .. },
                ..
            }) => {
                assert_eq!(reason, SnapshotReason::Requested);
                assert_eq!(decode_snapshot(&data).unwrap().version, 0);
            }
            other => panic!("unexpected {}", other.kind()),
        }
        assert_eq!(registry.room_count().await, 1);
        assert_eq!(registry.active_users(room).await, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_operation_acked_and_broadcast() {
        let registry = registry(ResolutionStrategy::LastWriterWins, StaticRoleResolver::default());
        let (room, doc) = (Uuid::new_v4(), Uuid::new_v4());
        let mut alice = join(&registry, room, doc, "alice").await;
        let mut bob = join(&registry, room, doc, "bob").await;

        let op = insert(doc, "alice", 0, "Hello", 0);
        alice.submit(op.clone()).await;

        let ack = alice.expect(|p| matches!(p, Payload::Ack { .. })).await;
        assert_eq!(ack, Payload::Ack { operation_id: op.id(), version: 1 });
        match bob.expect(|p| matches!(p, Payload::Operation { .. })).await {
            Payload::Operation { operation, version } => {
                assert_eq!(operation.id(), op.id());
                assert_eq!(version, 1);
            }
            other => panic!("unexpected {}", other.kind()),
        }

        // resubmission is acknowledged again, not re-applied
        alice.submit(op.clone()).await;
        let ack = alice.expect(|p| matches!(p, Payload::Ack { .. })).await;
        assert_eq!(ack, Payload::Ack { operation_id: op.id(), version: 1 });
        let summary = alice.handle.inspect().await.unwrap();
        assert_eq!(summary.documents[0].content, "Hello");
        assert_eq!(summary.documents[0].state.version, 1);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_converge() {
        let registry = registry(ResolutionStrategy::LastWriterWins, StaticRoleResolver::default());
        let (room, doc) = (Uuid::new_v4(), Uuid::new_v4());
        let mut user1 = join(&registry, room, doc, "user1").await;
        let mut user2 = join(&registry, room, doc, "user2").await;

        user1.submit(insert(doc, "user1", 0, "Hello", 0)).await;
        user1.expect(|p| matches!(p, Payload::Ack { .. })).await;
        user2.expect(|p| matches!(p, Payload::Operation { .. })).await;

        user1.submit(insert(doc, "user1", 5, " World", 1)).await;
        user2.submit(insert(doc, "user2", 5, "!", 1)).await;
        user1.expect(|p| matches!(p, Payload::Ack { .. })).await;
        user2.expect(|p| matches!(p, Payload::Ack { .. })).await;

        let summary = user1.handle.inspect().await.unwrap();
        assert_eq!(summary.documents[0].content, "Hello World!");
        assert_eq!(summary.documents[0].state.version, 3);
    }

    #[tokio::test]
    async fn test_viewer_write_rejected_without_broadcast() {
        let roles = StaticRoleResolver::new(Role::Editor).with_role("vera", Role::Viewer);
        let registry = registry(ResolutionStrategy::LastWriterWins, roles);
        let (room, doc) = (Uuid::new_v4(), Uuid::new_v4());
        let mut editor = join(&registry, room, doc, "eve").await;
        let mut viewer = join(&registry, room, doc, "vera").await;
        editor.expect(|p| matches!(p, Payload::Join { .. })).await;

        let op = insert(doc, "vera", 0, "nope", 0);
        viewer.submit(op.clone()).await;
        match viewer.expect(|p| matches!(p, Payload::Rejected { .. })).await {
            Payload::Rejected { operation_id, error, .. } => {
                assert_eq!(operation_id, Some(op.id()));
                assert!(matches!(error, CollabError::PermissionDenied { role: Role::Viewer, .. }));
            }
            other => panic!("unexpected {}", other.kind()),
        }

        let summary = editor.handle.inspect().await.unwrap();
        assert_eq!(summary.documents[0].content, "");
        assert!(editor.quiet());
    }

    #[tokio::test]
    async fn test_first_writer_wins_rejects_later_update() {
        let registry = registry(ResolutionStrategy::FirstWriterWins, StaticRoleResolver::default());
        let (room, doc) = (Uuid::new_v4(), Uuid::new_v4());
        let mut alice = join(&registry, room, doc, "alice").await;
        let mut bob = join(&registry, room, doc, "bob").await;

        let update = |author: &str, ts: u64, value: &str| {
            Operation::new(OpKind::Update { path: "title".into(), value: value.into() }, doc, author, ts)
        };
        let first = update("alice", 1, "Signup");
        let later = update("bob", 5, "Register");
        alice.submit(first.clone()).await;
        alice.expect(|p| matches!(p, Payload::Ack { .. })).await;
        bob.submit(later.clone()).await;

        match bob.expect(|p| matches!(p, Payload::Rejected { .. })).await {
            Payload::Rejected { error, resync, .. } => {
                assert_eq!(
                    error,
                    CollabError::ConflictLost { operation_id: later.id(), winner: first.id() }
                );
                assert!(resync);
            }
            other => panic!("unexpected {}", other.kind()),
        }
        match alice.expect(|p| matches!(p, Payload::Conflict(_))).await {
            Payload::Conflict(notice) => {
                assert_eq!(notice.winner, first.id());
                assert_eq!(notice.losers, vec![later.id()]);
                assert_eq!(notice.strategy, ResolutionStrategy::FirstWriterWins);
            }
            other => panic!("unexpected {}", other.kind()),
        }
        let summary = alice.handle.inspect().await.unwrap();
        assert_eq!(summary.documents[0].state.version, 1);
    }

    #[tokio::test]
    async fn test_priority_reissues_owner_value() {
        let roles = StaticRoleResolver::new(Role::Editor).with_role("olga", Role::Owner);
        let registry = registry(ResolutionStrategy::Priority, roles);
        let (room, doc) = (Uuid::new_v4(), Uuid::new_v4());
        let mut ed = join(&registry, room, doc, "ed").await;
        let mut olga = join(&registry, room, doc, "olga").await;

        let update = |author: &str, ts: u64, value: &str| {
            Operation::new(OpKind::Update { path: "title".into(), value: value.into() }, doc, author, ts)
        };
        ed.submit(update("ed", 9, "Editor title")).await;
        ed.expect(|p| matches!(p, Payload::Ack { .. })).await;
        olga.submit(update("olga", 2, "Owner title")).await;
        olga.expect(|p| matches!(p, Payload::Ack { .. })).await;

        // the owner's older edit loses the transform, so the room re-issues it
        match ed.expect(|p| matches!(p, Payload::Operation { operation, .. } if !operation.is_noop())).await {
            Payload::Operation { operation, version } => {
                assert_eq!(version, 3);
                assert_eq!(operation.author_id(), "olga");
            }
            other => panic!("unexpected {}", other.kind()),
        }
        let events_room = ed.handle.inspect().await.unwrap();
        assert_eq!(events_room.documents[0].state.version, 3);
    }

    #[tokio::test]
    async fn test_leave_destroys_empty_room_and_saves() {
        let store = Arc::new(MemorySnapshotStore::new());
        let registry = RoomRegistry::new(
            RoomConfig::default(),
            store.clone(),
            Arc::new(StaticRoleResolver::default()),
            16,
        );
        let mut events = registry.subscribe();
        let (room, doc) = (Uuid::new_v4(), Uuid::new_v4());
        let mut alice = join(&registry, room, doc, "alice").await;
        alice.submit(insert(doc, "alice", 0, "kept", 0)).await;
        alice.expect(|p| matches!(p, Payload::Ack { .. })).await;

        alice.handle.leave("alice", Some(1), LeaveReason::Disconnected).await;
        for _ in 0..100 {
            if registry.room_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.room_count().await, 0);
        let saved = store.load_snapshot(doc).await.unwrap().unwrap();
        assert_eq!(saved.content, "kept");

        let mut saw_leave = false;
        while let Ok(event) = events.try_recv() {
            if let CollabEvent::UserLeft { reason, .. } = event {
                assert_eq!(reason, LeaveReason::Disconnected);
                saw_leave = true;
            }
        }
        assert!(saw_leave);

        // rejoining loads the saved document
        let mut again = join(&registry, room, doc, "alice").await;
        let summary = again.handle.inspect().await.unwrap();
        assert_eq!(summary.documents[0].content, "kept");
        assert!(again.quiet());
    }

    #[tokio::test]
    async fn test_stale_session_leave_ignored() {
        let registry = registry(ResolutionStrategy::LastWriterWins, StaticRoleResolver::default());
        let (room, doc) = (Uuid::new_v4(), Uuid::new_v4());
        let alice = join(&registry, room, doc, "alice").await;
        alice.handle.leave("alice", Some(99), LeaveReason::Disconnected).await;
        let summary = alice.handle.inspect().await.unwrap();
        assert_eq!(summary.participants.len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_reply_and_presence_broadcast() {
        let registry = registry(ResolutionStrategy::LastWriterWins, StaticRoleResolver::default());
        let (room, doc) = (Uuid::new_v4(), Uuid::new_v4());
        let mut alice = join(&registry, room, doc, "alice").await;
        let mut bob = join(&registry, room, doc, "bob").await;

        alice.handle.send("alice", Message::heartbeat(room, 7)).await.unwrap();
        let reply = alice.expect(|p| matches!(p, Payload::Heartbeat { .. })).await;
        assert_eq!(reply, Payload::Heartbeat { nonce: 7, reply: true });

        let away = Message::new(room, Payload::Presence { user_id: "alice".into(), state: PresenceState::Away });
        alice.handle.send("alice", away).await.unwrap();
        let presence = bob.expect(|p| matches!(p, Payload::Presence { .. })).await;
        assert_eq!(presence, Payload::Presence { user_id: "alice".into(), state: PresenceState::Away });
    }

    #[tokio::test]
    async fn test_structural_clash_settled_without_resync() {
        let registry = registry(ResolutionStrategy::LastWriterWins, StaticRoleResolver::default());
        let (room, doc) = (Uuid::new_v4(), Uuid::new_v4());
        let mut alice = join(&registry, room, doc, "alice").await;
        let mut bob = join(&registry, room, doc, "bob").await;

        alice.submit(insert(doc, "alice", 0, "abcde", 0)).await;
        alice.expect(|p| matches!(p, Payload::Ack { .. })).await;
        bob.expect(|p| matches!(p, Payload::Operation { .. })).await;

        let delete = Operation::new(OpKind::Delete { position: 1, length: 2 }, doc, "alice", 3).rebased(1);
        let moved = Operation::new(OpKind::Move { position: 2, length: 2, target: 3 }, doc, "bob", 3).rebased(1);
        alice.submit(delete.clone()).await;
        alice.expect(|p| matches!(p, Payload::Ack { .. })).await;
        bob.submit(moved.clone()).await;

        match bob.expect(|p| matches!(p, Payload::Rejected { .. })).await {
            Payload::Rejected { operation_id, error, resync } => {
                assert_eq!(operation_id, Some(moved.id()));
                assert_eq!(error, CollabError::ConflictLost { operation_id: moved.id(), winner: delete.id() });
                assert!(!resync);
            }
            other => panic!("unexpected {}", other.kind()),
        }
        match alice.expect(|p| matches!(p, Payload::Conflict(_))).await {
            Payload::Conflict(notice) => {
                assert_eq!(notice.winner, delete.id());
                assert_eq!(notice.losers, vec![moved.id()]);
            }
            other => panic!("unexpected {}", other.kind()),
        }
        let summary = alice.handle.inspect().await.unwrap();
        assert_eq!(summary.documents[0].content, "ade");
        assert_eq!(summary.documents[0].state.version, 2);
    }

    #[tokio::test]
    async fn test_operational_transform_strategy_applies_both() {
        let registry = registry(ResolutionStrategy::OperationalTransform, StaticRoleResolver::default());
        let (room, doc) = (Uuid::new_v4(), Uuid::new_v4());
        let mut alice = join(&registry, room, doc, "alice").await;
        let mut bob = join(&registry, room, doc, "bob").await;

        let update = |author: &str, ts: u64, value: &str| {
            Operation::new(OpKind::Update { path: "title".into(), value: value.into() }, doc, author, ts)
        };
        let late = update("alice", 5, "late");
        let early = update("bob", 2, "early");
        alice.submit(late.clone()).await;
        alice.expect(|p| matches!(p, Payload::Ack { .. })).await;
        bob.submit(early.clone()).await;

        // nobody is refused: the older update folds into a no-op
        let ack = bob.expect(|p| matches!(p, Payload::Ack { .. } | Payload::Rejected { .. })).await;
        assert_eq!(ack, Payload::Ack { operation_id: early.id(), version: 2 });
        match alice.expect(|p| matches!(p, Payload::Operation { .. })).await {
            Payload::Operation { operation, version } => {
                assert_eq!(operation.id(), early.id());
                assert!(operation.is_noop());
                assert_eq!(version, 2);
            }
            other => panic!("unexpected {}", other.kind()),
        }
        match alice.expect(|p| matches!(p, Payload::Conflict(_))).await {
            Payload::Conflict(notice) => {
                assert_eq!(notice.strategy, ResolutionStrategy::OperationalTransform);
                assert_eq!(notice.winner, late.id());
                assert!(notice.losers.is_empty());
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expires_idle_member() {
        let registry = registry(ResolutionStrategy::LastWriterWins, StaticRoleResolver::default());
        let mut events = registry.subscribe();
        let (room, doc) = (Uuid::new_v4(), Uuid::new_v4());
        let _alice = join(&registry, room, doc, "alice").await;
        let mut bob = join(&registry, room, doc, "bob").await;

        tokio::time::advance(Duration::from_secs(200)).await;
        bob.handle.send("bob", Message::heartbeat(room, 1)).await.unwrap();
        bob.expect(|p| matches!(p, Payload::Heartbeat { .. })).await;

        // alice has been idle past the presence timeout, bob has not
        tokio::time::advance(Duration::from_secs(200)).await;
        let left = bob.expect(|p| matches!(p, Payload::Leave { .. })).await;
        assert_eq!(left, Payload::Leave { user_id: "alice".into() });

        let summary = bob.handle.inspect().await.unwrap();
        let members: Vec<&str> = summary.participants.iter().map(|p| p.user_id.as_str()).collect();
        assert_eq!(members, vec!["bob"]);

        let mut expired = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CollabEvent::UserLeft { user_id, reason, .. } = event {
                expired.push((user_id, reason));
            }
        }
        assert_eq!(expired, vec![("alice".to_string(), LeaveReason::Expired)]);
    }

    #[tokio::test]
    async fn test_registry_shutdown_saves_every_room() {
        let store = Arc::new(MemorySnapshotStore::new());
        let registry = RoomRegistry::new(
            RoomConfig::default(),
            store.clone(),
            Arc::new(StaticRoleResolver::default()),
            16,
        );
        let mut members = Vec::new();
        let mut docs = Vec::new();
        for text in ["first", "second"] {
            let (room, doc) = (Uuid::new_v4(), Uuid::new_v4());
            let mut member = join(&registry, room, doc, "alice").await;
            member.submit(insert(doc, "alice", 0, text, 0)).await;
            member.expect(|p| matches!(p, Payload::Ack { .. })).await;
            members.push(member);
            docs.push((doc, text));
        }
        assert_eq!(registry.room_count().await, 2);

        registry.shutdown().await;
        assert_eq!(registry.room_count().await, 0);
        for (doc, text) in docs {
            let saved = store.load_snapshot(doc).await.unwrap().unwrap();
            assert_eq!(saved.content, text);
            assert_eq!(saved.version, 1);
        }
        // closing twice is harmless
        registry.shutdown().await;
        members[0].handle.close().await;
    }
}
