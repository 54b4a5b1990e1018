//! Sync client: one participant's replica of one document, kept in step
//! with a room over a [`TransportAdapter`].
//!
//! Local edits apply to the [`Engine`] immediately and are sent one at a
//! time; the next pending edit leaves only after the room acknowledged the
//! previous one. On every (re)connect the client joins with its replica's
//! `(version, checksum)` and waits for the room's sync reply before it lets
//! queued traffic through.

use std::sync::Arc;

use forma_core::{
    Applied, CollabError, Document, Engine, FieldValue, OpKind, Operation, ResolutionStrategy, Role,
    SyncState,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::presence::{PresenceState, SelectionRange};
use crate::protocol::{
    decode_snapshot, ConflictNotice, Message, ParticipantInfo, Payload, SyncOutcome, SyncReply, SyncRequest,
};
use crate::transport::{
    ConnectionState, Connector, HeartbeatFn, TransportAdapter, TransportConfig, TransportEvent, TransportHandle,
    WebSocketConnector,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// WebSocket URL of the sync server, e.g. `ws://127.0.0.1:9090`.
    pub url: String,
    pub room_id: Uuid,
    pub document_id: Uuid,
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Joined {
        role: Role,
        strategy: ResolutionStrategy,
        participants: Vec<ParticipantInfo>,
    },
    Disconnected { reason: String },
    /// Reconnect attempts exhausted; the transport keeps polling.
    Degraded,
    RemoteOperation { operation: Operation, version: u64 },
    Acknowledged { operation_id: Uuid, version: u64 },
    Rejected { operation_id: Option<Uuid>, error: CollabError },
    PresenceChanged { user_id: String, state: PresenceState },
    CursorMoved { user_id: String, document_id: Uuid, position: usize },
    SelectionChanged { user_id: String, document_id: Uuid, range: SelectionRange },
    ParticipantJoined { user_id: String, display_name: String },
    ParticipantLeft { user_id: String },
    ConflictResolved(ConflictNotice),
    /// The replica matches the room at `version`.
    Synced { version: u64, outcome: &'static str },
    /// Local edits thrown away by a snapshot reset or lost to a concurrent
    /// remote edit they could not be merged with.
    OperationsDiscarded(Vec<Operation>),
    Closed,
}

struct ClientState {
    engine: Engine,
    role: Option<Role>,
    /// Set by a sync reply; cleared on disconnect and while a forced resync
    /// is outstanding. Edits are only sent while set.
    synced: bool,
}

/// Traffic decided while holding the state lock, sent once it is released.
enum Outgoing {
    Data(Payload),
    Control(Payload),
    MarkReady,
}

/// Everything the driver task and the public API share.
struct Shared {
    room_id: Uuid,
    user_id: String,
    display_name: String,
    state: Mutex<ClientState>,
    transport: TransportHandle,
    events: mpsc::Sender<SyncEvent>,
}

pub struct SyncClient {
    shared: Arc<Shared>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    /// Start a client against a WebSocket server. Connection happens in the
    /// background; watch [`SyncEvent::Joined`] or [`SyncClient::wait_ready`].
    pub fn connect(config: ClientConfig) -> Self {
        let connector = Arc::new(WebSocketConnector::new(config.url.clone()));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let room_id = config.room_id;
        let heartbeat: HeartbeatFn = Arc::new(move |nonce| Message::heartbeat(room_id, nonce).encode().ok());
        let (transport, transport_events) = TransportAdapter::spawn(connector, config.transport.clone(), heartbeat);
        let (event_tx, event_rx) = mpsc::channel(256);

        let shared = Arc::new(Shared {
            room_id,
            user_id: config.user_id.clone(),
            display_name: config.display_name,
            state: Mutex::new(ClientState {
                engine: Engine::new(config.user_id, Document::new(config.document_id)),
                role: None,
                synced: false,
            }),
            transport,
            events: event_tx,
        });
        tokio::spawn(drive(shared.clone(), transport_events));

        Self {
            shared,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub fn user_id(&self) -> &str {
        &self.shared.user_id
    }

    pub fn room_id(&self) -> Uuid {
        self.shared.room_id
    }

    /// Apply an edit locally and send it when the room is ready for it.
    ///
    /// Cursor and selection kinds only update presence.
    pub async fn apply_local(&self, kind: OpKind) -> Result<Applied, CollabError> {
        let (applied, outgoing) = {
            let mut state = self.shared.state.lock().await;
            if !kind.is_presence() {
                if let Some(role) = state.role.filter(|role| !role.can_write()) {
                    return Err(CollabError::PermissionDenied {
                        user_id: self.shared.user_id.clone(),
                        role,
                    });
                }
            }
            let applied = state.engine.apply_local(kind)?;

            let outgoing = match applied.operation.kind() {
                OpKind::Cursor { position } => Some(Outgoing::Data(Payload::Cursor {
                    user_id: self.shared.user_id.clone(),
                    document_id: applied.operation.document_id(),
                    position: *position,
                })),
                OpKind::Selection { position, length } => Some(Outgoing::Data(Payload::Selection {
                    user_id: self.shared.user_id.clone(),
                    document_id: applied.operation.document_id(),
                    range: SelectionRange {
                        position: *position,
                        length: *length,
                    },
                })),
                _ => next_outgoing(&mut state),
            };
            (applied, outgoing)
        };
        self.shared.dispatch(outgoing).await?;
        Ok(applied)
    }

    pub async fn update_presence(&self, presence: PresenceState) -> Result<(), CollabError> {
        let payload = Payload::Presence {
            user_id: self.shared.user_id.clone(),
            state: presence,
        };
        self.shared.dispatch([Outgoing::Data(payload)]).await
    }

    /// Ask the room to reconcile; `force` requests a full snapshot.
    pub async fn request_sync(&self, force: bool) -> Result<(), CollabError> {
        let outgoing = sync_request(&mut *self.shared.state.lock().await, force);
        self.shared.dispatch([outgoing]).await
    }

    pub async fn content(&self) -> String {
        self.shared.state.lock().await.engine.document().content()
    }

    pub async fn property(&self, path: &str) -> Option<FieldValue> {
        self.shared.state.lock().await.engine.document().property(path).cloned()
    }

    pub async fn document(&self) -> Document {
        self.shared.state.lock().await.engine.document().clone()
    }

    pub async fn sync_state(&self) -> SyncState {
        self.shared.state.lock().await.engine.sync_state()
    }

    pub async fn pending_len(&self) -> usize {
        self.shared.state.lock().await.engine.pending_len()
    }

    /// Role granted by the room, once joined.
    pub async fn role(&self) -> Option<Role> {
        self.shared.state.lock().await.role
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.transport.state()
    }

    /// Wait until the transport is ready (joined and synced).
    pub async fn wait_ready(&self) -> Result<(), CollabError> {
        let mut changes = self.shared.transport.state_changes();
        changes
            .wait_for(|state| *state == ConnectionState::Ready)
            .await
            .map(|_| ())
            .map_err(|_| CollabError::TransportUnavailable("transport closed".into()))
    }

    pub async fn close(&self) {
        if let Ok(frame) = Message::new(
            self.shared.room_id,
            Payload::Leave {
                user_id: self.shared.user_id.clone(),
            },
        )
        .encode()
        {
            let _ = self.shared.transport.send_control(frame).await;
        }
        self.shared.transport.close().await;
    }
}

impl Shared {
    fn emit(&self, event: SyncEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            log::warn!("Sync event queue full, dropping {event:?}");
        }
    }

    /// Send in order. Must be called without the state lock held.
    async fn dispatch(&self, outgoing: impl IntoIterator<Item = Outgoing>) -> Result<(), CollabError> {
        for item in outgoing {
            match item {
                Outgoing::Data(payload) => self.transport.send(encode(self.room_id, payload)?).await?,
                Outgoing::Control(payload) => self.transport.send_control(encode(self.room_id, payload)?).await?,
                Outgoing::MarkReady => self.transport.mark_ready().await?,
            }
        }
        Ok(())
    }

    /// Emit events for pending edits a remote operation won against.
    fn report_discarded(&self, engine: &mut Engine) {
        let discarded = engine.take_discarded();
        if !discarded.is_empty() {
            log::info!("{} local edit(s) lost to a concurrent remote edit", discarded.len());
            self.emit(SyncEvent::OperationsDiscarded(discarded));
        }
    }

    async fn join(&self) -> Result<(), CollabError> {
        let payload = {
            let mut state = self.state.lock().await;
            state.synced = false;
            state.engine.reset_in_flight();
            let sync = state.engine.sync_state();
            Payload::Join {
                user_id: self.user_id.clone(),
                display_name: self.display_name.clone(),
                document_id: sync.document_id,
                sync: Some(sync),
            }
        };
        self.dispatch([Outgoing::Control(payload)]).await
    }

    async fn handle_frame(&self, frame: &[u8]) -> Result<(), CollabError> {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping undecodable frame: {e}");
                return Ok(());
            }
        };
        if message.room_id != self.room_id {
            log::warn!("Dropping {} for foreign room {}", message.payload.kind(), message.room_id);
            return Ok(());
        }

        let outgoing = match message.payload {
            Payload::Joined {
                user_id,
                role,
                strategy,
                participants,
            } if user_id == self.user_id => {
                self.state.lock().await.role = Some(role);
                log::info!("Joined room {} as {role} ({strategy:?})", self.room_id);
                self.emit(SyncEvent::Joined {
                    role,
                    strategy,
                    participants,
                });
                Vec::new()
            }
            Payload::SyncReply(reply) => {
                let mut state = self.state.lock().await;
                self.apply_sync_reply(&mut state, reply)?
            }
            Payload::Operation { operation, version } => {
                let mut state = self.state.lock().await;
                if let Some(applied) = integrate(&mut state.engine, operation)? {
                    self.emit(SyncEvent::RemoteOperation {
                        operation: applied.operation,
                        version,
                    });
                }
                self.report_discarded(&mut state.engine);
                next_outgoing(&mut state).into_iter().collect()
            }
            Payload::Ack { operation_id, version } => {
                let mut state = self.state.lock().await;
                if state.engine.acknowledge(operation_id, version) {
                    self.emit(SyncEvent::Acknowledged { operation_id, version });
                } else {
                    log::debug!("Ignoring stale ack for {operation_id}");
                }
                next_outgoing(&mut state).into_iter().collect()
            }
            Payload::Rejected {
                operation_id,
                error,
                resync,
            } => {
                log::info!("Room rejected {operation_id:?}: {error}");
                let mut state = self.state.lock().await;
                if let Some(id) = operation_id {
                    state.engine.reject(id);
                }
                self.emit(SyncEvent::Rejected { operation_id, error });
                if resync {
                    vec![sync_request(&mut state, true)]
                } else {
                    next_outgoing(&mut state).into_iter().collect()
                }
            }
            Payload::Presence { user_id, state } if user_id != self.user_id => {
                self.emit(SyncEvent::PresenceChanged { user_id, state });
                Vec::new()
            }
            Payload::Cursor {
                user_id,
                document_id,
                position,
            } if user_id != self.user_id => {
                self.emit(SyncEvent::CursorMoved {
                    user_id,
                    document_id,
                    position,
                });
                Vec::new()
            }
            Payload::Selection {
                user_id,
                document_id,
                range,
            } if user_id != self.user_id => {
                self.emit(SyncEvent::SelectionChanged {
                    user_id,
                    document_id,
                    range,
                });
                Vec::new()
            }
            Payload::Join {
                user_id, display_name, ..
            } if user_id != self.user_id => {
                self.emit(SyncEvent::ParticipantJoined { user_id, display_name });
                Vec::new()
            }
            Payload::Leave { user_id } => {
                self.emit(SyncEvent::ParticipantLeft { user_id });
                Vec::new()
            }
            Payload::Conflict(notice) => {
                self.emit(SyncEvent::ConflictResolved(notice));
                Vec::new()
            }
            Payload::Heartbeat { nonce, reply: false } => {
                vec![Outgoing::Data(Payload::Heartbeat { nonce, reply: true })]
            }
            other => {
                log::trace!("Ignoring {} message", other.kind());
                Vec::new()
            }
        };
        self.dispatch(outgoing).await
    }

    fn apply_sync_reply(&self, state: &mut ClientState, reply: SyncReply) -> Result<Vec<Outgoing>, CollabError> {
        if reply.document_id != state.engine.document().id() {
            log::debug!("Ignoring sync reply for document {}", reply.document_id);
            return Ok(Vec::new());
        }
        let outcome = match reply.outcome {
            SyncOutcome::UpToDate { .. } => "up_to_date",
            SyncOutcome::CatchUp { operations } => {
                log::debug!("Catching up {} operation(s)", operations.len());
                for operation in operations {
                    if let Some(applied) = integrate(&mut state.engine, operation)? {
                        let version = state.engine.shadow().version();
                        self.emit(SyncEvent::RemoteOperation {
                            operation: applied.operation,
                            version,
                        });
                    }
                }
                self.report_discarded(&mut state.engine);
                "catch_up"
            }
            SyncOutcome::Snapshot { reason, data, .. } => {
                let snapshot = decode_snapshot(&data).map_err(|e| {
                    CollabError::TransportUnavailable(format!("unreadable snapshot: {e}"))
                })?;
                log::info!("Resetting to snapshot at version {} ({reason:?})", snapshot.version);
                let discarded = state.engine.reset_to_snapshot(snapshot);
                if !discarded.is_empty() {
                    self.emit(SyncEvent::OperationsDiscarded(discarded));
                }
                "snapshot"
            }
        };

        state.synced = true;
        let version = state.engine.shadow().version();
        self.emit(SyncEvent::Synced { version, outcome });
        let mut outgoing = vec![Outgoing::MarkReady];
        outgoing.extend(next_outgoing(state));
        Ok(outgoing)
    }
}

/// The next pending edit, if the replica is synced and nothing is in flight.
fn next_outgoing(state: &mut ClientState) -> Option<Outgoing> {
    if !state.synced {
        return None;
    }
    let op = state.engine.next_outgoing()?;
    let version = op.base_version();
    log::trace!("Sending {} {} on version {version}", op.kind().name(), op.id());
    Some(Outgoing::Data(Payload::Operation { operation: op, version }))
}

fn sync_request(state: &mut ClientState, force: bool) -> Outgoing {
    if force {
        state.synced = false;
    }
    Outgoing::Control(Payload::Sync(SyncRequest {
        state: state.engine.sync_state(),
        force_snapshot: force,
    }))
}

/// Apply a sequenced operation. Our own in-flight edit coming back (for
/// instance through a catch-up after reconnect) counts as its
/// acknowledgement. Returns the operation as applied, if it was remote.
fn integrate(engine: &mut Engine, operation: Operation) -> Result<Option<Applied>, CollabError> {
    if engine.pending().next().is_some_and(|front| front.id() == operation.id()) {
        let version = engine.shadow().version() + 1;
        engine.acknowledge(operation.id(), version);
        return Ok(None);
    }
    engine.apply_remote(operation).map(Some)
}

fn encode(room_id: Uuid, payload: Payload) -> Result<Vec<u8>, CollabError> {
    Message::new(room_id, payload)
        .encode()
        .map_err(|e| CollabError::TransportUnavailable(e.to_string()))
}

async fn drive(shared: Arc<Shared>, mut events: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let result = match event {
            TransportEvent::Connected => {
                shared.emit(SyncEvent::Connected);
                shared.join().await
            }
            TransportEvent::Frame(frame) => shared.handle_frame(&frame).await,
            TransportEvent::Disconnected { reason } => {
                let mut state = shared.state.lock().await;
                state.synced = false;
                state.engine.reset_in_flight();
                shared.emit(SyncEvent::Disconnected { reason });
                Ok(())
            }
            TransportEvent::Reconnecting { attempt, delay } => {
                log::debug!("Reconnect attempt {attempt} in {delay:?}");
                Ok(())
            }
            TransportEvent::Degraded => {
                shared.emit(SyncEvent::Degraded);
                Ok(())
            }
            TransportEvent::Closed => break,
        };
        if let Err(e) = result {
            log::warn!("Sync client error: {e}");
        }
    }
    shared.emit(SyncEvent::Closed);
    log::debug!("Sync client for {} stopped", shared.user_id);
}
