//! Transport adapter: one logical channel per participant that survives
//! disconnects.
//!
//! ```text
//!  TransportHandle ──commands──► supervisor task ──frames──► Channel (ws)
//!        ▲                         │    │
//!        │ watch<ConnectionState>  │    └── OutboundQueue (not ready yet)
//!        └─────────────────────────┘
//!                 TransportEvent ──► owner
//!
//!  Connecting → Connected → Ready ─┐
//!       ▲                          │ lost / heartbeat timeout
//!       └── Reconnecting{n} ◄──────┘
//!              │ attempts exhausted
//!              ▼
//!           Degraded (poll every poll_interval)
//! ```
//!
//! Frames sent before the owner marks the connection ready wait in a
//! bounded FIFO that drops its oldest entry on overflow. Control frames
//! (join, sync) skip the queue so the owner can handshake first. A data
//! frame whose send fails goes back to the head of the queue, together with
//! anything behind it, for the next session.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

// ─── Configuration ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Frames held while the connection is not ready.
    pub queue_capacity: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Reconnect attempts before falling back to polling.
    pub max_attempts: u32,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Silence after which the connection is considered dead.
    pub heartbeat_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            base_delay_ms: 250,
            max_delay_ms: 30_000,
            max_attempts: 5,
            poll_interval_ms: 15_000,
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 45_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl TransportConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Channel open, owner still handshaking.
    Connected,
    /// Owner marked the session ready; queued frames flushed.
    Ready,
    Reconnecting { attempt: u32 },
    /// Reconnect attempts exhausted; polling.
    Degraded,
    Closed,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Ready)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Receive failed: {0}")]
    Receive(String),
    #[error("Transport closed")]
    Closed,
}

impl From<TransportError> for forma_core::CollabError {
    fn from(e: TransportError) -> Self {
        forma_core::CollabError::TransportUnavailable(e.to_string())
    }
}

// ─── Outbound queue ──────────────────────────────────────

/// Bounded FIFO of frames waiting for a ready connection.
pub struct OutboundQueue {
    queue: VecDeque<Vec<u8>>,
    capacity: usize,
    dropped: u64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
        }
    }

    /// Queue a frame, returning the oldest one if it had to make room.
    pub fn push(&mut self, frame: Vec<u8>) -> Option<Vec<u8>> {
        let evicted = if self.queue.len() >= self.capacity {
            self.dropped += 1;
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(frame);
        evicted
    }

    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    /// Put unsent frames back ahead of everything queued since, keeping
    /// their order. Overflow drops from the head as usual.
    pub fn requeue(&mut self, frames: Vec<Vec<u8>>) {
        for frame in frames.into_iter().rev() {
            self.queue.push_front(frame);
        }
        while self.queue.len() > self.capacity {
            self.queue.pop_front();
            self.dropped += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(Vec::len).sum()
    }

    /// Frames lost to overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

// ─── Backoff ─────────────────────────────────────────────

/// Exponential backoff: `base × 2^attempt`, capped, for a bounded number of
/// attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
        )
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = self.delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ─── Channel seam ────────────────────────────────────────

/// An open, ordered, message-oriented connection.
#[async_trait]
pub trait Channel: Send {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Next binary frame; `Ok(None)` once the peer closed the channel.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn Channel>, TransportError>;
}

pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn Channel>, TransportError> {
        let (stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        log::debug!("WebSocket connected to {}", self.url);
        Ok(Box::new(WebSocketChannel { stream }))
    }
}

pub struct WebSocketChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Channel for WebSocketChannel {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.stream
            .send(WsMessage::Binary(frame.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Binary(data))) => return Ok(Some(data.into())),
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Receive(e.to_string())),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            log::debug!("WebSocket close failed: {e}");
        }
    }
}

// ─── Adapter ─────────────────────────────────────────────

/// Builds the heartbeat frame for a nonce; `None` skips the beat.
pub type HeartbeatFn = Arc<dyn Fn(u64) -> Option<Vec<u8>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Frame(Vec<u8>),
    Disconnected { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    Degraded,
    Closed,
}

enum TransportCommand {
    Send(Vec<u8>),
    SendControl(Vec<u8>),
    MarkReady,
    Reconnect,
    Close,
}

#[derive(Clone)]
pub struct TransportHandle {
    commands: mpsc::Sender<TransportCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl TransportHandle {
    /// Send when ready, queue otherwise.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.command(TransportCommand::Send(frame)).await
    }

    /// Send on the open channel even before it is ready. Dropped while
    /// offline; the owner handshakes again on reconnect.
    pub async fn send_control(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.command(TransportCommand::SendControl(frame)).await
    }

    pub async fn mark_ready(&self) -> Result<(), TransportError> {
        self.command(TransportCommand::MarkReady).await
    }

    /// Drop the current channel and connect again.
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        self.command(TransportCommand::Reconnect).await
    }

    pub async fn close(&self) {
        let _ = self.command(TransportCommand::Close).await;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    async fn command(&self, command: TransportCommand) -> Result<(), TransportError> {
        self.commands.send(command).await.map_err(|_| TransportError::Closed)
    }
}

pub struct TransportAdapter;

impl TransportAdapter {
    /// Start the supervisor task.
    pub fn spawn(
        connector: Arc<dyn Connector>,
        config: TransportConfig,
        heartbeat: HeartbeatFn,
    ) -> (TransportHandle, mpsc::Receiver<TransportEvent>) {
        let (command_tx, command_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (event_tx, event_rx) = mpsc::channel(256);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let supervisor = Supervisor {
            connector,
            queue: OutboundQueue::new(config.queue_capacity),
            backoff: Backoff::from_config(&config),
            config,
            heartbeat,
            commands: command_rx,
            events: event_tx,
            state: state_tx,
            nonce: 0,
        };
        tokio::spawn(supervisor.run());

        let handle = TransportHandle {
            commands: command_tx,
            state: state_rx,
        };
        (handle, event_rx)
    }
}

enum SessionEnd {
    Lost(String),
    Closed,
}

struct Supervisor {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    heartbeat: HeartbeatFn,
    commands: mpsc::Receiver<TransportCommand>,
    events: mpsc::Sender<TransportEvent>,
    state: watch::Sender<ConnectionState>,
    queue: OutboundQueue,
    backoff: Backoff,
    nonce: u64,
}

impl Supervisor {
    async fn run(mut self) {
        'outer: loop {
            if !matches!(*self.state.borrow(), ConnectionState::Degraded) {
                self.set_state(ConnectionState::Connecting);
            }
            let Some(result) = self.connect().await else {
                break;
            };
            match result {
                Ok(channel) => {
                    self.backoff.reset();
                    match self.run_session(channel).await {
                        SessionEnd::Closed => break,
                        SessionEnd::Lost(reason) => {
                            log::warn!("Connection lost: {reason}");
                            self.set_state(ConnectionState::Disconnected);
                            if !self.emit(TransportEvent::Disconnected { reason }).await {
                                break;
                            }
                        }
                    }
                }
                Err(e) => log::debug!("Connect attempt failed: {e}"),
            }

            let delay = match self.backoff.next_delay() {
                Some(delay) => {
                    let attempt = self.backoff.attempt();
                    log::info!("Reconnecting in {delay:?} (attempt {attempt}/{})", self.config.max_attempts);
                    self.set_state(ConnectionState::Reconnecting { attempt });
                    if !self.emit(TransportEvent::Reconnecting { attempt, delay }).await {
                        break;
                    }
                    delay
                }
                None => {
                    if *self.state.borrow() != ConnectionState::Degraded {
                        log::warn!(
                            "Reconnect attempts exhausted; polling every {:?}",
                            self.config.poll_interval()
                        );
                        self.set_state(ConnectionState::Degraded);
                        if !self.emit(TransportEvent::Degraded).await {
                            break;
                        }
                    }
                    self.config.poll_interval()
                }
            };
            if !self.wait_offline(delay).await {
                break 'outer;
            }
        }
        self.set_state(ConnectionState::Closed);
        let _ = self.events.send(TransportEvent::Closed).await;
        log::debug!("Transport closed");
    }

    /// `None` when the owner closed the transport meanwhile.
    async fn connect(&mut self) -> Option<Result<Box<dyn Channel>, TransportError>> {
        let connector = self.connector.clone();
        let attempt = tokio::time::timeout(self.config.connect_timeout(), connector.connect());
        tokio::pin!(attempt);
        loop {
            tokio::select! {
                result = &mut attempt => {
                    return Some(result.unwrap_or_else(|_| Err(TransportError::Connect("timed out".into()))));
                }
                command = self.commands.recv() => {
                    if !self.handle_offline(command) {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleep for `delay` while buffering commands. Returns false on close;
    /// a reconnect request ends the wait early.
    async fn wait_offline(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => {
                    if matches!(command, Some(TransportCommand::Reconnect)) {
                        return true;
                    }
                    if !self.handle_offline(command) {
                        return false;
                    }
                }
            }
        }
    }

    fn handle_offline(&mut self, command: Option<TransportCommand>) -> bool {
        match command {
            None | Some(TransportCommand::Close) => false,
            Some(TransportCommand::Send(frame)) => {
                self.enqueue(frame);
                true
            }
            Some(TransportCommand::SendControl(_)) => {
                log::trace!("Dropping control frame while offline");
                true
            }
            Some(TransportCommand::MarkReady) | Some(TransportCommand::Reconnect) => true,
        }
    }

    fn enqueue(&mut self, frame: Vec<u8>) {
        if self.queue.push(frame).is_some() {
            log::warn!(
                "Outbound queue full ({}), dropped oldest frame ({} dropped so far)",
                self.queue.len(),
                self.queue.dropped()
            );
        }
    }

    async fn run_session(&mut self, mut channel: Box<dyn Channel>) -> SessionEnd {
        let mut ready = false;
        self.set_state(ConnectionState::Connected);
        if !self.emit(TransportEvent::Connected).await {
            channel.close().await;
            return SessionEnd::Closed;
        }

        let period = self.config.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                frame = channel.recv() => match frame {
                    Ok(Some(frame)) => {
                        last_seen = Instant::now();
                        if !self.emit(TransportEvent::Frame(frame)).await {
                            channel.close().await;
                            return SessionEnd::Closed;
                        }
                    }
                    Ok(None) => return SessionEnd::Lost("closed by peer".into()),
                    Err(e) => return SessionEnd::Lost(e.to_string()),
                },
                command = self.commands.recv() => match command {
                    None | Some(TransportCommand::Close) => {
                        channel.close().await;
                        return SessionEnd::Closed;
                    }
                    Some(TransportCommand::Send(frame)) if ready => {
                        if let Err(e) = channel.send(frame.clone()).await {
                            self.queue.requeue(vec![frame]);
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                    Some(TransportCommand::Send(frame)) => self.enqueue(frame),
                    Some(TransportCommand::SendControl(frame)) => {
                        if let Err(e) = channel.send(frame).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                    Some(TransportCommand::MarkReady) => {
                        if !ready {
                            ready = true;
                            self.set_state(ConnectionState::Ready);
                            let queued = self.queue.drain();
                            if !queued.is_empty() {
                                log::info!("Flushing {} queued frame(s)", queued.len());
                            }
                            let mut queued = queued.into_iter();
                            while let Some(frame) = queued.next() {
                                if let Err(e) = channel.send(frame.clone()).await {
                                    let mut unsent = vec![frame];
                                    unsent.extend(queued);
                                    log::warn!("Flush interrupted, {} frame(s) back in the queue", unsent.len());
                                    self.queue.requeue(unsent);
                                    return SessionEnd::Lost(e.to_string());
                                }
                            }
                        }
                    }
                    Some(TransportCommand::Reconnect) => {
                        channel.close().await;
                        return SessionEnd::Lost("reconnect requested".into());
                    }
                },
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() >= self.config.heartbeat_timeout() {
                        channel.close().await;
                        return SessionEnd::Lost("heartbeat timeout".into());
                    }
                    self.nonce += 1;
                    if let Some(frame) = (self.heartbeat)(self.nonce) {
                        if let Err(e) = channel.send(frame).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                }
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("Transport state {previous:?} -> {state:?}");
        }
    }

    /// False once the owner stopped listening.
    async fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}
