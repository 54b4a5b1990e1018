//! Fan-out of encoded frames to the members of one room.
//!
//! Every participant gets its own bounded outbox, so the frames a peer sees
//! keep the order in which the room produced them (an ack never overtakes
//! the remote operations sequenced before it). A peer whose outbox is full
//! is dropped from the group; closing its outbox ends the connection and the
//! client resynchronizes on reconnect.
//!
//! Stats are atomics so the registry can read them without touching the
//! room task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};

pub type Frame = Arc<Vec<u8>>;
pub type Outbox = mpsc::Sender<Frame>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    active_peers: AtomicU64,
}

struct Peer {
    session: u64,
    outbox: Outbox,
}

/// Outboxes of one room, keyed by user id.
pub struct BroadcastGroup {
    peers: HashMap<String, Peer>,
    stats: Arc<AtomicBroadcastStats>,
}

/// Read-only view of a group's counters.
#[derive(Clone)]
pub struct StatsHandle(Arc<AtomicBroadcastStats>);

impl StatsHandle {
    pub fn snapshot(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.0.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.0.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.0.active_peers.load(Ordering::Relaxed) as usize,
        }
    }
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Register `user_id`'s outbox, replacing the one from an older session.
    pub fn add_peer(&mut self, user_id: &str, session: u64, outbox: Outbox) {
        if self.peers.insert(user_id.to_string(), Peer { session, outbox }).is_some() {
            log::debug!("Replaced outbox of {user_id} with session {session}");
        }
        self.sync_peer_count();
    }

    /// Drop `user_id`'s outbox. With `Some(session)`, only that session's.
    pub fn remove_peer(&mut self, user_id: &str, session: Option<u64>) -> bool {
        let matches = self
            .peers
            .get(user_id)
            .is_some_and(|peer| session.map_or(true, |s| s == peer.session));
        if matches {
            self.peers.remove(user_id);
            self.sync_peer_count();
        }
        matches
    }

    pub fn session_of(&self, user_id: &str) -> Option<u64> {
        self.peers.get(user_id).map(|peer| peer.session)
    }

    /// Queue `frame` for one peer. Returns false if the peer is gone or lagging.
    pub fn send_to(&mut self, user_id: &str, frame: Frame) -> bool {
        let Some(peer) = self.peers.get(user_id) else {
            return false;
        };
        let delivered = self.push(peer, frame);
        if !delivered {
            self.peers.remove(user_id);
            self.sync_peer_count();
        }
        delivered
    }

    /// Queue `frame` for every peer except `except`.
    ///
    /// Lagging or disconnected peers are removed and their ids returned.
    pub fn broadcast(&mut self, frame: Frame, except: Option<&str>) -> Vec<String> {
        let mut lagging = Vec::new();
        for (user_id, peer) in &self.peers {
            if except == Some(user_id.as_str()) {
                continue;
            }
            if !self.push(peer, frame.clone()) {
                lagging.push(user_id.clone());
            }
        }
        for user_id in &lagging {
            self.peers.remove(user_id);
        }
        if !lagging.is_empty() {
            self.sync_peer_count();
        }
        lagging
    }

    fn push(&self, peer: &Peer, frame: Frame) -> bool {
        match peer.outbox.try_send(frame) {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn sync_peer_count(&self) {
        self.stats
            .active_peers
            .store(self.peers.len() as u64, Ordering::Relaxed);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn has_peer(&self, user_id: &str) -> bool {
        self.peers.contains_key(user_id)
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats_handle().snapshot()
    }

    pub fn stats_handle(&self) -> StatsHandle {
        StatsHandle(self.stats.clone())
    }
}

impl Default for BroadcastGroup {
    fn default() -> Self {
        Self::new()
    }
}
