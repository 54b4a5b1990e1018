//! Presence tracking: who is in a room, what they are doing, and where
//! their cursor is.
//!
//! ```text
//! presence / cursor / selection / heartbeat
//!       │
//!       ▼
//! PresenceTracker::update_*()  ──►  record returned for broadcast
//!       │
//!       ▼  (every sweep interval)
//! PresenceTracker::sweep()     ──►  expired users leave the room
//! ```
//!
//! Records are owned by the room task, so the tracker needs no locking.
//! Timestamps come from the tokio clock, which tests can pause.

use std::collections::HashMap;
use std::time::Duration;

use forma_core::transform::{transform_position, transform_range};
use forma_core::Operation;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

/// Idle time after which a participant is considered gone.
pub const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PresenceState {
    #[default]
    Online,
    Away,
    Busy,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub position: usize,
    pub length: usize,
}

// ─── Records ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub user_id: String,
    pub room_id: Uuid,
    pub state: PresenceState,
    /// Document the cursor and selection refer to.
    pub document_id: Option<Uuid>,
    pub cursor: Option<usize>,
    pub selection: Option<SelectionRange>,
    pub last_update: Instant,
}

impl PresenceRecord {
    fn new(room_id: Uuid, user_id: &str, now: Instant) -> Self {
        Self {
            user_id: user_id.to_string(),
            room_id,
            state: PresenceState::Online,
            document_id: None,
            cursor: None,
            selection: None,
            last_update: now,
        }
    }

    pub fn is_active(&self, now: Instant, timeout: Duration) -> bool {
        self.state != PresenceState::Offline && now.saturating_duration_since(self.last_update) <= timeout
    }
}

// ─── Tracker ─────────────────────────────────────────────

pub struct PresenceTracker {
    room_id: Uuid,
    records: HashMap<String, PresenceRecord>,
    timeout: Duration,
}

impl PresenceTracker {
    pub fn new(room_id: Uuid) -> Self {
        Self::with_timeout(room_id, DEFAULT_PRESENCE_TIMEOUT)
    }

    pub fn with_timeout(room_id: Uuid, timeout: Duration) -> Self {
        Self {
            room_id,
            records: HashMap::new(),
            timeout,
        }
    }

    fn record_mut(&mut self, user_id: &str, now: Instant) -> &mut PresenceRecord {
        let room_id = self.room_id;
        let record = self
            .records
            .entry(user_id.to_string())
            .or_insert_with(|| PresenceRecord::new(room_id, user_id, now));
        record.last_update = now;
        record
    }

    pub fn update_presence(&mut self, user_id: &str, state: PresenceState) -> PresenceRecord {
        self.update_presence_at(user_id, state, Instant::now())
    }

    pub fn update_presence_at(&mut self, user_id: &str, state: PresenceState, now: Instant) -> PresenceRecord {
        let record = self.record_mut(user_id, now);
        record.state = state;
        record.clone()
    }

    pub fn update_cursor(&mut self, user_id: &str, document_id: Uuid, position: usize) -> PresenceRecord {
        let record = self.record_mut(user_id, Instant::now());
        record.document_id = Some(document_id);
        record.cursor = Some(position);
        record.clone()
    }

    pub fn update_selection(
        &mut self,
        user_id: &str,
        document_id: Uuid,
        range: SelectionRange,
    ) -> PresenceRecord {
        let record = self.record_mut(user_id, Instant::now());
        record.document_id = Some(document_id);
        record.selection = Some(range);
        record.clone()
    }

    /// Refresh a participant's activity without changing anything else.
    pub fn touch(&mut self, user_id: &str) {
        self.touch_at(user_id, Instant::now());
    }

    pub fn touch_at(&mut self, user_id: &str, now: Instant) {
        if let Some(record) = self.records.get_mut(user_id) {
            record.last_update = now;
        }
    }

    pub fn remove(&mut self, user_id: &str) -> Option<PresenceRecord> {
        self.records.remove(user_id)
    }

    pub fn get(&self, user_id: &str) -> Option<&PresenceRecord> {
        self.records.get(user_id)
    }

    /// Participants updated within the timeout and not offline, by user id.
    pub fn active_users(&self) -> Vec<PresenceRecord> {
        self.active_users_at(Instant::now())
    }

    pub fn active_users_at(&self, now: Instant) -> Vec<PresenceRecord> {
        let mut active: Vec<PresenceRecord> = self
            .records
            .values()
            .filter(|record| record.is_active(now, self.timeout))
            .cloned()
            .collect();
        active.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        active
    }

    /// Evict records idle beyond the timeout, returning their user ids.
    pub fn sweep(&mut self) -> Vec<String> {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&mut self, now: Instant) -> Vec<String> {
        let timeout = self.timeout;
        let mut expired: Vec<String> = self
            .records
            .values()
            .filter(|record| now.saturating_duration_since(record.last_update) > timeout)
            .map(|record| record.user_id.clone())
            .collect();
        expired.sort();
        for user_id in &expired {
            self.records.remove(user_id);
        }
        expired
    }

    /// Shift cursors and selections on `op`'s document through `op`.
    pub fn transform_cursors(&mut self, op: &Operation) {
        for record in self.records.values_mut() {
            if record.document_id != Some(op.document_id()) || record.user_id == op.author_id() {
                continue;
            }
            if let Some(cursor) = record.cursor.as_mut() {
                *cursor = transform_position(*cursor, op);
            }
            if let Some(selection) = record.selection.as_mut() {
                let (position, length) = transform_range(selection.position, selection.length, op);
                *selection = SelectionRange { position, length };
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forma_core::OpKind;

    #[test]
    fn test_update_overwrites_record() {
        let mut tracker = PresenceTracker::new(Uuid::new_v4());
        let record = tracker.update_presence("alice", PresenceState::Busy);
        assert_eq!(record.state, PresenceState::Busy);

        let doc = Uuid::new_v4();
        let record = tracker.update_cursor("alice", doc, 12);
        assert_eq!(record.state, PresenceState::Busy);
        assert_eq!(record.cursor, Some(12));
        assert_eq!(record.document_id, Some(doc));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_active_users_excludes_offline_and_idle() {
        let mut tracker = PresenceTracker::with_timeout(Uuid::new_v4(), Duration::from_secs(300));
        let start = Instant::now();
        tracker.update_presence_at("alice", PresenceState::Online, start);
        tracker.update_presence_at("bob", PresenceState::Offline, start);
        tracker.update_presence_at("carol", PresenceState::Away, start + Duration::from_secs(200));

        let active: Vec<String> = tracker
            .active_users_at(start + Duration::from_secs(10))
            .into_iter()
            .map(|r| r.user_id)
            .collect();
        assert_eq!(active, vec!["alice".to_string(), "carol".to_string()]);

        let later: Vec<String> = tracker
            .active_users_at(start + Duration::from_secs(400))
            .into_iter()
            .map(|r| r.user_id)
            .collect();
        assert_eq!(later, vec!["carol".to_string()]);
    }

    #[test]
    fn test_sweep_evicts_idle() {
        let mut tracker = PresenceTracker::with_timeout(Uuid::new_v4(), Duration::from_secs(300));
        let start = Instant::now();
        tracker.update_presence_at("alice", PresenceState::Online, start);
        tracker.update_presence_at("bob", PresenceState::Online, start);
        tracker.touch_at("bob", start + Duration::from_secs(290));

        let expired = tracker.sweep_at(start + Duration::from_secs(301));
        assert_eq!(expired, vec!["alice".to_string()]);
        assert!(tracker.get("alice").is_none());
        assert!(tracker.get("bob").is_some());
    }

    #[test]
    fn test_transform_cursors() {
        let mut tracker = PresenceTracker::new(Uuid::new_v4());
        let doc = Uuid::new_v4();
        tracker.update_cursor("bob", doc, 10);
        tracker.update_selection("bob", doc, SelectionRange { position: 4, length: 4 });
        tracker.update_cursor("carol", Uuid::new_v4(), 10);

        let op = Operation::new(OpKind::Insert { position: 2, text: "abc".into() }, doc, "alice", 1);
        tracker.transform_cursors(&op);

        let bob = tracker.get("bob").unwrap();
        assert_eq!(bob.cursor, Some(13));
        assert_eq!(bob.selection, Some(SelectionRange { position: 7, length: 4 }));
        assert_eq!(tracker.get("carol").unwrap().cursor, Some(10));
    }
}
