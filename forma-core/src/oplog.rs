use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

use crate::operation::Operation;

/// Default number of sequenced operations retained per document.
pub const DEFAULT_MAX_RETAINED: usize = 1000;

/// A sequenced operation and the document version it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub version: u64,
    pub operation: Operation,
    /// Content length in chars once the operation was applied.
    pub len: usize,
}

/// Append-only log of sequenced operations with bounded retention.
///
/// `floor` is the version the oldest retained entry builds on; any version
/// at or above it can be replayed.
#[derive(Debug, Clone)]
pub struct OperationLog {
    entries: VecDeque<LogEntry>,
    index: HashMap<Uuid, u64>,
    max_retained: usize,
    floor: u64,
    /// Content length at `floor`.
    floor_len: usize,
    head: u64,
}

impl OperationLog {
    /// New log for a document currently at `version` holding `len` chars.
    pub fn new(version: u64, len: usize, max_retained: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            index: HashMap::new(),
            max_retained: max_retained.max(1),
            floor: version,
            floor_len: len,
            head: version,
        }
    }

    /// Record `operation` as producing `version`, leaving `len` chars.
    pub fn append(&mut self, version: u64, operation: Operation, len: usize) {
        self.index.insert(operation.id(), version);
        self.entries.push_back(LogEntry { version, operation, len });
        self.head = version;

        while self.entries.len() > self.max_retained {
            if let Some(evicted) = self.entries.pop_front() {
                self.index.remove(&evicted.operation.id());
                self.floor = evicted.version;
                self.floor_len = evicted.len;
            }
        }
    }

    /// Content length the document had at `version`, if still retained.
    pub fn len_at(&self, version: u64) -> Option<usize> {
        if version == self.floor {
            return Some(self.floor_len);
        }
        self.entries
            .iter()
            .find(|entry| entry.version == version)
            .map(|entry| entry.len)
    }

    /// Operations sequenced after `version`, in order.
    ///
    /// `None` when that part of the history is no longer retained or the
    /// version is ahead of the log.
    pub fn since(&self, version: u64) -> Option<Vec<Operation>> {
        if version < self.floor || version > self.head {
            return None;
        }
        Some(
            self.entries
                .iter()
                .filter(|entry| entry.version > version)
                .map(|entry| entry.operation.clone())
                .collect(),
        )
    }

    /// Entries after `version`, borrowed.
    pub fn entries_since(&self, version: u64) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(move |entry| entry.version > version)
    }

    /// Version produced by the operation with this id, if still retained.
    pub fn version_of(&self, id: &Uuid) -> Option<u64> {
        self.index.get(id).copied()
    }

    pub fn get(&self, id: &Uuid) -> Option<&LogEntry> {
        let version = self.version_of(id)?;
        self.entries.iter().find(|entry| entry.version == version)
    }

    /// Oldest version that can still be replayed from.
    pub fn floor(&self) -> u64 {
        self.floor
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OpKind;

    fn op(doc: Uuid) -> Operation {
        Operation::new(OpKind::Insert { position: 0, text: "x".into() }, doc, "a", 1)
    }

    #[test]
    fn test_since_returns_tail() {
        let doc = Uuid::new_v4();
        let mut log = OperationLog::new(0, 0, 10);
        let ops: Vec<_> = (0..3).map(|_| op(doc)).collect();
        for (i, o) in ops.iter().enumerate() {
            log.append(i as u64 + 1, o.clone(), i + 1);
        }

        assert_eq!(log.since(3), Some(vec![]));
        let tail = log.since(1).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].id(), ops[1].id());
        assert_eq!(log.since(0).unwrap().len(), 3);
        assert!(log.since(4).is_none());
    }

    #[test]
    fn test_truncation() {
        let doc = Uuid::new_v4();
        let mut log = OperationLog::new(5, 0, 2);
        let first = op(doc);
        log.append(6, first.clone(), 1);
        log.append(7, op(doc), 2);
        log.append(8, op(doc), 3);

        assert_eq!(log.len(), 2);
        assert_eq!(log.floor(), 6);
        assert!(log.since(5).is_none());
        assert_eq!(log.since(6).unwrap().len(), 2);
        assert!(log.version_of(&first.id()).is_none());
        assert_eq!(log.len_at(6), Some(1));
        assert_eq!(log.len_at(8), Some(3));
        assert_eq!(log.len_at(5), None);
    }

    #[test]
    fn test_lookup_by_id() {
        let doc = Uuid::new_v4();
        let mut log = OperationLog::new(0, 0, 10);
        let o = op(doc);
        log.append(1, o.clone(), 1);
        assert_eq!(log.version_of(&o.id()), Some(1));
        assert_eq!(log.get(&o.id()).map(|e| e.version), Some(1));
    }
}
