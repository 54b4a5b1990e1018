//! Conflict detection and resolution.
//!
//! Only operations whose effects the transform merges but a user may want
//! arbitrated form conflicts here: two writes to the same property path and
//! overlapping formats of the same attribute. Edits the transform cannot
//! merge at all (see [`crate::transform::mergeable`]) are settled by
//! sequencing order through [`Conflict::settled`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::operation::{OpKind, Operation};
use crate::role::Role;
use crate::transform::transform_all;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    #[default]
    LastWriterWins,
    FirstWriterWins,
    /// Fold every contender through the transform in timestamp order.
    OperationalTransform,
    /// Highest role wins; equal roles fall back to last-writer-wins.
    Priority,
}

impl ResolutionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionStrategy::LastWriterWins => "last_writer_wins",
            ResolutionStrategy::FirstWriterWins => "first_writer_wins",
            ResolutionStrategy::OperationalTransform => "operational_transform",
            ResolutionStrategy::Priority => "priority",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "last_writer_wins" | "lww" => Ok(ResolutionStrategy::LastWriterWins),
            "first_writer_wins" | "fww" => Ok(ResolutionStrategy::FirstWriterWins),
            "operational_transform" | "ot" => Ok(ResolutionStrategy::OperationalTransform),
            "priority" => Ok(ResolutionStrategy::Priority),
            other => Err(format!("unknown resolution strategy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

/// A set of concurrent operations that cannot all take effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: Uuid,
    pub document_id: Uuid,
    /// Contenders, incoming operation first.
    pub operations: Vec<Operation>,
    pub detected_at: u64,
    pub status: ConflictStatus,
    pub strategy: Option<ResolutionStrategy>,
    pub winner: Option<Operation>,
    pub losers: Vec<Operation>,
}

impl Conflict {
    /// A structural clash decided by sequencing order: `winner` is already
    /// applied and `loser` could not be reconciled with it.
    pub fn settled(loser: Operation, winner: Operation) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id: winner.document_id(),
            operations: vec![loser.clone(), winner.clone()],
            detected_at: crate::now_millis(),
            status: ConflictStatus::Resolved,
            strategy: Some(ResolutionStrategy::FirstWriterWins),
            winner: Some(winner),
            losers: vec![loser],
        }
    }
}

/// Winner and losers of a resolved conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub winner: Operation,
    pub losers: Vec<Operation>,
}

#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    strategy: ResolutionStrategy,
    /// Maximum timestamp distance for two operations to conflict; `None`
    /// lets concurrency alone decide.
    window: Option<u64>,
}

impl ConflictResolver {
    pub fn new(strategy: ResolutionStrategy) -> Self {
        Self { strategy, window: None }
    }

    pub fn with_window(mut self, window: Option<u64>) -> Self {
        self.window = window;
        self
    }

    pub fn strategy(&self) -> ResolutionStrategy {
        self.strategy
    }

    /// Whether two concurrent operations contend for the same effect.
    pub fn conflicts(&self, a: &Operation, b: &Operation) -> bool {
        if a.id() == b.id() || a.document_id() != b.document_id() || a.author_id() == b.author_id() {
            return false;
        }
        if a.is_noop() || b.is_noop() {
            return false;
        }
        if let Some(window) = self.window {
            if a.timestamp().abs_diff(b.timestamp()) >= window {
                return false;
            }
        }
        match (a.kind(), b.kind()) {
            (OpKind::Update { path: pa, .. }, OpKind::Update { path: pb, .. }) => pa == pb,
            (
                OpKind::Format { attribute: fa, .. },
                OpKind::Format { attribute: fb, .. },
            ) if fa == fb => ranges_intersect(a, b),
            _ => false,
        }
    }

    /// Collect the operations in `concurrent` that conflict with `incoming`.
    pub fn detect(&self, incoming: &Operation, concurrent: &[Operation]) -> Option<Conflict> {
        let contenders: Vec<Operation> = concurrent
            .iter()
            .filter(|other| self.conflicts(incoming, other))
            .cloned()
            .collect();
        if contenders.is_empty() {
            return None;
        }

        let mut operations = Vec::with_capacity(contenders.len() + 1);
        operations.push(incoming.clone());
        operations.extend(contenders);
        Some(Conflict {
            id: Uuid::new_v4(),
            document_id: incoming.document_id(),
            operations,
            detected_at: crate::now_millis(),
            status: ConflictStatus::Pending,
            strategy: None,
            winner: None,
            losers: Vec::new(),
        })
    }

    /// Pick the winner of `conflict` and record the outcome on it.
    ///
    /// Deterministic: equal timestamps fall back to author id, then
    /// operation id. `role_of` is consulted only by the priority strategy.
    /// Returns `None` only for a conflict without operations.
    pub fn resolve(
        &self,
        conflict: &mut Conflict,
        role_of: impl Fn(&str) -> Role,
    ) -> Option<Resolution> {
        let mut ordered: Vec<&Operation> = conflict.operations.iter().collect();
        ordered.sort_by(|a, b| a.precedence().cmp(&b.precedence()));

        let resolution = match self.strategy {
            ResolutionStrategy::OperationalTransform => {
                let (last, earlier) = ordered.split_last()?;
                Resolution {
                    winner: transform_all(last, earlier.iter().copied()),
                    losers: Vec::new(),
                }
            }
            strategy => {
                let winner = match strategy {
                    ResolutionStrategy::FirstWriterWins => ordered.first(),
                    ResolutionStrategy::Priority => ordered.iter().max_by(|a, b| {
                        (role_of(a.author_id()).rank(), a.precedence())
                            .cmp(&(role_of(b.author_id()).rank(), b.precedence()))
                    }),
                    _ => ordered.last(),
                }
                .map(|op| (*op).clone())?;
                let losers = ordered
                    .iter()
                    .filter(|op| op.id() != winner.id())
                    .map(|op| (*op).clone())
                    .collect();
                Resolution { winner, losers }
            }
        };

        conflict.status = ConflictStatus::Resolved;
        conflict.strategy = Some(self.strategy);
        conflict.winner = Some(resolution.winner.clone());
        conflict.losers = resolution.losers.clone();
        log::debug!(
            "Resolved conflict {} ({} contenders) with {}: winner {}",
            conflict.id,
            conflict.operations.len(),
            self.strategy,
            resolution.winner.id()
        );
        Some(resolution)
    }
}

fn ranges_intersect(a: &Operation, b: &Operation) -> bool {
    match (a.kind().range(), b.kind().range()) {
        (Some((a_pos, a_end)), Some((b_pos, b_end))) => !(a_end <= b_pos || b_end <= a_pos),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FieldValue;

    fn update(doc: Uuid, author: &str, ts: u64, value: &str) -> Operation {
        Operation::new(
            OpKind::Update { path: "fields.email.label".into(), value: value.into() },
            doc,
            author,
            ts,
        )
    }

    fn resolve(strategy: ResolutionStrategy, incoming: &Operation, others: &[Operation]) -> Resolution {
        let resolver = ConflictResolver::new(strategy);
        let mut conflict = resolver.detect(incoming, others).unwrap();
        let resolution = resolver
            .resolve(&mut conflict, |user| match user {
                "owner" => Role::Owner,
                _ => Role::Editor,
            })
            .unwrap();
        assert_eq!(conflict.status, ConflictStatus::Resolved);
        assert_eq!(conflict.winner.as_ref(), Some(&resolution.winner));
        resolution
    }

    #[test]
    fn test_detection_scope() {
        let doc = Uuid::new_v4();
        let resolver = ConflictResolver::default();
        let a = update(doc, "alice", 1, "A");
        let b = update(doc, "bob", 2, "B");
        assert!(resolver.conflicts(&a, &b));
        assert!(!resolver.conflicts(&a, &update(doc, "alice", 3, "again")));

        let ins = Operation::new(OpKind::Insert { position: 0, text: "x".into() }, doc, "bob", 1);
        let del = Operation::new(OpKind::Delete { position: 0, length: 3 }, doc, "alice", 1);
        assert!(!resolver.conflicts(&ins, &del));

        let fmt = |author: &str, position: usize, attribute: &str| {
            Operation::new(
                OpKind::Format {
                    position,
                    length: 4,
                    attribute: attribute.into(),
                    value: FieldValue::Bool(true),
                },
                doc,
                author,
                1,
            )
        };
        assert!(resolver.conflicts(&fmt("a", 0, "bold"), &fmt("b", 3, "bold")));
        assert!(!resolver.conflicts(&fmt("a", 0, "bold"), &fmt("b", 4, "bold")));
        assert!(!resolver.conflicts(&fmt("a", 0, "bold"), &fmt("b", 2, "italic")));
    }

    #[test]
    fn test_moves_are_left_to_sequencing() {
        let doc = Uuid::new_v4();
        let resolver = ConflictResolver::default();
        let mv = |author: &str, position: usize| {
            Operation::new(OpKind::Move { position, length: 2, target: 0 }, doc, author, 1)
        };
        assert!(!resolver.conflicts(&mv("a", 1), &mv("b", 2)));

        let conflict = Conflict::settled(mv("b", 2), mv("a", 1));
        assert_eq!(conflict.status, ConflictStatus::Resolved);
        assert_eq!(conflict.strategy, Some(ResolutionStrategy::FirstWriterWins));
        assert_eq!(conflict.winner.as_ref().map(|op| op.author_id()), Some("a"));
        assert_eq!(conflict.losers.len(), 1);
        assert_eq!(conflict.operations.len(), 2);
    }

    #[test]
    fn test_window() {
        let doc = Uuid::new_v4();
        let resolver = ConflictResolver::default().with_window(Some(5));
        assert!(resolver.conflicts(&update(doc, "a", 1, "x"), &update(doc, "b", 5, "y")));
        assert!(!resolver.conflicts(&update(doc, "a", 1, "x"), &update(doc, "b", 6, "y")));
    }

    #[test]
    fn test_last_and_first_writer() {
        let doc = Uuid::new_v4();
        let early = update(doc, "alice", 3, "early");
        let late = update(doc, "bob", 9, "late");

        let lww = resolve(ResolutionStrategy::LastWriterWins, &early, &[late.clone()]);
        assert_eq!(lww.winner.id(), late.id());
        assert_eq!(lww.losers.len(), 1);
        assert_eq!(lww.losers[0].id(), early.id());

        let fww = resolve(ResolutionStrategy::FirstWriterWins, &early, &[late.clone()]);
        assert_eq!(fww.winner.id(), early.id());
    }

    #[test]
    fn test_timestamp_ties_use_author_then_id() {
        let doc = Uuid::new_v4();
        let a = update(doc, "alice", 5, "a");
        let b = update(doc, "bob", 5, "b");
        let first = resolve(ResolutionStrategy::LastWriterWins, &a, &[b.clone()]);
        let second = resolve(ResolutionStrategy::LastWriterWins, &b, &[a.clone()]);
        assert_eq!(first.winner.id(), b.id());
        assert_eq!(second.winner.id(), b.id());
    }

    #[test]
    fn test_priority() {
        let doc = Uuid::new_v4();
        let owner = update(doc, "owner", 1, "owner");
        let editor = update(doc, "editor", 10, "editor");
        let res = resolve(ResolutionStrategy::Priority, &editor, &[owner.clone()]);
        assert_eq!(res.winner.id(), owner.id());

        let other_editor = update(doc, "editor2", 12, "later");
        let res = resolve(ResolutionStrategy::Priority, &editor, &[other_editor.clone()]);
        assert_eq!(res.winner.id(), other_editor.id());
    }

    #[test]
    fn test_operational_transform_keeps_everything() {
        let doc = Uuid::new_v4();
        let a = update(doc, "alice", 2, "a");
        let b = update(doc, "bob", 4, "b");
        let res = resolve(ResolutionStrategy::OperationalTransform, &a, &[b.clone()]);
        assert!(res.losers.is_empty());
        assert_eq!(res.winner.id(), b.id());
        assert!(!res.winner.is_noop());
    }

    #[test]
    fn test_empty_conflict_has_no_winner() {
        let mut conflict = Conflict {
            id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            operations: Vec::new(),
            detected_at: 0,
            status: ConflictStatus::Pending,
            strategy: None,
            winner: None,
            losers: Vec::new(),
        };
        assert!(ConflictResolver::default().resolve(&mut conflict, |_| Role::Editor).is_none());
        assert_eq!(conflict.status, ConflictStatus::Pending);
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!("lww".parse::<ResolutionStrategy>(), Ok(ResolutionStrategy::LastWriterWins));
        assert_eq!(
            "first-writer-wins".parse::<ResolutionStrategy>(),
            Ok(ResolutionStrategy::FirstWriterWins)
        );
        assert!("coin_flip".parse::<ResolutionStrategy>().is_err());
    }
}
