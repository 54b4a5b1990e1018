//! Pairwise operational transformation.
//!
//! `transform(a, b)` rewrites `a` so that it can be applied after `b`, where
//! both were issued against the same document state. For every pair
//! [`mergeable`] accepts, applying `b` then `transform(a, b)` yields the same
//! document as applying `a` then `transform(b, a)`.
//!
//! Inserts, deletes and ranges are mapped by position. A move relocates a
//! span to a target that indexes the content with the span removed; a delete
//! or move meeting a move is resolved on char identity instead: both sides
//! compute the same merged arrangement and each transform is the single edit
//! that reaches it. Positions never go below zero.

use std::ops::Range;

use crate::operation::{char_len, OpKind, Operation};

/// Primitive content change performed by an operation.
#[derive(Debug, Clone, Copy)]
enum Edit {
    Insert { at: usize, len: usize },
    Delete { at: usize, len: usize },
}

fn edits(op: &Operation) -> Vec<Edit> {
    if op.is_noop() {
        return Vec::new();
    }
    match op.kind() {
        OpKind::Insert { position, text } => vec![Edit::Insert { at: *position, len: char_len(text) }],
        OpKind::Delete { position, length } => vec![Edit::Delete { at: *position, len: *length }],
        OpKind::Move { position, length, target } => vec![
            Edit::Delete { at: *position, len: *length },
            Edit::Insert { at: *target, len: *length },
        ],
        _ => Vec::new(),
    }
}

/// Deterministic tie break between two inserts at the same point: the
/// smaller author goes first, operation id settles same-author ties.
fn goes_first(a: &Operation, b: &Operation) -> bool {
    (a.author_id(), a.id()) < (b.author_id(), b.id())
}

/// Where a zero-width point ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Landing {
    At(usize),
    /// The point sat strictly inside deleted text; carries the deletion start.
    Absorbed(usize),
}

impl Landing {
    fn position(self) -> usize {
        match self {
            Landing::At(p) | Landing::Absorbed(p) => p,
        }
    }
}

/// Map a point through `against`. With `tie` set, an insert landing exactly
/// on the point is ordered against that operation; otherwise the point stays
/// in front of it.
fn map_point(pos: usize, against: &Operation, tie: Option<&Operation>) -> Landing {
    if let OpKind::Move { position: s, length: n, target: t } = *against.kind() {
        if !against.is_noop() && s < pos && pos < s + n {
            return Landing::At(t + (pos - s));
        }
    }
    let mut pos = pos;
    for edit in edits(against) {
        match edit {
            Edit::Insert { at, len } => {
                let shifts = at < pos || (at == pos && tie.is_some_and(|op| goes_first(against, op)));
                if shifts {
                    pos += len;
                }
            }
            Edit::Delete { at, len } => {
                if at < pos {
                    if pos < at + len {
                        return Landing::Absorbed(at);
                    }
                    pos = pos.saturating_sub(len);
                }
            }
        }
    }
    Landing::At(pos)
}

fn shift_range(start: usize, len: usize, edit: Edit) -> (usize, usize) {
    match edit {
        Edit::Insert { at, len: n } => {
            if at <= start {
                (start + n, len)
            } else if at < start + len {
                (start, len + n)
            } else {
                (start, len)
            }
        }
        Edit::Delete { at, len: n } => {
            let end = start + len;
            let other_end = at + n;
            if other_end <= start {
                (start.saturating_sub(n), len)
            } else if at >= end {
                (start, len)
            } else {
                let overlap = end.min(other_end) - start.max(at);
                (start.min(at), len.saturating_sub(overlap))
            }
        }
    }
}

/// Map a half-open range through `against` using delete semantics: inserts
/// at or before the start shift it, inserts strictly inside extend it, and
/// overlapping deletions shrink it.
fn map_range(start: usize, len: usize, against: &Operation) -> (usize, usize) {
    if let OpKind::Move { position: s, length: n, target: t } = *against.kind() {
        if !against.is_noop() && len > 0 && s <= start && start + len <= s + n {
            return (t + (start - s), len);
        }
    }
    edits(against)
        .into_iter()
        .fold((start, len), |(start, len), edit| shift_range(start, len, edit))
}

/// Move against a concurrent insert: text landing inside the span travels
/// with it, anything else shifts the source or target.
fn transform_move((source, length, target): (usize, usize, usize), op: &Operation, against: &Operation) -> OpKind {
    let OpKind::Insert { position: at, text } = against.kind() else {
        return OpKind::Move { position: source, length, target };
    };
    let (at, len) = (*at, char_len(text));
    let mut target = target;
    if !(source < at && at < source + length) {
        let removed = if at <= source { at } else { at - length };
        if removed < target || (removed == target && goes_first(against, op)) {
            target += len;
        }
    }
    let (source, length) = shift_range(source, length, Edit::Insert { at, len });
    OpKind::Move { position: source, length, target }
}

// ─── Identity merge for moves ────────────────────────────

/// How a pair of operations combines.
enum Merge {
    /// Neither side is a delete or move meeting a move.
    Positional,
    /// Final arrangement of the first `len` chars, by original index.
    Merged(Vec<usize>),
    /// No pair of single edits reaches a common state.
    Conflict,
}

/// Last char index either operation reaches.
fn extent(kind: &OpKind) -> usize {
    match *kind {
        OpKind::Delete { position, length } => position + length,
        OpKind::Move { position, length, target } => (position + length).max(target + length),
        _ => 0,
    }
}

fn span(position: usize, length: usize) -> Range<usize> {
    position..position + length
}

fn without(slots: &[usize], ids: &Range<usize>) -> Vec<usize> {
    slots.iter().copied().filter(|id| !ids.contains(id)).collect()
}

fn insert_at(slots: &mut Vec<usize>, at: usize, block: impl IntoIterator<Item = usize>) {
    let at = at.min(slots.len());
    slots.splice(at..at, block);
}

fn index_of(slots: &[usize], id: usize) -> Option<usize> {
    slots.iter().position(|slot| *slot == id)
}

/// The first `len` chars after applying a delete or move.
fn simulate(kind: &OpKind, len: usize) -> Vec<usize> {
    let base: Vec<usize> = (0..len).collect();
    match *kind {
        OpKind::Delete { position, length } => without(&base, &span(position, length)),
        OpKind::Move { position, length, target } => {
            let moved = span(position, length);
            let mut slots = without(&base, &moved);
            insert_at(&mut slots, target, moved);
            slots
        }
        _ => base,
    }
}

/// Delete of `deleted` concurrent with a move of `moved` to `target`.
fn merge_delete_move(len: usize, deleted: Range<usize>, moved: Range<usize>, target: usize) -> Option<Vec<usize>> {
    let rest = without(&(0..len).collect::<Vec<_>>(), &moved);
    let target = target.min(rest.len());

    if moved.start <= deleted.start && deleted.end <= moved.end {
        // deleted text inside the span: the remainder still moves
        let mut merged = rest;
        insert_at(&mut merged, target, moved.filter(|id| !deleted.contains(id)));
        return Some(merged);
    }

    let outside = deleted.clone().find(|id| !moved.contains(id))?;
    let first = index_of(&rest, outside)?;
    let last = first + deleted.clone().filter(|id| !moved.contains(id)).count();
    let overlap = deleted.start < moved.end && moved.start < deleted.end;

    if !overlap {
        if first < target && target < last {
            // moved into the deleted text: it goes with it
            return Some(without(&rest, &deleted));
        }
        let mut merged = rest;
        insert_at(&mut merged, target, moved);
        return Some(without(&merged, &deleted));
    }
    // the whole span is deleted; fine unless it was carried away from the
    // rest of the deleted text
    let swallowed = deleted.start <= moved.start && moved.end <= deleted.end;
    (swallowed && first <= target && target <= last).then(|| without(&rest, &deleted))
}

/// Two concurrent moves. `a_first` orders the spans when both land in the
/// same gap.
fn merge_moves(
    len: usize,
    (a, a_target): (Range<usize>, usize),
    (b, b_target): (Range<usize>, usize),
    a_first: bool,
) -> Option<Vec<usize>> {
    if a.start < b.end && b.start < a.end {
        return None;
    }
    let (a_len, b_len) = (a.len(), b.len());
    let base: Vec<usize> = (0..len).collect();
    let rest_a = without(&base, &a);
    let rest_b = without(&base, &b);
    let a_target = a_target.min(rest_a.len());
    let b_target = b_target.min(rest_b.len());
    // where the other span sits in the content each target indexes
    let b_in_a = index_of(&rest_a, b.start)?;
    let a_in_b = index_of(&rest_b, a.start)?;
    let a_nested = b_in_a < a_target && a_target < b_in_a + b_len;
    let b_nested = a_in_b < b_target && b_target < a_in_b + a_len;
    let gap = |target: usize, other_at: usize, other_len: usize| {
        if target <= other_at {
            target
        } else {
            target - other_len
        }
    };

    let mut merged = without(&rest_a, &b);
    match (a_nested, b_nested) {
        (true, true) => return None,
        (true, false) => {
            // a lands inside b and travels with it
            let mut block: Vec<usize> = b.clone().collect();
            insert_at(&mut block, a_target - b_in_a, a);
            insert_at(&mut merged, gap(b_target, a_in_b, a_len), block);
        }
        (false, true) => {
            let mut block: Vec<usize> = a.clone().collect();
            insert_at(&mut block, b_target - a_in_b, b);
            insert_at(&mut merged, gap(a_target, b_in_a, b_len), block);
        }
        (false, false) => {
            let a_gap = gap(a_target, b_in_a, b_len);
            let b_gap = gap(b_target, a_in_b, a_len);
            // fill the later gap first so the earlier index stays valid
            if a_gap > b_gap || (a_gap == b_gap && !a_first) {
                insert_at(&mut merged, a_gap, a);
                insert_at(&mut merged, b_gap, b);
            } else {
                insert_at(&mut merged, b_gap, b);
                insert_at(&mut merged, a_gap, a);
            }
        }
    }
    Some(merged)
}

/// Symmetric: `merge(a, b)` and `merge(b, a)` arrive at the same arrangement.
fn merge(op: &Operation, against: &Operation) -> (Merge, usize) {
    let len = extent(op.kind()).max(extent(against.kind()));
    let merged = match (op.kind(), against.kind()) {
        (&OpKind::Delete { position, length }, &OpKind::Move { position: s, length: n, target })
        | (&OpKind::Move { position: s, length: n, target }, &OpKind::Delete { position, length }) => {
            merge_delete_move(len, span(position, length), span(s, n), target)
        }
        (
            &OpKind::Move { position, length, target },
            &OpKind::Move { position: s, length: n, target: t },
        ) => merge_moves(len, (span(position, length), target), (span(s, n), t), goes_first(op, against)),
        _ => return (Merge::Positional, len),
    };
    (merged.map_or(Merge::Conflict, Merge::Merged), len)
}

/// The single content edit turning `from` into `to`; `Some(None)` when
/// nothing changes. `own` marks the chars the rewritten operation moves, so a
/// rotation is expressed as moving them.
fn edit_between(from: &[usize], to: &[usize], own: &Range<usize>) -> Option<Option<OpKind>> {
    let start = from.iter().zip(to).take_while(|(a, b)| a == b).count();
    if from.len() == to.len() && start == from.len() {
        return Some(None);
    }
    if to.len() < from.len() {
        let length = from.len() - to.len();
        return (from[start + length..] == to[start..]).then_some(Some(OpKind::Delete { position: start, length }));
    }
    if to.len() > from.len() {
        return None;
    }
    let common_tail = from.iter().rev().zip(to.iter().rev()).take_while(|(a, b)| a == b).count();
    let end = from.len() - common_tail;
    let split = start + from[start..end].iter().position(|id| *id == to[start])?;
    let (left, right) = from[start..end].split_at(split - start);
    if !right.iter().chain(left).eq(to[start..end].iter()) {
        return None;
    }
    let kind = if left.iter().any(|id| own.contains(id)) {
        OpKind::Move { position: start, length: left.len(), target: start + right.len() }
    } else {
        OpKind::Move { position: split, length: right.len(), target: start }
    };
    Some(Some(kind))
}

/// Whether `transform` can reconcile two concurrent operations.
///
/// False when a delete or move carries part of a moved span away from the
/// rest, or two moves overlap or land inside each other. The operation
/// sequenced first then stands and the other is dropped.
pub fn mergeable(op: &Operation, against: &Operation) -> bool {
    if op.is_noop() || against.is_noop() || op.id() == against.id() || op.document_id() != against.document_id() {
        return true;
    }
    !matches!(merge(op, against).0, Merge::Conflict)
}

/// Transform `op` so it applies after `against`.
///
/// Both operations must have been issued against the same document state.
/// Operations on different documents, and no-ops on either side, pass
/// through unchanged. The result keeps `op`'s id, though a move may come out
/// as a delete when its span lands in deleted text. A pair that is not
/// [`mergeable`] voids `op`.
pub fn transform(op: &Operation, against: &Operation) -> Operation {
    if op.is_noop()
        || against.is_noop()
        || op.id() == against.id()
        || op.document_id() != against.document_id()
    {
        return op.clone();
    }

    match merge(op, against) {
        (Merge::Positional, _) => {}
        (Merge::Merged(merged), len) => {
            let own = match *op.kind() {
                OpKind::Move { position, length, .. } | OpKind::Delete { position, length } => span(position, length),
                _ => 0..0,
            };
            return match edit_between(&simulate(against.kind(), len), &merged, &own) {
                Some(Some(kind)) => op.with_kind(kind),
                Some(None) | None => op.voided(),
            };
        }
        (Merge::Conflict, _) => return op.voided(),
    }

    match op.kind() {
        OpKind::Insert { position, text } => match map_point(*position, against, Some(op)) {
            Landing::At(position) => op.with_kind(OpKind::Insert { position, text: text.clone() }),
            Landing::Absorbed(_) => op.voided(),
        },
        OpKind::Cursor { position } => op.with_kind(OpKind::Cursor {
            position: map_point(*position, against, None).position(),
        }),
        OpKind::Delete { position, length } => {
            let (position, length) = map_range(*position, *length, against);
            op.with_kind(OpKind::Delete { position, length })
        }
        OpKind::Selection { position, length } => {
            let (position, length) = map_range(*position, *length, against);
            op.with_kind(OpKind::Selection { position, length })
        }
        OpKind::Format { position, length, attribute, value } => {
            let (position, length) = map_range(*position, *length, against);
            op.with_kind(OpKind::Format {
                position,
                length,
                attribute: attribute.clone(),
                value: value.clone(),
            })
        }
        OpKind::Comment { position, length, text } => {
            let (position, length) = map_range(*position, *length, against);
            op.with_kind(OpKind::Comment { position, length, text: text.clone() })
        }
        OpKind::Move { position, length, target } => {
            op.with_kind(transform_move((*position, *length, *target), op, against))
        }
        OpKind::Update { path, .. } => match against.kind() {
            // concurrent writes to one path: the later write survives
            OpKind::Update { path: other, .. }
                if other == path && against.precedence() > op.precedence() =>
            {
                op.voided()
            }
            _ => op.clone(),
        },
    }
}

/// Transform `op` through a sequence of operations applied in order.
pub fn transform_all<'a>(op: &Operation, applied: impl IntoIterator<Item = &'a Operation>) -> Operation {
    applied
        .into_iter()
        .fold(op.clone(), |acc, against| transform(&acc, against))
}

/// Map a caret position through an applied operation. A caret inside
/// deleted text collapses to the deletion start.
pub fn transform_position(position: usize, against: &Operation) -> usize {
    if against.kind().is_presence() {
        return position;
    }
    map_point(position, against, None).position()
}

/// Map a `(position, length)` range through an applied operation.
pub fn transform_range(position: usize, length: usize, against: &Operation) -> (usize, usize) {
    if against.kind().is_presence() {
        return (position, length);
    }
    map_range(position, length, against)
}
