//! Deterministic operation sequencing.
//!
//! Total order: Upserts before Deletes; within Upserts directories first,
//! then ascending path depth, then lexical; within Deletes descending path
//! depth, then lexical. The apply phase therefore never references a
//! not-yet-created parent and never removes a directory still holding
//! entries.

use std::cmp::Ordering;

use crate::fs::paths::depth;
use crate::types::{NodeType, OpKind, Operation};

/// Sort `ops` into apply order. Stable, idempotent, and a permutation of its
/// input.
#[must_use]
pub fn sequence(mut ops: Vec<Operation>) -> Vec<Operation> {
    ops.sort_by(compare);
    ops
}

fn compare(left: &Operation, right: &Operation) -> Ordering {
    match (left.kind, right.kind) {
        (OpKind::Upsert, OpKind::Delete) => return Ordering::Less,
        (OpKind::Delete, OpKind::Upsert) => return Ordering::Greater,
        _ => {}
    }
    match left.kind {
        OpKind::Upsert => {
            let left_dir = left.node_type == NodeType::Directory;
            let right_dir = right.node_type == NodeType::Directory;
            right_dir
                .cmp(&left_dir)
                .then_with(|| depth(&left.path).cmp(&depth(&right.path)))
                .then_with(|| left.path.cmp(&right.path))
        }
        OpKind::Delete => depth(&right.path)
            .cmp(&depth(&left.path))
            .then_with(|| left.path.cmp(&right.path)),
    }
}
