//! Confidence evaluation over extraction trees.
//!
//! Walks a tree depth-first and partitions its scalar fields into accepted
//! and flagged sets against a single global threshold. Object and array
//! nodes are structural and never flagged themselves. Blueprint differences
//! change tree shape, never the evaluation logic.
//!
//! Evaluation is pure: the same tree and threshold always produce the same
//! partition, so a run can be replayed deterministically.

use std::collections::BTreeSet;

use crate::models::{FieldNode, FieldPath, FlaggedField};

/// Disjoint, exhaustive split of a tree's scalar paths.
#[derive(Debug, Clone, Default)]
pub struct Partition {
    /// Scalar paths at or above the threshold.
    pub accepted: Vec<FieldPath>,
    /// Scalar fields below the threshold or without a confidence score,
    /// with the context a reviewer needs.
    pub flagged: Vec<FlaggedField>,
}

impl Partition {
    /// Nothing to review; the pipeline can finalize directly.
    pub fn is_straight_through(&self) -> bool {
        self.flagged.is_empty()
    }

    pub fn flagged_paths(&self) -> BTreeSet<FieldPath> {
        self.flagged.iter().map(|f| f.path.clone()).collect()
    }
}

/// Partition all scalar fields of `tree` against `threshold`.
///
/// A field is flagged iff its confidence is strictly below the threshold
/// or absent. Confidence exactly at the threshold is accepted.
pub fn evaluate(tree: &FieldNode, threshold: f32) -> Partition {
    let mut partition = Partition::default();
    walk(tree, FieldPath::root(), threshold, &mut partition);
    partition
}

fn walk(node: &FieldNode, path: FieldPath, threshold: f32, out: &mut Partition) {
    match node {
        FieldNode::Scalar {
            value,
            confidence,
            page,
        } => match confidence {
            Some(c) if *c >= threshold => out.accepted.push(path),
            // Missing confidence means the engine could not vouch for the
            // field, so a human has to.
            _ => out.flagged.push(FlaggedField {
                path,
                value: value.clone(),
                confidence: *confidence,
                page: *page,
            }),
        },
        FieldNode::Object { children } => {
            for (key, child) in children {
                walk(child, path.child(key), threshold, out);
            }
        }
        FieldNode::Array { items } => {
            for (i, item) in items.iter().enumerate() {
                walk(item, path.index(i), threshold, out);
            }
        }
    }
}
