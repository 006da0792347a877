//! Final reconciled result with per-field provenance.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::field::{FieldPath, ScalarValue};

/// Where a final scalar value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Automated,
    HumanCorrected,
}

/// A node of the aggregated result tree. Mirrors the extraction tree
/// exactly in shape; every scalar additionally carries provenance.
///
/// Invariant: the path set of an aggregated tree equals the path set of
/// the extraction tree it was built from. Only corrected scalars differ,
/// and only in value and provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregatedNode {
    Scalar {
        value: ScalarValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page: Option<u32>,
        provenance: Provenance,
    },
    Object { children: BTreeMap<String, AggregatedNode> },
    Array { items: Vec<AggregatedNode> },
}

impl AggregatedNode {
    /// Resolve a node by path, same addressing rules as the extraction tree.
    pub fn get(&self, path: &FieldPath) -> Option<&AggregatedNode> {
        use super::field::PathSegment;
        let mut current = self;
        for segment in path.segments() {
            current = match (current, segment) {
                (AggregatedNode::Object { children }, PathSegment::Key(key)) => {
                    children.get(key)?
                }
                (AggregatedNode::Array { items }, PathSegment::Index(i)) => items.get(*i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// All scalar paths, depth-first. Used to check path conservation
    /// against the source tree.
    pub fn scalar_paths(&self) -> Vec<FieldPath> {
        let mut paths = Vec::new();
        collect(self, FieldPath::root(), &mut paths);
        paths
    }
}

fn collect(node: &AggregatedNode, path: FieldPath, out: &mut Vec<FieldPath>) {
    match node {
        AggregatedNode::Scalar { .. } => out.push(path),
        AggregatedNode::Object { children } => {
            for (key, child) in children {
                collect(child, path.child(key), out);
            }
        }
        AggregatedNode::Array { items } => {
            for (i, item) in items.iter().enumerate() {
                collect(item, path.index(i), out);
            }
        }
    }
}
