//! Path-based reconciliation of human corrections into extraction trees.
//!
//! The merge rebuilds the original tree with provenance on every scalar:
//! corrected leaves take the reviewer's value, everything else keeps the
//! automated one. Structure is copied verbatim, so the result has exactly
//! the paths of the input, nothing added, removed, or renamed. Arbitrarily
//! deep, blueprint-dependent nesting is handled uniformly by path; no
//! field name is ever special-cased.

use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use crate::models::{AggregatedNode, Correction, FieldNode, FieldPath, Provenance};
use crate::store::{self, layout, ObjectStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    /// The review output references a path that does not exist as a
    /// scalar in the original tree. A protocol violation between review
    /// output and the original request; never retried.
    #[error("correction targets unknown path: {0}")]
    UnknownCorrectionPath(FieldPath),

    /// The path exists but was never offered for review.
    #[error("correction targets path that was not flagged for review: {0}")]
    CorrectionNotFlagged(FieldPath),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Merge corrections into the original tree.
///
/// The whole correction set is validated before any node is built, so an
/// invalid path can never leave a partially merged result behind. When the
/// same path appears twice in one delivery the last correction wins,
/// matching reviewer output order upstream.
pub fn reconcile(
    original: &FieldNode,
    corrections: &[Correction],
    flagged_paths: &BTreeSet<FieldPath>,
) -> Result<AggregatedNode, AggregationError> {
    let mut by_path: BTreeMap<&FieldPath, &Correction> = BTreeMap::new();
    for correction in corrections {
        by_path.insert(&correction.path, correction);
    }

    for path in by_path.keys() {
        match original.get(path) {
            Some(FieldNode::Scalar { .. }) => {}
            _ => return Err(AggregationError::UnknownCorrectionPath((*path).clone())),
        }
        if !flagged_paths.contains(*path) {
            return Err(AggregationError::CorrectionNotFlagged((*path).clone()));
        }
    }

    Ok(merge(original, FieldPath::root(), &by_path))
}

fn merge(
    node: &FieldNode,
    path: FieldPath,
    corrections: &BTreeMap<&FieldPath, &Correction>,
) -> AggregatedNode {
    match node {
        FieldNode::Scalar {
            value,
            confidence,
            page,
        } => match corrections.get(&path) {
            Some(correction) => AggregatedNode::Scalar {
                value: correction.corrected_value.clone(),
                confidence: *confidence,
                page: *page,
                provenance: Provenance::HumanCorrected,
            },
            None => AggregatedNode::Scalar {
                value: value.clone(),
                confidence: *confidence,
                page: *page,
                provenance: Provenance::Automated,
            },
        },
        FieldNode::Object { children } => AggregatedNode::Object {
            children: children
                .iter()
                .map(|(key, child)| (key.clone(), merge(child, path.child(key), corrections)))
                .collect(),
        },
        FieldNode::Array { items } => AggregatedNode::Array {
            items: items
                .iter()
                .enumerate()
                .map(|(i, item)| merge(item, path.index(i), corrections))
                .collect(),
        },
    }
}

/// Persist exactly one result per execution.
///
/// First writer wins: a result object that already exists is left
/// untouched and the call reports `false`, which is how a retried or
/// duplicate completion signal becomes a no-op instead of a second write.
pub fn persist_result(
    store: &dyn ObjectStore,
    execution_id: Uuid,
    result: &AggregatedNode,
) -> Result<bool, AggregationError> {
    let key = layout::aggregated_result_key(execution_id);
    let stored = store::put_json_if_absent(store, &key, result)?;
    if !stored {
        tracing::debug!(%execution_id, "Aggregated result already persisted, duplicate discarded");
    }
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScalarValue;
    use crate::store::FsObjectStore;

    fn pathology_tree() -> FieldNode {
        FieldNode::object([
            ("patient_name", FieldNode::scalar("Jane Doe", Some(0.95))),
            ("dob", FieldNode::scalar_on_page("1990-01-01", Some(0.40), 1)),
            (
                "diagnosis",
                FieldNode::object([
                    ("tumor_size", FieldNode::scalar(2.3, Some(0.55))),
                    (
                        "immunostains",
                        FieldNode::array([
                            FieldNode::scalar("ER positive", Some(0.92)),
                            FieldNode::scalar("PR negatve", Some(0.33)),
                        ]),
                    ),
                ]),
            ),
        ])
    }

    fn correction(path: &str, value: impl Into<ScalarValue>) -> Correction {
        Correction {
            path: path.parse().unwrap(),
            corrected_value: value.into(),
            reviewer_id: "reviewer-7".into(),
        }
    }

    fn flagged(paths: &[&str]) -> BTreeSet<FieldPath> {
        paths.iter().map(|p| p.parse().unwrap()).collect()
    }

    fn provenance_at(result: &AggregatedNode, path: &str) -> Provenance {
        match result.get(&path.parse().unwrap()) {
            Some(AggregatedNode::Scalar { provenance, .. }) => *provenance,
            other => panic!("Expected scalar at {path}, got {other:?}"),
        }
    }

    fn value_at(result: &AggregatedNode, path: &str) -> ScalarValue {
        match result.get(&path.parse().unwrap()) {
            Some(AggregatedNode::Scalar { value, .. }) => value.clone(),
            other => panic!("Expected scalar at {path}, got {other:?}"),
        }
    }

    #[test]
    fn merge_without_corrections_is_identity_marked_automated() {
        let tree = pathology_tree();
        let result = reconcile(&tree, &[], &BTreeSet::new()).unwrap();

        for path in tree.scalar_paths() {
            let text = path.to_string();
            assert_eq!(provenance_at(&result, &text), Provenance::Automated);
            match (tree.get(&path), result.get(&path)) {
                (
                    Some(FieldNode::Scalar { value, confidence, page }),
                    Some(AggregatedNode::Scalar {
                        value: merged,
                        confidence: merged_confidence,
                        page: merged_page,
                        ..
                    }),
                ) => {
                    assert_eq!(merged, value);
                    assert_eq!(merged_confidence, confidence);
                    assert_eq!(merged_page, page);
                }
                other => panic!("Node mismatch at {text}: {other:?}"),
            }
        }
    }

    #[test]
    fn corrected_fields_take_reviewer_value_and_provenance() {
        let tree = pathology_tree();
        let corrections = vec![
            correction("diagnosis.immunostains[1]", "PR negative"),
            correction("dob", "1990-02-01"),
        ];
        let flagged = flagged(&["diagnosis.immunostains[1]", "dob", "diagnosis.tumor_size"]);

        let result = reconcile(&tree, &corrections, &flagged).unwrap();

        assert_eq!(
            value_at(&result, "diagnosis.immunostains[1]"),
            ScalarValue::Text("PR negative".into())
        );
        assert_eq!(
            provenance_at(&result, "diagnosis.immunostains[1]"),
            Provenance::HumanCorrected
        );
        // Flagged but uncorrected stays automated with the machine value
        assert_eq!(provenance_at(&result, "diagnosis.tumor_size"), Provenance::Automated);
        assert_eq!(provenance_at(&result, "patient_name"), Provenance::Automated);
    }

    #[test]
    fn paths_are_conserved_exactly() {
        let tree = pathology_tree();
        let corrections = vec![correction("dob", "1990-02-01")];
        let result = reconcile(&tree, &corrections, &flagged(&["dob"])).unwrap();

        assert_eq!(result.scalar_paths(), tree.scalar_paths());
    }

    #[test]
    fn unknown_path_is_rejected() {
        let tree = pathology_tree();
        let corrections = vec![correction("diagnosis.grade", "II")];
        let err = reconcile(&tree, &corrections, &flagged(&["diagnosis.grade"])).unwrap_err();
        assert!(matches!(err, AggregationError::UnknownCorrectionPath(_)));
    }

    #[test]
    fn structural_path_is_rejected() {
        let tree = pathology_tree();
        // `diagnosis` exists but is an object, not a correctable scalar
        let corrections = vec![correction("diagnosis", "x")];
        let err = reconcile(&tree, &corrections, &flagged(&["diagnosis"])).unwrap_err();
        assert!(matches!(err, AggregationError::UnknownCorrectionPath(_)));
    }

    #[test]
    fn unflagged_path_is_rejected() {
        let tree = pathology_tree();
        // patient_name exists but was accepted, not offered for review
        let corrections = vec![correction("patient_name", "Janet Doe")];
        let err = reconcile(&tree, &corrections, &flagged(&["dob"])).unwrap_err();
        assert!(matches!(err, AggregationError::CorrectionNotFlagged(_)));
    }

    #[test]
    fn duplicate_corrections_last_wins() {
        let tree = pathology_tree();
        let corrections = vec![
            correction("dob", "1990-03-03"),
            correction("dob", "1990-02-01"),
        ];
        let result = reconcile(&tree, &corrections, &flagged(&["dob"])).unwrap();
        assert_eq!(
            value_at(&result, "dob"),
            ScalarValue::Text("1990-02-01".into())
        );
    }

    #[test]
    fn reconcile_is_idempotent() {
        let tree = pathology_tree();
        let corrections = vec![correction("dob", "1990-02-01")];
        let flagged = flagged(&["dob"]);

        let first = reconcile(&tree, &corrections, &flagged).unwrap();
        let second = reconcile(&tree, &corrections, &flagged).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn persist_result_is_first_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).unwrap();
        let execution_id = Uuid::new_v4();

        let tree = pathology_tree();
        let result = reconcile(&tree, &[], &BTreeSet::new()).unwrap();

        assert!(persist_result(&store, execution_id, &result).unwrap());
        // Duplicate delivery: no second write, original content intact
        assert!(!persist_result(&store, execution_id, &result).unwrap());

        let key = layout::aggregated_result_key(execution_id);
        let loaded: AggregatedNode = store::get_json(&store, &key).unwrap();
        assert_eq!(loaded.scalar_paths(), result.scalar_paths());
    }
}
