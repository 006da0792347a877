//! Document identity and pipeline lifecycle stage.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One unit of work: a source document plus the schema governing its tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Stable identity derived from the source location.
    pub document_id: String,
    /// Unique per pipeline run. Re-processing the same document gets a
    /// fresh one; prior runs are unaffected.
    pub execution_id: Uuid,
    /// Which blueprint (schema) governs this document's tree shape.
    /// Evaluation and merging never look at it; it only rides along for
    /// the extraction service.
    pub blueprint_id: String,
    /// Where the raw document blob lives.
    pub source_uri: String,
}

/// Pipeline instance stage. Persisted before each external call, so the
/// recorded value is the single source of truth for what happens next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Submitted,
    Extracting,
    Evaluating,
    Reviewing,
    /// Straight-through aggregation when nothing was flagged.
    Finalizing,
    Aggregating,
    Completed,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Submitted => "submitted",
            Stage::Extracting => "extracting",
            Stage::Evaluating => "evaluating",
            Stage::Reviewing => "reviewing",
            Stage::Finalizing => "finalizing",
            Stage::Aggregating => "aggregating",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Stage> {
        match s {
            "submitted" => Some(Stage::Submitted),
            "extracting" => Some(Stage::Extracting),
            "evaluating" => Some(Stage::Evaluating),
            "reviewing" => Some(Stage::Reviewing),
            "finalizing" => Some(Stage::Finalizing),
            "aggregating" => Some(Stage::Aggregating),
            "completed" => Some(Stage::Completed),
            "failed" => Some(Stage::Failed),
            _ => None,
        }
    }

    /// Terminal stages never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_round_trips_through_text() {
        let all = [
            Stage::Submitted,
            Stage::Extracting,
            Stage::Evaluating,
            Stage::Reviewing,
            Stage::Finalizing,
            Stage::Aggregating,
            Stage::Completed,
            Stage::Failed,
        ];
        for stage in all {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::parse("bogus"), None);
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(Stage::Completed.is_terminal());
        assert!(Stage::Failed.is_terminal());
        assert!(!Stage::Reviewing.is_terminal());
        assert!(!Stage::Submitted.is_terminal());
    }

    #[test]
    fn stage_serializes_snake_case() {
        let json = serde_json::to_string(&Stage::Aggregating).unwrap();
        assert_eq!(json, "\"aggregating\"");
    }
}
