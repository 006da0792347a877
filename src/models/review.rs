//! Review task, flagged field, and correction types.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::field::{FieldPath, ScalarValue};

/// A scalar field routed to human review: the path, the machine's value,
/// and enough context for a reviewer to locate and judge it. This is the
/// payload unit; the full tree is never sent to a reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlaggedField {
    pub path: FieldPath,
    pub value: ScalarValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
}

/// Review task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
    Expired,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Completed => "completed",
            TaskStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<TaskStatus> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "completed" => Some(TaskStatus::Completed),
            "expired" => Some(TaskStatus::Expired),
            _ => None,
        }
    }
}

/// One human review task. Created when an execution has flagged fields,
/// mutated only by the review service's completion signal (or expiry).
/// The flagged-path set recorded here is what makes correction validation
/// possible at merge time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewTask {
    pub task_id: String,
    pub document_id: String,
    pub execution_id: Uuid,
    pub flagged_paths: BTreeSet<FieldPath>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A reviewer's answer for one flagged field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub path: FieldPath,
    pub corrected_value: ScalarValue,
    pub reviewer_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_round_trips() {
        for status in [TaskStatus::Pending, TaskStatus::Completed, TaskStatus::Expired] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("open"), None);
    }

    #[test]
    fn correction_serde_uses_path_text() {
        let correction = Correction {
            path: "diagnosis.immunostains[1]".parse().unwrap(),
            corrected_value: ScalarValue::Text("PR positive".into()),
            reviewer_id: "reviewer-7".into(),
        };
        let json = serde_json::to_string(&correction).unwrap();
        assert!(json.contains("\"path\":\"diagnosis.immunostains[1]\""));
        let back: Correction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, correction);
    }

    #[test]
    fn corrected_date_strings_deserialize_as_dates() {
        let json = r#"{"path":"dob","corrected_value":"1990-02-01","reviewer_id":"r1"}"#;
        let correction: Correction = serde_json::from_str(json).unwrap();
        assert!(matches!(correction.corrected_value, ScalarValue::Date(_)));
    }
}
