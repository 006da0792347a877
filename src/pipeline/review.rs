//! Human review orchestration.
//!
//! Builds the minimal payload for the review service (only the flagged
//! fields, grouped by page, plus page context so a reviewer can locate
//! each value), creates the task, and records it against the execution.
//! The full tree is never sent: payload size and reviewer load stay
//! proportional to what is actually uncertain.

use std::collections::BTreeMap;

use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{self, DatabaseError};
use crate::models::{Document, FlaggedField, ReviewTask, TaskStatus};

/// Fields without page information group under this key.
const UNPAGED: u32 = 0;

/// What the review service receives for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewPayload {
    pub execution_id: Uuid,
    pub document_id: String,
    /// Flagged fields keyed by 1-based page number (0 = no page info),
    /// so the task UI can walk the document page by page.
    pub fields_by_page: BTreeMap<u32, Vec<FlaggedField>>,
    /// Page context references (image URLs or equivalent) from extraction.
    pub page_refs: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("review service unreachable: {0}")]
    Unreachable(String),

    #[error("review service rejected the payload (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("review service error (status {status}): {body}")]
    Service { status: u16, body: String },

    #[error("malformed review service response: {0}")]
    MalformedResponse(String),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

impl ReviewError {
    /// Whether the coordinator should retry the submission. A rejected
    /// payload (malformed paths, workforce misconfiguration) repeats
    /// identically and is not retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReviewError::Unreachable(_) | ReviewError::Service { .. }
        )
    }
}

/// Review service abstraction (allows mocking for tests).
pub trait ReviewService: Send + Sync {
    /// Create a human task; returns the service's task id.
    fn create_task(&self, payload: &ReviewPayload) -> Result<String, ReviewError>;
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Submits flagged subsets for review and tracks task identity.
pub struct ReviewOrchestrator {
    service: Box<dyn ReviewService>,
}

impl ReviewOrchestrator {
    pub fn new(service: Box<dyn ReviewService>) -> Self {
        Self { service }
    }

    /// Create a review task for the flagged fields of one execution.
    ///
    /// Idempotent per execution: when a Pending task already exists
    /// (duplicate signal, resumed crash, coordinator retry) it is returned
    /// as-is and no second task is created.
    pub fn submit_for_review(
        &self,
        conn: &Connection,
        document: &Document,
        flagged: &[FlaggedField],
        page_refs: &[String],
    ) -> Result<ReviewTask, ReviewError> {
        if let Some(existing) = db::find_open_task(conn, document.execution_id)? {
            tracing::debug!(
                execution_id = %document.execution_id,
                task_id = %existing.task_id,
                "Review task already open, not creating another"
            );
            return Ok(existing);
        }

        let payload = build_payload(document, flagged, page_refs);
        let task_id = self.service.create_task(&payload)?;

        let task = ReviewTask {
            task_id,
            document_id: document.document_id.clone(),
            execution_id: document.execution_id,
            flagged_paths: flagged.iter().map(|f| f.path.clone()).collect(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        };
        db::insert_review_task(conn, &task)?;

        tracing::info!(
            execution_id = %document.execution_id,
            task_id = %task.task_id,
            fields = flagged.len(),
            "Review task created"
        );
        Ok(task)
    }
}

/// Group flagged fields by page for the task UI.
fn build_payload(
    document: &Document,
    flagged: &[FlaggedField],
    page_refs: &[String],
) -> ReviewPayload {
    let mut fields_by_page: BTreeMap<u32, Vec<FlaggedField>> = BTreeMap::new();
    for field in flagged {
        fields_by_page
            .entry(field.page.unwrap_or(UNPAGED))
            .or_default()
            .push(field.clone());
    }
    ReviewPayload {
        execution_id: document.execution_id,
        document_id: document.document_id.clone(),
        fields_by_page,
        page_refs: page_refs.to_vec(),
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// HTTP client for the review service.
pub struct HttpReviewService {
    base_url: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl HttpReviewService {
    pub fn new(base_url: &str, timeout_secs: u64) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout_secs,
        }
    }
}

/// Response body from task creation.
#[derive(Deserialize)]
struct CreateTaskResponse {
    task_id: String,
}

impl ReviewService for HttpReviewService {
    fn create_task(&self, payload: &ReviewPayload) -> Result<String, ReviewError> {
        let url = format!("{}/tasks", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    ReviewError::Unreachable(format!(
                        "request timed out after {}s",
                        self.timeout_secs
                    ))
                } else {
                    ReviewError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            let code = status.as_u16();
            return Err(if (400..500).contains(&code) {
                ReviewError::Rejected { status: code, body }
            } else {
                ReviewError::Service { status: code, body }
            });
        }

        let parsed: CreateTaskResponse = response
            .json()
            .map_err(|e| ReviewError::MalformedResponse(e.to_string()))?;

        Ok(parsed.task_id)
    }
}

// ---------------------------------------------------------------------------
// Mock service
// ---------------------------------------------------------------------------

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Mock review service for testing. Issues sequential task ids and keeps
/// the payloads it saw.
#[derive(Default)]
pub struct MockReviewService {
    failures: AtomicUsize,
    calls: AtomicUsize,
    payloads: Mutex<Vec<ReviewPayload>>,
}

impl MockReviewService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `n` create calls with a transient error.
    pub fn failing_first(self, n: usize) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_payload(&self) -> Option<ReviewPayload> {
        self.payloads.lock().unwrap().last().cloned()
    }
}

impl ReviewService for MockReviewService {
    fn create_task(&self, payload: &ReviewPayload) -> Result<String, ReviewError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let remaining = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if remaining {
            return Err(ReviewError::Unreachable("mock outage".into()));
        }
        self.payloads.lock().unwrap().push(payload.clone());
        Ok(format!("task-{call}"))
    }
}
