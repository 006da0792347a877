//! Extraction service client.
//!
//! The extraction engine runs elsewhere; this module is only its contract:
//! submit a document for processing, then fetch the finished tree once the
//! completion notification arrives. Errors are split into transient and
//! permanent classes so the coordinator knows what is worth retrying.

use serde::{Deserialize, Serialize};

use crate::models::{Document, FieldNode};

/// Opaque reference to a running extraction job, as issued by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle(pub String);

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the service hands back when a job finishes: the extraction tree
/// plus per-page context references (pre-signed image URLs or equivalent)
/// forwarded to reviewers so they can locate each flagged field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionOutput {
    pub tree: FieldNode,
    #[serde(default)]
    pub page_refs: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractionClientError {
    #[error("extraction service unreachable: {0}")]
    Unreachable(String),

    #[error("extraction service throttled the request: {0}")]
    Throttled(String),

    #[error("extraction service error (status {status}): {body}")]
    Service { status: u16, body: String },

    #[error("extraction rejected the document: {0}")]
    DocumentRejected(String),

    #[error("unsupported blueprint: {0}")]
    UnsupportedBlueprint(String),

    #[error("extraction job not found: {0}")]
    JobNotFound(String),

    #[error("malformed extraction output: {0}")]
    MalformedOutput(String),
}

impl ExtractionClientError {
    /// Whether the coordinator should retry the call. Rejections and
    /// malformed output repeat identically, so only infrastructure
    /// failures qualify.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExtractionClientError::Unreachable(_)
                | ExtractionClientError::Throttled(_)
                | ExtractionClientError::Service { .. }
        )
    }
}

/// Extraction service abstraction (allows mocking for tests).
pub trait ExtractionClient: Send + Sync {
    /// Hand the document blob location to the service; returns the job
    /// handle whose completion will be signalled later.
    fn submit(&self, document: &Document) -> Result<JobHandle, ExtractionClientError>;

    /// Fetch the finished tree for a completed job.
    fn fetch_result(&self, handle: &JobHandle) -> Result<ExtractionOutput, ExtractionClientError>;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// HTTP client for the extraction service.
pub struct HttpExtractionClient {
    base_url: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl HttpExtractionClient {
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

    fn send_error(&self, e: reqwest::Error) -> ExtractionClientError {
        if e.is_connect() {
            ExtractionClientError::Unreachable(self.base_url.clone())
        } else if e.is_timeout() {
            ExtractionClientError::Unreachable(format!(
                "request timed out after {}s",
                self.timeout_secs
            ))
        } else {
            ExtractionClientError::Unreachable(e.to_string())
        }
    }
}

/// Request body for job submission.
#[derive(Serialize)]
struct SubmitRequest<'a> {
    document_id: &'a str,
    blueprint_id: &'a str,
    source_uri: &'a str,
}

/// Response body from job submission.
#[derive(Deserialize)]
struct SubmitResponse {
    job_id: String,
}

impl ExtractionClient for HttpExtractionClient {
    fn submit(&self, document: &Document) -> Result<JobHandle, ExtractionClientError> {
        let url = format!("{}/jobs", self.base_url);
        let body = SubmitRequest {
            document_id: &document.document_id,
            blueprint_id: &document.blueprint_id,
            source_uri: &document.source_uri,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| self.send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(match status.as_u16() {
                429 => ExtractionClientError::Throttled(text),
                422 => ExtractionClientError::UnsupportedBlueprint(text),
                400..=499 => ExtractionClientError::DocumentRejected(text),
                code => ExtractionClientError::Service { status: code, body: text },
            });
        }

        let parsed: SubmitResponse = response
            .json()
            .map_err(|e| ExtractionClientError::MalformedOutput(e.to_string()))?;

        Ok(JobHandle(parsed.job_id))
    }

    fn fetch_result(&self, handle: &JobHandle) -> Result<ExtractionOutput, ExtractionClientError> {
        let url = format!("{}/jobs/{}/result", self.base_url, handle.0);

        let response = self.client.get(&url).send().map_err(|e| self.send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(match status.as_u16() {
                404 => ExtractionClientError::JobNotFound(handle.0.clone()),
                429 => ExtractionClientError::Throttled(text),
                code => ExtractionClientError::Service { status: code, body: text },
            });
        }

        response
            .json()
            .map_err(|e| ExtractionClientError::MalformedOutput(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Mock client
// ---------------------------------------------------------------------------

use std::sync::atomic::{AtomicUsize, Ordering};

/// Mock extraction client for testing. Returns a configured tree, with an
/// optional failure script for retry tests.
pub struct MockExtractionClient {
    output: ExtractionOutput,
    submit_failures: AtomicUsize,
    fetch_failures: AtomicUsize,
    permanent_rejection: Option<String>,
    submit_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl MockExtractionClient {
    pub fn new(tree: FieldNode) -> Self {
        Self {
            output: ExtractionOutput {
                tree,
                page_refs: vec![],
            },
            submit_failures: AtomicUsize::new(0),
            fetch_failures: AtomicUsize::new(0),
            permanent_rejection: None,
            submit_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_page_refs(mut self, refs: Vec<String>) -> Self {
        self.output.page_refs = refs;
        self
    }

    /// Fail the first `n` submit calls with a transient error.
    pub fn failing_submits(self, n: usize) -> Self {
        self.submit_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Fail the first `n` fetch calls with a transient error.
    pub fn failing_fetches(self, n: usize) -> Self {
        self.fetch_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Reject every submit permanently.
    pub fn rejecting(mut self, reason: &str) -> Self {
        self.permanent_rejection = Some(reason.to_string());
        self
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

impl ExtractionClient for MockExtractionClient {
    fn submit(&self, document: &Document) -> Result<JobHandle, ExtractionClientError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.permanent_rejection {
            return Err(ExtractionClientError::DocumentRejected(reason.clone()));
        }
        if decrement(&self.submit_failures) {
            return Err(ExtractionClientError::Throttled("mock throttle".into()));
        }
        Ok(JobHandle(format!("job-{}", document.execution_id)))
    }

    fn fetch_result(&self, _handle: &JobHandle) -> Result<ExtractionOutput, ExtractionClientError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if decrement(&self.fetch_failures) {
            return Err(ExtractionClientError::Unreachable("mock outage".into()));
        }
        Ok(self.output.clone())
    }
}

/// Decrement a failure budget; true while failures remain.
fn decrement(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_document() -> Document {
        Document {
            document_id: "acord/claim.pdf".into(),
            execution_id: Uuid::new_v4(),
            blueprint_id: "acord".into(),
            source_uri: "inbox/acord/claim.pdf".into(),
        }
    }

    #[test]
    fn transient_classification() {
        assert!(ExtractionClientError::Unreachable("x".into()).is_transient());
        assert!(ExtractionClientError::Throttled("x".into()).is_transient());
        assert!(ExtractionClientError::Service { status: 503, body: String::new() }.is_transient());
        assert!(!ExtractionClientError::DocumentRejected("x".into()).is_transient());
        assert!(!ExtractionClientError::UnsupportedBlueprint("x".into()).is_transient());
        assert!(!ExtractionClientError::MalformedOutput("x".into()).is_transient());
        assert!(!ExtractionClientError::JobNotFound("x".into()).is_transient());
    }

    #[test]
    fn http_client_trims_trailing_slash() {
        let client = HttpExtractionClient::new("http://localhost:8091/", 30);
        assert_eq!(client.base_url, "http://localhost:8091");
    }

    #[test]
    fn mock_fails_then_succeeds() {
        let client =
            MockExtractionClient::new(FieldNode::scalar("x", Some(0.9))).failing_submits(2);
        let document = sample_document();

        assert!(client.submit(&document).is_err());
        assert!(client.submit(&document).is_err());
        assert!(client.submit(&document).is_ok());
        assert_eq!(client.submit_calls(), 3);
    }

    #[test]
    fn mock_rejection_is_permanent() {
        let client =
            MockExtractionClient::new(FieldNode::scalar("x", Some(0.9))).rejecting("bad scan");
        let err = client.submit(&sample_document()).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn extraction_output_serde_defaults_page_refs() {
        let json = r#"{"tree":{"kind":"scalar","value":"x"}}"#;
        let output: ExtractionOutput = serde_json::from_str(json).unwrap();
        assert!(output.page_refs.is_empty());
    }
}
