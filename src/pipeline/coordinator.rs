//! Pipeline coordination state machine.
//!
//! One executions row per pipeline instance; the persisted stage is the
//! single source of truth for what happens next. Every transition is
//! written before the external call it precedes, so a crash resumes from
//! the last recorded state instead of re-running earlier stages (repeat
//! extraction calls are costly and not idempotent upstream).
//!
//! Completion signals are delivered at least once. A signal for a stage
//! the instance has already left is acknowledged and discarded, which is
//! what keeps duplicate deliveries from creating a second review task or
//! a second result.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use crate::config::Settings;
use crate::db::{self, DatabaseError, ExecutionRecord};
use crate::models::{Correction, Document, FieldNode, FieldPath, Stage, TaskStatus};
use crate::store::{self, layout, ObjectStore, StoreError};

use super::aggregator::{self, AggregationError};
use super::evaluator;
use super::extraction::{ExtractionClient, ExtractionClientError, JobHandle};
use super::review::{ReviewError, ReviewOrchestrator, ReviewService};

/// External signals that drive pipeline instances forward.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A new document appeared in the inbox.
    DocumentArrived {
        blueprint_id: String,
        name: String,
        source_uri: String,
    },
    /// The extraction service finished the job for this execution.
    ExtractionCompleted { execution_id: Uuid },
    /// A human finished reviewing; corrections are the reviewer's answers.
    ReviewCompleted {
        execution_id: Uuid,
        review_loop_id: String,
        corrections: Vec<Correction>,
    },
}

/// Infrastructure errors surfaced to the service loop. Stage failures
/// (exhausted retries, rejected documents, integrity violations) are not
/// errors here: they are absorbed into the instance's Failed state.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("aggregation error: {0}")]
    Aggregation(#[from] AggregationError),
}

/// Drives the extract → evaluate → review → aggregate sequence for every
/// document, one instance per (document, execution).
pub struct PipelineCoordinator {
    conn: Connection,
    store: Box<dyn ObjectStore>,
    extraction: Box<dyn ExtractionClient>,
    review: ReviewOrchestrator,
    settings: Settings,
}

impl PipelineCoordinator {
    pub fn new(
        conn: Connection,
        store: Box<dyn ObjectStore>,
        extraction: Box<dyn ExtractionClient>,
        review_service: Box<dyn ReviewService>,
        settings: Settings,
    ) -> Self {
        Self {
            conn,
            store,
            extraction,
            review: ReviewOrchestrator::new(review_service),
            settings,
        }
    }

    /// State inspection entry point (failures are observable per
    /// document/execution through the executions table).
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Dispatch one event. Safe to call twice with the same event.
    pub fn handle_event(&self, event: PipelineEvent) -> Result<(), CoordinatorError> {
        match event {
            PipelineEvent::DocumentArrived {
                blueprint_id,
                name,
                source_uri,
            } => self.on_document_arrived(blueprint_id, name, source_uri),
            PipelineEvent::ExtractionCompleted { execution_id } => {
                self.on_extraction_completed(execution_id)
            }
            PipelineEvent::ReviewCompleted {
                execution_id,
                review_loop_id,
                corrections,
            } => self.on_review_completed(execution_id, &review_loop_id, corrections),
        }
    }

    // -- Stage handlers ----------------------------------------------------

    fn on_document_arrived(
        &self,
        blueprint_id: String,
        name: String,
        source_uri: String,
    ) -> Result<(), CoordinatorError> {
        let document_id = format!("{blueprint_id}/{name}");

        // Arrival notifications replay on restart; a document that already
        // has an execution is not a new arrival. Re-processing uses a new
        // source name, which derives a new identity.
        if !db::list_for_document(&self.conn, &document_id)?.is_empty() {
            tracing::debug!(%document_id, "Duplicate arrival notification, discarding");
            return Ok(());
        }

        let document = Document {
            document_id,
            execution_id: Uuid::new_v4(),
            blueprint_id,
            source_uri,
        };
        let now = Utc::now();
        let deadline = now + chrono::Duration::seconds(self.settings.pipeline_timeout.as_secs() as i64);
        db::insert_execution(&self.conn, &ExecutionRecord::new(&document, now, deadline))?;

        tracing::info!(
            document_id = %document.document_id,
            execution_id = %document.execution_id,
            blueprint_id = %document.blueprint_id,
            "Pipeline instance started"
        );

        db::set_stage(&self.conn, document.execution_id, Stage::Extracting)?;
        let handle = match self.with_retries(
            "extraction submit",
            || self.extraction.submit(&document),
            ExtractionClientError::is_transient,
        ) {
            Ok(handle) => handle,
            Err(e) => return self.fail(document.execution_id, &format!("extraction submit: {e}")),
        };
        db::set_job_handle(&self.conn, document.execution_id, &handle.0)?;

        // Suspended: the extraction completion signal advances this run.
        Ok(())
    }

    fn on_extraction_completed(&self, execution_id: Uuid) -> Result<(), CoordinatorError> {
        let Some(record) = db::get_execution(&self.conn, execution_id)? else {
            tracing::warn!(%execution_id, "Extraction completion for unknown execution, discarding");
            return Ok(());
        };

        let resuming = record.stage == Stage::Reviewing
            && db::find_open_task(&self.conn, execution_id)?.is_none();
        if record.stage != Stage::Extracting && !resuming {
            tracing::debug!(
                %execution_id,
                stage = record.stage.as_str(),
                "Duplicate extraction completion, discarding"
            );
            return Ok(());
        }

        let (tree, page_refs) = if resuming {
            // Crash window between recording the Reviewing stage and
            // creating the task; the tree is already persisted.
            let tree = store::get_json(self.store.as_ref(), &layout::extraction_tree_key(execution_id))?;
            let page_refs = store::get_json(self.store.as_ref(), &layout::extraction_pages_key(execution_id))
                .unwrap_or_default();
            (tree, page_refs)
        } else {
            let Some(handle) = record.job_handle.clone() else {
                return self.fail(execution_id, "extraction completed without a recorded job handle");
            };
            let output = match self.with_retries(
                "extraction fetch",
                || self.extraction.fetch_result(&JobHandle(handle.clone())),
                ExtractionClientError::is_transient,
            ) {
                Ok(output) => output,
                Err(e) => return self.fail(execution_id, &format!("extraction fetch: {e}")),
            };
            // Convergent writes: retries and duplicates land on the same
            // key with the same content.
            store::put_json(
                self.store.as_ref(),
                &layout::extraction_tree_key(execution_id),
                &output.tree,
            )?;
            store::put_json(
                self.store.as_ref(),
                &layout::extraction_pages_key(execution_id),
                &output.page_refs,
            )?;
            db::set_stage(&self.conn, execution_id, Stage::Evaluating)?;
            (output.tree, output.page_refs)
        };

        let partition = evaluator::evaluate(&tree, self.settings.confidence_threshold);
        tracing::info!(
            %execution_id,
            accepted = partition.accepted.len(),
            flagged = partition.flagged.len(),
            "Extraction tree evaluated"
        );

        if partition.is_straight_through() {
            // Nothing uncertain: no human step, finalize directly.
            db::set_stage(&self.conn, execution_id, Stage::Finalizing)?;
            self.aggregate_and_complete(execution_id, &tree, &[], &BTreeSet::new())?;
            return Ok(());
        }

        if !resuming {
            db::set_stage(&self.conn, execution_id, Stage::Reviewing)?;
        }
        let document = record.document();
        if let Err(e) = self.with_retries(
            "review submit",
            || {
                self.review
                    .submit_for_review(&self.conn, &document, &partition.flagged, &page_refs)
            },
            ReviewError::is_transient,
        ) {
            return self.fail(execution_id, &format!("review submit: {e}"));
        }

        // Suspended: the review completion signal advances this run.
        Ok(())
    }

    fn on_review_completed(
        &self,
        execution_id: Uuid,
        review_loop_id: &str,
        corrections: Vec<Correction>,
    ) -> Result<(), CoordinatorError> {
        let Some(record) = db::get_execution(&self.conn, execution_id)? else {
            tracing::warn!(%execution_id, "Review completion for unknown execution, discarding");
            return Ok(());
        };
        if record.stage != Stage::Reviewing {
            tracing::debug!(
                %execution_id,
                stage = record.stage.as_str(),
                "Duplicate review completion, discarding"
            );
            return Ok(());
        }

        // Keep the raw reviewer output for audit; if the review service
        // already wrote it, first writer wins and this is a no-op.
        store::put_json_if_absent(
            self.store.as_ref(),
            &layout::corrections_key(execution_id, review_loop_id),
            &corrections,
        )?;

        let Some(task) = db::find_open_task(&self.conn, execution_id)? else {
            return self.fail(execution_id, "review completed without a recorded task");
        };

        db::set_stage(&self.conn, execution_id, Stage::Aggregating)?;
        let tree: FieldNode =
            store::get_json(self.store.as_ref(), &layout::extraction_tree_key(execution_id))?;

        if self.aggregate_and_complete(execution_id, &tree, &corrections, &task.flagged_paths)? {
            db::set_task_status(&self.conn, &task.task_id, TaskStatus::Completed)?;
        }
        Ok(())
    }

    // -- Shared steps ------------------------------------------------------

    /// Reconcile, persist (first writer wins), and finish the instance.
    /// Returns false when the merge was rejected and the instance failed.
    fn aggregate_and_complete(
        &self,
        execution_id: Uuid,
        tree: &FieldNode,
        corrections: &[Correction],
        flagged_paths: &BTreeSet<FieldPath>,
    ) -> Result<bool, CoordinatorError> {
        match aggregator::reconcile(tree, corrections, flagged_paths) {
            Ok(result) => {
                aggregator::persist_result(self.store.as_ref(), execution_id, &result)?;
                db::set_stage(&self.conn, execution_id, Stage::Completed)?;
                tracing::info!(
                    %execution_id,
                    corrections = corrections.len(),
                    "Pipeline instance completed"
                );
                Ok(true)
            }
            Err(
                e @ (AggregationError::UnknownCorrectionPath(_)
                | AggregationError::CorrectionNotFlagged(_)),
            ) => {
                // Integrity violation between review output and the
                // original request; retrying replays the same bad input.
                self.fail(execution_id, &e.to_string())?;
                Ok(false)
            }
            Err(AggregationError::Store(e)) => Err(e.into()),
        }
    }

    /// Force Failed on instances past their wall-clock deadline. Bounds
    /// resource holding when an external dependency never answers.
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize, CoordinatorError> {
        let overdue = db::list_overdue(&self.conn, now)?;
        for record in &overdue {
            tracing::warn!(
                execution_id = %record.execution_id,
                document_id = %record.document_id,
                stage = record.stage.as_str(),
                "Pipeline instance exceeded its deadline, failing"
            );
            self.fail(record.execution_id, "pipeline deadline exceeded")?;
        }
        Ok(overdue.len())
    }

    /// Terminal failure: recorded, never silent. The document must be
    /// resubmitted under a new execution to retry end to end.
    fn fail(&self, execution_id: Uuid, reason: &str) -> Result<(), CoordinatorError> {
        tracing::error!(%execution_id, reason, "Pipeline instance failed");
        db::expire_open_task(&self.conn, execution_id)?;
        db::mark_failed(&self.conn, execution_id, reason)?;
        Ok(())
    }

    /// Bounded exponential backoff around one external call. Only errors
    /// the classifier marks transient are retried.
    fn with_retries<T, E: std::fmt::Display>(
        &self,
        op: &str,
        mut call: impl FnMut() -> Result<T, E>,
        is_transient: impl Fn(&E) -> bool,
    ) -> Result<T, E> {
        let mut attempt = 1;
        let mut delay = self.settings.retry_base;
        loop {
            match call() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.settings.max_attempts && is_transient(&e) => {
                    tracing::warn!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                    delay *= self.settings.retry_multiplier;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
