//! Execution and review-task state repository.
//!
//! One `executions` row per pipeline instance, one `review_tasks` row per
//! human loop. All functions operate on the state database via rusqlite.
//! Stage transitions are plain UPDATEs; callers persist a transition
//! before issuing the external call it precedes.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::DatabaseError;
use crate::models::{Document, FieldPath, ReviewTask, Stage, TaskStatus};

/// One pipeline instance as persisted.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub document_id: String,
    pub blueprint_id: String,
    pub source_uri: String,
    pub stage: Stage,
    pub job_handle: Option<String>,
    pub failure_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// A fresh record in the initial stage, with its deadline already set.
    pub fn new(document: &Document, now: DateTime<Utc>, deadline_at: DateTime<Utc>) -> Self {
        Self {
            execution_id: document.execution_id,
            document_id: document.document_id.clone(),
            blueprint_id: document.blueprint_id.clone(),
            source_uri: document.source_uri.clone(),
            stage: Stage::Submitted,
            job_handle: None,
            failure_reason: None,
            started_at: now,
            updated_at: now,
            deadline_at,
        }
    }

    /// Rebuild the document identity this record was created from.
    pub fn document(&self) -> Document {
        Document {
            document_id: self.document_id.clone(),
            execution_id: self.execution_id,
            blueprint_id: self.blueprint_id.clone(),
            source_uri: self.source_uri.clone(),
        }
    }
}

// -- Raw row shapes (converted outside the rusqlite closures) --------------

struct ExecutionRow {
    execution_id: String,
    document_id: String,
    blueprint_id: String,
    source_uri: String,
    stage: String,
    job_handle: Option<String>,
    failure_reason: Option<String>,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deadline_at: DateTime<Utc>,
}

struct TaskRow {
    task_id: String,
    execution_id: String,
    document_id: String,
    status: String,
    flagged_paths: String,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

const EXECUTION_COLUMNS: &str = "execution_id, document_id, blueprint_id, source_uri, stage, \
     job_handle, failure_reason, started_at, updated_at, deadline_at";

const TASK_COLUMNS: &str =
    "task_id, execution_id, document_id, status, flagged_paths, created_at, completed_at";

fn read_execution_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRow> {
    Ok(ExecutionRow {
        execution_id: row.get(0)?,
        document_id: row.get(1)?,
        blueprint_id: row.get(2)?,
        source_uri: row.get(3)?,
        stage: row.get(4)?,
        job_handle: row.get(5)?,
        failure_reason: row.get(6)?,
        started_at: row.get(7)?,
        updated_at: row.get(8)?,
        deadline_at: row.get(9)?,
    })
}

fn read_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        task_id: row.get(0)?,
        execution_id: row.get(1)?,
        document_id: row.get(2)?,
        status: row.get(3)?,
        flagged_paths: row.get(4)?,
        created_at: row.get(5)?,
        completed_at: row.get(6)?,
    })
}

fn parse_uuid(field: &str, value: &str) -> Result<Uuid, DatabaseError> {
    value.parse().map_err(|_| DatabaseError::InvalidEnum {
        field: field.to_string(),
        value: value.to_string(),
    })
}

impl TryFrom<ExecutionRow> for ExecutionRecord {
    type Error = DatabaseError;

    fn try_from(row: ExecutionRow) -> Result<Self, DatabaseError> {
        let stage = Stage::parse(&row.stage).ok_or_else(|| DatabaseError::InvalidEnum {
            field: "stage".into(),
            value: row.stage.clone(),
        })?;
        Ok(ExecutionRecord {
            execution_id: parse_uuid("execution_id", &row.execution_id)?,
            document_id: row.document_id,
            blueprint_id: row.blueprint_id,
            source_uri: row.source_uri,
            stage,
            job_handle: row.job_handle,
            failure_reason: row.failure_reason,
            started_at: row.started_at,
            updated_at: row.updated_at,
            deadline_at: row.deadline_at,
        })
    }
}

impl TryFrom<TaskRow> for ReviewTask {
    type Error = DatabaseError;

    fn try_from(row: TaskRow) -> Result<Self, DatabaseError> {
        let status = TaskStatus::parse(&row.status).ok_or_else(|| DatabaseError::InvalidEnum {
            field: "status".into(),
            value: row.status.clone(),
        })?;
        let flagged_paths: Vec<FieldPath> = serde_json::from_str(&row.flagged_paths)
            .map_err(|e| DatabaseError::JsonColumn(e.to_string()))?;
        Ok(ReviewTask {
            task_id: row.task_id,
            execution_id: parse_uuid("execution_id", &row.execution_id)?,
            document_id: row.document_id,
            status,
            flagged_paths: flagged_paths.into_iter().collect(),
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

// -- Executions ------------------------------------------------------------

pub fn insert_execution(conn: &Connection, record: &ExecutionRecord) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO executions (execution_id, document_id, blueprint_id, source_uri, stage,
                                 job_handle, failure_reason, started_at, updated_at, deadline_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            record.execution_id.to_string(),
            record.document_id,
            record.blueprint_id,
            record.source_uri,
            record.stage.as_str(),
            record.job_handle,
            record.failure_reason,
            record.started_at,
            record.updated_at,
            record.deadline_at,
        ],
    )?;
    Ok(())
}

pub fn get_execution(
    conn: &Connection,
    execution_id: Uuid,
) -> Result<Option<ExecutionRecord>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE execution_id = ?1"),
            params![execution_id.to_string()],
            read_execution_row,
        )
        .optional()?;
    row.map(ExecutionRecord::try_from).transpose()
}

pub fn set_stage(
    conn: &Connection,
    execution_id: Uuid,
    stage: Stage,
) -> Result<(), DatabaseError> {
    let updated = conn.execute(
        "UPDATE executions SET stage = ?2, updated_at = ?3 WHERE execution_id = ?1",
        params![execution_id.to_string(), stage.as_str(), Utc::now()],
    )?;
    if updated == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "execution".into(),
            id: execution_id.to_string(),
        });
    }
    Ok(())
}

pub fn set_job_handle(
    conn: &Connection,
    execution_id: Uuid,
    job_handle: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE executions SET job_handle = ?2, updated_at = ?3 WHERE execution_id = ?1",
        params![execution_id.to_string(), job_handle, Utc::now()],
    )?;
    Ok(())
}

pub fn mark_failed(
    conn: &Connection,
    execution_id: Uuid,
    reason: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE executions SET stage = ?2, failure_reason = ?3, updated_at = ?4
         WHERE execution_id = ?1",
        params![
            execution_id.to_string(),
            Stage::Failed.as_str(),
            reason,
            Utc::now()
        ],
    )?;
    Ok(())
}

/// Non-terminal executions whose deadline has passed.
pub fn list_overdue(
    conn: &Connection,
    now: DateTime<Utc>,
) -> Result<Vec<ExecutionRecord>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM executions
         WHERE stage NOT IN ('completed', 'failed') AND deadline_at < ?1
         ORDER BY deadline_at ASC"
    ))?;
    let rows = stmt.query_map(params![now], read_execution_row)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(ExecutionRecord::try_from(row?)?);
    }
    Ok(records)
}

/// All executions for a document, newest first. Failures are inspected
/// per (document, execution), so this is the observability entry point.
pub fn list_for_document(
    conn: &Connection,
    document_id: &str,
) -> Result<Vec<ExecutionRecord>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM executions
         WHERE document_id = ?1 ORDER BY started_at DESC"
    ))?;
    let rows = stmt.query_map(params![document_id], read_execution_row)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(ExecutionRecord::try_from(row?)?);
    }
    Ok(records)
}

// -- Review tasks ----------------------------------------------------------

pub fn insert_review_task(conn: &Connection, task: &ReviewTask) -> Result<(), DatabaseError> {
    let paths: Vec<String> = task.flagged_paths.iter().map(|p| p.to_string()).collect();
    let flagged_json =
        serde_json::to_string(&paths).map_err(|e| DatabaseError::JsonColumn(e.to_string()))?;
    conn.execute(
        "INSERT INTO review_tasks (task_id, execution_id, document_id, status, flagged_paths,
                                   created_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            task.task_id,
            task.execution_id.to_string(),
            task.document_id,
            task.status.as_str(),
            flagged_json,
            task.created_at,
            task.completed_at,
        ],
    )?;
    Ok(())
}

/// The Pending task for an execution, if any. At most one exists; the
/// orchestrator checks here before creating another.
pub fn find_open_task(
    conn: &Connection,
    execution_id: Uuid,
) -> Result<Option<ReviewTask>, DatabaseError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {TASK_COLUMNS} FROM review_tasks
                 WHERE execution_id = ?1 AND status = 'pending'"
            ),
            params![execution_id.to_string()],
            read_task_row,
        )
        .optional()?;
    row.map(ReviewTask::try_from).transpose()
}

pub fn set_task_status(
    conn: &Connection,
    task_id: &str,
    status: TaskStatus,
) -> Result<(), DatabaseError> {
    let completed_at = match status {
        TaskStatus::Pending => None,
        TaskStatus::Completed | TaskStatus::Expired => Some(Utc::now()),
    };
    conn.execute(
        "UPDATE review_tasks SET status = ?2, completed_at = ?3 WHERE task_id = ?1",
        params![task_id, status.as_str(), completed_at],
    )?;
    Ok(())
}

/// Expire the Pending task of an execution, if one exists.
pub fn expire_open_task(conn: &Connection, execution_id: Uuid) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE review_tasks SET status = 'expired', completed_at = ?2
         WHERE execution_id = ?1 AND status = 'pending'",
        params![execution_id.to_string(), Utc::now()],
    )?;
    Ok(())
}
