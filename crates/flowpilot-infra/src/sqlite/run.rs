//! SQLite run store.
//!
//! Implements `RunRepository` and `DefinitionResolver` from `flowpilot-core`.
//! Runs and workflow records are stored as JSON documents; a few run fields
//! are duplicated into columns for listing.

use chrono::{DateTime, Utc};
use flowpilot_core::repository::run::{DefinitionResolver, RunRepository};
use flowpilot_core::workflow::definition::{DefinitionError, select_definition};
use flowpilot_types::error::RepositoryError;
use flowpilot_types::run::Run;
use flowpilot_types::workflow::{WorkflowDefinition, WorkflowRecord};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed run and workflow store.
#[derive(Clone)]
pub struct SqliteRunStore {
    pool: DatabasePool,
}

impl SqliteRunStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a workflow record.
    pub async fn save_workflow(&self, record: &WorkflowRecord) -> Result<(), RepositoryError> {
        let record_json = serde_json::to_string(record)
            .map_err(|e| RepositoryError::Query(format!("serialize workflow: {e}")))?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflows (id, name, record, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 record = excluded.record,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowRecord>, RepositoryError> {
        let row = sqlx::query("SELECT record FROM workflows WHERE id = ?")
            .bind(workflow_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|row| {
            let record: String = row
                .try_get("record")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            serde_json::from_str(&record)
                .map_err(|e| RepositoryError::Query(format!("invalid workflow JSON: {e}")))
        })
        .transpose()
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<Run>, RepositoryError> {
        let rows = sqlx::query("SELECT document FROM runs ORDER BY created_at DESC LIMIT ?")
            .bind(i64::from(limit))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(run_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn run_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Run, RepositoryError> {
    let document: String = row
        .try_get("document")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    serde_json::from_str(&document)
        .map_err(|e| RepositoryError::Query(format!("invalid run JSON: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

// ---------------------------------------------------------------------------
// Port impls
// ---------------------------------------------------------------------------

impl RunRepository for SqliteRunStore {
    async fn create_or_update_run(&self, run: &Run) -> Result<(), RepositoryError> {
        let document = serde_json::to_string(run)
            .map_err(|e| RepositoryError::Query(format!("serialize run: {e}")))?;

        sqlx::query(
            r#"INSERT INTO runs
               (id, workflow_id, status, test_mode, resume_from_run_id, document, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 document = excluded.document,
                 updated_at = excluded.updated_at"#,
        )
        .bind(run.id.to_string())
        .bind(&run.workflow_id)
        .bind(run.status.as_str())
        .bind(run.test_mode)
        .bind(run.resume_from_run_id.map(|id| id.to_string()))
        .bind(&document)
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<Run>, RepositoryError> {
        let row = sqlx::query("SELECT id, document FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let id: String = row
                    .try_get("id")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                let run = run_from_row(&row)?;
                if parse_uuid(&id)? != run.id {
                    return Err(RepositoryError::Conflict(format!(
                        "run row {id} holds document for {}",
                        run.id
                    )));
                }
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }
}

impl DefinitionResolver for SqliteRunStore {
    async fn resolve(&self, run: &Run) -> Result<WorkflowDefinition, DefinitionError> {
        let record = self
            .get_workflow(&run.workflow_id)
            .await?
            .ok_or_else(|| DefinitionError::WorkflowNotFound(run.workflow_id.clone()))?;
        select_definition(&record, run)
    }
}
