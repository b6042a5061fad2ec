//! libSQL implementation of the async `Database` trait.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! fixed-width RFC 3339 (microseconds, `Z`) so string comparison orders them.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use uuid::Uuid;

use crate::classify::types::{ClassificationResult, ParseResult, ParseStatus};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::Database;
use crate::submission::model::{Submission, SubmissionAttempt, SubmissionStatus};
use crate::tenant::TenantCapabilities;
use crate::workflow::execution::WorkflowExecution;
use crate::workflow::model::{WorkflowDefinition, WorkflowStep, WorkflowTemplate};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn fmt_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid '{s}': {e}")))
}

fn parse_optional_uuid(s: Option<String>) -> Result<Option<Uuid>, DatabaseError> {
    s.as_deref().map(parse_uuid).transpose()
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: DeserializeOwned>(s: &str, column: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s)
        .map_err(|e| DatabaseError::Serialization(format!("column {column}: {e}")))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T, DatabaseError> {
    s.parse().map_err(DatabaseError::Serialization)
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_int(n: Option<i64>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n),
        None => libsql::Value::Null,
    }
}

fn query_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

/// Read every remaining row through `map`.
async fn collect_rows<T>(
    mut rows: libsql::Rows,
    op: &str,
    map: impl Fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut out = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err(op))? {
        out.push(map(&row)?);
    }
    Ok(out)
}

/// Read the first row through `map`, if any.
async fn first_row<T>(
    mut rows: libsql::Rows,
    op: &str,
    map: impl Fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Option<T>, DatabaseError> {
    match rows.next().await.map_err(query_err(op))? {
        Some(row) => Ok(Some(map(&row)?)),
        None => Ok(None),
    }
}

fn get_text(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

fn get_int(row: &libsql::Row, idx: i32) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

fn status_list<S>(statuses: &[S], as_str: impl Fn(&S) -> &'static str) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", as_str(s)))
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Row mappers ─────────────────────────────────────────────────────

const PARSE_COLUMNS: &str = "attachment_id, status, document_type, classification_confidence, extracted_fields, field_confidence, low_confidence_fields, error, model, file_sha256, ingestion_key, created_at, updated_at";

fn row_to_parse_result(row: &libsql::Row) -> Result<ParseResult, DatabaseError> {
    let document_type: Option<String> = row.get(2).ok();
    Ok(ParseResult {
        attachment_id: parse_uuid(&get_text(row, 0)?)?,
        status: parse_enum::<ParseStatus>(&get_text(row, 1)?)?,
        document_type: document_type.as_deref().map(parse_enum).transpose()?,
        classification_confidence: row.get::<f64>(3).ok(),
        extracted_fields: from_json(&get_text(row, 4)?, "extracted_fields")?,
        field_confidence: from_json(&get_text(row, 5)?, "field_confidence")?,
        low_confidence_fields: from_json(&get_text(row, 6)?, "low_confidence_fields")?,
        error: row.get(7).ok(),
        model: row.get(8).ok(),
        file_sha256: row.get(9).ok(),
        ingestion_key: row.get(10).ok(),
        created_at: parse_datetime(&get_text(row, 11)?),
        updated_at: parse_datetime(&get_text(row, 12)?),
    })
}

const WORKFLOW_COLUMNS: &str =
    "id, tenant_id, name, trigger_type, trigger_filters, is_active, created_at";

fn row_to_workflow(row: &libsql::Row) -> Result<WorkflowDefinition, DatabaseError> {
    Ok(WorkflowDefinition {
        id: parse_uuid(&get_text(row, 0)?)?,
        tenant_id: get_text(row, 1)?,
        name: get_text(row, 2)?,
        trigger_type: get_text(row, 3)?,
        trigger_filters: from_json(&get_text(row, 4)?, "trigger_filters")?,
        is_active: get_int(row, 5)? != 0,
        created_at: parse_datetime(&get_text(row, 6)?),
    })
}

const STEP_COLUMNS: &str =
    "id, workflow_id, step_order, kind, config, next_on_success, next_on_failure, is_enabled";

fn row_to_step(row: &libsql::Row) -> Result<WorkflowStep, DatabaseError> {
    Ok(WorkflowStep {
        id: parse_uuid(&get_text(row, 0)?)?,
        workflow_id: parse_uuid(&get_text(row, 1)?)?,
        order: get_int(row, 2)?,
        kind: parse_enum(&get_text(row, 3)?)?,
        config: from_json(&get_text(row, 4)?, "config")?,
        next_on_success: parse_optional_uuid(row.get(5).ok())?,
        next_on_failure: parse_optional_uuid(row.get(6).ok())?,
        is_enabled: get_int(row, 7)? != 0,
    })
}

const EXECUTION_COLUMNS: &str = "id, workflow_id, attachment_id, ingestion_key, status, visited_steps, context, error, started_at, finished_at";

fn row_to_execution(row: &libsql::Row) -> Result<WorkflowExecution, DatabaseError> {
    let finished_at: Option<String> = row.get(9).ok();
    Ok(WorkflowExecution {
        id: parse_uuid(&get_text(row, 0)?)?,
        workflow_id: parse_uuid(&get_text(row, 1)?)?,
        attachment_id: parse_uuid(&get_text(row, 2)?)?,
        ingestion_key: get_text(row, 3)?,
        status: parse_enum(&get_text(row, 4)?)?,
        visited_steps: from_json(&get_text(row, 5)?, "visited_steps")?,
        context: from_json(&get_text(row, 6)?, "context")?,
        error: row.get(7).ok(),
        started_at: parse_datetime(&get_text(row, 8)?),
        finished_at: parse_optional_datetime(&finished_at),
    })
}

const SUBMISSION_COLUMNS: &str = "id, ingestion_key, attachment_id, workflow_id, step_id, document_type, target, extracted_fields, submission_status, http_status, retry_count, max_retries, next_retry_at, retry_delay_seconds, manual_payload_override, partner_response, error_message, created_at, updated_at";

fn row_to_submission(row: &libsql::Row) -> Result<Submission, DatabaseError> {
    let next_retry_at: Option<String> = row.get(12).ok();
    let override_json: Option<String> = row.get(14).ok();
    Ok(Submission {
        id: parse_uuid(&get_text(row, 0)?)?,
        ingestion_key: get_text(row, 1)?,
        attachment_id: parse_uuid(&get_text(row, 2)?)?,
        workflow_id: parse_optional_uuid(row.get(3).ok())?,
        step_id: parse_optional_uuid(row.get(4).ok())?,
        document_type: parse_enum(&get_text(row, 5)?)?,
        target: from_json(&get_text(row, 6)?, "target")?,
        extracted_fields: from_json(&get_text(row, 7)?, "extracted_fields")?,
        submission_status: parse_enum(&get_text(row, 8)?)?,
        http_status: row.get::<i64>(9).ok().map(|s| s as u16),
        retry_count: get_int(row, 10)? as u32,
        max_retries: get_int(row, 11)? as u32,
        next_retry_at: parse_optional_datetime(&next_retry_at),
        retry_delay_seconds: row.get::<i64>(13).ok().map(|s| s as u64),
        manual_payload_override: override_json
            .as_deref()
            .map(|s| from_json(s, "manual_payload_override"))
            .transpose()?,
        partner_response: row.get(15).ok(),
        error_message: row.get(16).ok(),
        created_at: parse_datetime(&get_text(row, 17)?),
        updated_at: parse_datetime(&get_text(row, 18)?),
    })
}

/// Rows that still block a new submission for the same dedup key.
/// A failed row with nothing scheduled is terminal and does not.
const LIVE_SUBMISSION: &str = "NOT (submission_status = 'failed' AND next_retry_at IS NULL)";

/// Positional values for [`SUBMISSION_COLUMNS`] followed by `target_url`.
fn submission_params(s: &Submission) -> Result<libsql::params::Params, DatabaseError> {
    Ok(libsql::params::Params::Positional(vec![
        libsql::Value::Text(s.id.to_string()),
        libsql::Value::Text(s.ingestion_key.clone()),
        libsql::Value::Text(s.attachment_id.to_string()),
        opt_text_owned(s.workflow_id.map(|id| id.to_string())),
        opt_text_owned(s.step_id.map(|id| id.to_string())),
        libsql::Value::Text(s.document_type.as_str().to_string()),
        libsql::Value::Text(to_json(&s.target)?),
        libsql::Value::Text(to_json(&s.extracted_fields)?),
        libsql::Value::Text(s.submission_status.as_str().to_string()),
        opt_int(s.http_status.map(i64::from)),
        libsql::Value::Integer(s.retry_count as i64),
        libsql::Value::Integer(s.max_retries as i64),
        opt_text_owned(s.next_retry_at.as_ref().map(fmt_datetime)),
        opt_int(s.retry_delay_seconds.map(|d| d as i64)),
        opt_text_owned(s.manual_payload_override.as_ref().map(to_json).transpose()?),
        opt_text(s.partner_response.as_deref()),
        opt_text(s.error_message.as_deref()),
        libsql::Value::Text(fmt_datetime(&s.created_at)),
        libsql::Value::Text(fmt_datetime(&s.updated_at)),
        libsql::Value::Text(s.target.url.clone()),
    ]))
}

const ATTEMPT_COLUMNS: &str =
    "id, submission_id, attempt_number, started_at, finished_at, http_status, error, used_override";

fn row_to_attempt(row: &libsql::Row) -> Result<SubmissionAttempt, DatabaseError> {
    let finished_at: Option<String> = row.get(4).ok();
    Ok(SubmissionAttempt {
        id: parse_uuid(&get_text(row, 0)?)?,
        submission_id: parse_uuid(&get_text(row, 1)?)?,
        attempt_number: get_int(row, 2)? as u32,
        started_at: parse_datetime(&get_text(row, 3)?),
        finished_at: parse_optional_datetime(&finished_at),
        http_status: row.get::<i64>(5).ok().map(|s| s as u16),
        error: row.get(6).ok(),
        used_override: get_int(row, 7)? != 0,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Parse results ───────────────────────────────────────────────

    async fn get_parse_result(
        &self,
        attachment_id: Uuid,
    ) -> Result<Option<ParseResult>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {PARSE_COLUMNS} FROM parse_results WHERE attachment_id = ?1"),
                params![attachment_id.to_string()],
            )
            .await
            .map_err(query_err("get_parse_result"))?;
        first_row(rows, "get_parse_result", row_to_parse_result).await
    }

    async fn find_completed_parse_by_ingestion(
        &self,
        ingestion_key: &str,
    ) -> Result<Option<ParseResult>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {PARSE_COLUMNS} FROM parse_results
                     WHERE ingestion_key = ?1 AND status = 'completed'
                     ORDER BY updated_at DESC LIMIT 1"
                ),
                params![ingestion_key],
            )
            .await
            .map_err(query_err("find_completed_parse_by_ingestion"))?;
        first_row(rows, "find_completed_parse_by_ingestion", row_to_parse_result).await
    }

    async fn ensure_parse_result(
        &self,
        attachment_id: Uuid,
        file_sha256: Option<&str>,
        ingestion_key: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = fmt_datetime(&Utc::now());
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO parse_results
                (attachment_id, status, file_sha256, ingestion_key, created_at, updated_at)
             VALUES (?1, 'pending', ?2, ?3, ?4, ?4)",
            params![
                attachment_id.to_string(),
                opt_text(file_sha256),
                opt_text(ingestion_key),
                now,
            ],
        )
        .await
        .map_err(query_err("ensure_parse_result"))?;

        conn.execute(
            "UPDATE parse_results
             SET file_sha256 = COALESCE(file_sha256, ?2),
                 ingestion_key = COALESCE(ingestion_key, ?3)
             WHERE attachment_id = ?1",
            params![
                attachment_id.to_string(),
                opt_text(file_sha256),
                opt_text(ingestion_key),
            ],
        )
        .await
        .map_err(query_err("ensure_parse_result"))?;
        Ok(())
    }

    async fn claim_parse_result(
        &self,
        attachment_id: Uuid,
        from: &[ParseStatus],
    ) -> Result<bool, DatabaseError> {
        if from.is_empty() {
            return Ok(false);
        }
        let allowed = status_list(from, |s| s.as_str());
        let count = self
            .conn()
            .execute(
                &format!(
                    "UPDATE parse_results SET status = 'processing', error = NULL, updated_at = ?1
                     WHERE attachment_id = ?2 AND status IN ({allowed})"
                ),
                params![fmt_datetime(&Utc::now()), attachment_id.to_string()],
            )
            .await
            .map_err(query_err("claim_parse_result"))?;

        debug!(%attachment_id, claimed = count == 1, "Parse lock attempt");
        Ok(count == 1)
    }

    async fn complete_parse_result(
        &self,
        attachment_id: Uuid,
        model: &str,
        result: &ClassificationResult,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE parse_results
                 SET status = 'completed', document_type = ?1, classification_confidence = ?2,
                     extracted_fields = ?3, field_confidence = ?4, low_confidence_fields = ?5,
                     error = NULL, model = ?6, updated_at = ?7
                 WHERE attachment_id = ?8 AND status = 'processing'",
                params![
                    result.document_type.as_str(),
                    result.confidence,
                    to_json(&result.fields)?,
                    to_json(&result.field_confidence)?,
                    to_json(&result.low_confidence_fields)?,
                    model,
                    fmt_datetime(&Utc::now()),
                    attachment_id.to_string(),
                ],
            )
            .await
            .map_err(query_err("complete_parse_result"))?;
        Ok(count == 1)
    }

    async fn fail_parse_result(
        &self,
        attachment_id: Uuid,
        error: &str,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE parse_results SET status = 'failed', error = ?1, updated_at = ?2
                 WHERE attachment_id = ?3 AND status IN ('pending', 'processing')",
                params![error, fmt_datetime(&Utc::now()), attachment_id.to_string()],
            )
            .await
            .map_err(query_err("fail_parse_result"))?;
        Ok(count == 1)
    }

    // ── Workflows ───────────────────────────────────────────────────

    async fn install_workflow(&self, template: &WorkflowTemplate) -> Result<(), DatabaseError> {
        let def = &template.definition;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err("install_workflow"))?;

        tx.execute(
            &format!("INSERT INTO workflows ({WORKFLOW_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                def.id.to_string(),
                def.tenant_id.as_str(),
                def.name.as_str(),
                def.trigger_type.as_str(),
                to_json(&def.trigger_filters)?,
                def.is_active as i64,
                fmt_datetime(&def.created_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Constraint(format!("install_workflow: {e}")))?;

        for step in &template.steps {
            tx.execute(
                &format!(
                    "INSERT INTO workflow_steps ({STEP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    step.id.to_string(),
                    def.id.to_string(),
                    step.order,
                    step.kind.as_str(),
                    to_json(&step.config)?,
                    opt_text_owned(step.next_on_success.map(|id| id.to_string())),
                    opt_text_owned(step.next_on_failure.map(|id| id.to_string())),
                    step.is_enabled as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Constraint(format!("install_workflow step: {e}")))?;
        }

        tx.commit().await.map_err(query_err("install_workflow"))?;
        info!(
            workflow_id = %def.id,
            tenant = %def.tenant_id,
            steps = template.steps.len(),
            "Workflow installed"
        );
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowDefinition>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_workflow"))?;
        first_row(rows, "get_workflow", row_to_workflow).await
    }

    async fn list_active_workflows(
        &self,
        tenant_id: &str,
        trigger_type: &str,
    ) -> Result<Vec<WorkflowDefinition>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {WORKFLOW_COLUMNS} FROM workflows
                     WHERE tenant_id = ?1 AND trigger_type = ?2 AND is_active = 1
                     ORDER BY created_at ASC"
                ),
                params![tenant_id, trigger_type],
            )
            .await
            .map_err(query_err("list_active_workflows"))?;
        collect_rows(rows, "list_active_workflows", row_to_workflow).await
    }

    async fn list_workflow_steps(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<WorkflowStep>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM workflow_steps WHERE workflow_id = ?1 ORDER BY step_order ASC"
                ),
                params![workflow_id.to_string()],
            )
            .await
            .map_err(query_err("list_workflow_steps"))?;
        collect_rows(rows, "list_workflow_steps", row_to_step).await
    }

    async fn set_workflow_active(&self, id: Uuid, active: bool) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE workflows SET is_active = ?1 WHERE id = ?2",
                params![active as i64, id.to_string()],
            )
            .await
            .map_err(query_err("set_workflow_active"))?;
        Ok(count == 1)
    }

    async fn set_step_enabled(&self, step_id: Uuid, enabled: bool) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE workflow_steps SET is_enabled = ?1 WHERE id = ?2",
                params![enabled as i64, step_id.to_string()],
            )
            .await
            .map_err(query_err("set_step_enabled"))?;
        Ok(count == 1)
    }

    // ── Executions ──────────────────────────────────────────────────

    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO workflow_executions ({EXECUTION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    execution.id.to_string(),
                    execution.workflow_id.to_string(),
                    execution.attachment_id.to_string(),
                    execution.ingestion_key.as_str(),
                    execution.status.as_str(),
                    to_json(&execution.visited_steps)?,
                    to_json(&execution.context)?,
                    opt_text(execution.error.as_deref()),
                    fmt_datetime(&execution.started_at),
                    opt_text_owned(execution.finished_at.as_ref().map(fmt_datetime)),
                ],
            )
            .await
            .map_err(query_err("insert_execution"))?;
        Ok(())
    }

    async fn finish_execution(&self, execution: &WorkflowExecution) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE workflow_executions
                 SET status = ?1, visited_steps = ?2, context = ?3, error = ?4, finished_at = ?5
                 WHERE id = ?6",
                params![
                    execution.status.as_str(),
                    to_json(&execution.visited_steps)?,
                    to_json(&execution.context)?,
                    opt_text(execution.error.as_deref()),
                    opt_text_owned(execution.finished_at.as_ref().map(fmt_datetime)),
                    execution.id.to_string(),
                ],
            )
            .await
            .map_err(query_err("finish_execution"))?;
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_execution"))?;
        first_row(rows, "get_execution", row_to_execution).await
    }

    async fn list_executions_for_attachment(
        &self,
        attachment_id: Uuid,
    ) -> Result<Vec<WorkflowExecution>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EXECUTION_COLUMNS} FROM workflow_executions
                     WHERE attachment_id = ?1 ORDER BY started_at ASC"
                ),
                params![attachment_id.to_string()],
            )
            .await
            .map_err(query_err("list_executions_for_attachment"))?;
        collect_rows(rows, "list_executions_for_attachment", row_to_execution).await
    }

    // ── Submissions ─────────────────────────────────────────────────

    async fn insert_submission(&self, s: &Submission) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO submissions ({SUBMISSION_COLUMNS}, target_url)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
                ),
                submission_params(s)?,
            )
            .await
            .map_err(query_err("insert_submission"))?;

        debug!(id = %s.id, document_type = %s.document_type, "Submission inserted");
        Ok(())
    }

    async fn insert_submission_unless_live(&self, s: &Submission) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO submissions ({SUBMISSION_COLUMNS}, target_url)
                     SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20
                     WHERE NOT EXISTS (
                         SELECT 1 FROM submissions
                         WHERE ingestion_key = ?2 AND document_type = ?6 AND target_url = ?20
                           AND {LIVE_SUBMISSION}
                     )"
                ),
                submission_params(s)?,
            )
            .await
            .map_err(query_err("insert_submission_unless_live"))?;

        if count == 1 {
            debug!(id = %s.id, document_type = %s.document_type, "Submission inserted");
        }
        Ok(count == 1)
    }

    async fn get_submission(&self, id: Uuid) -> Result<Option<Submission>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_submission"))?;
        first_row(rows, "get_submission", row_to_submission).await
    }

    async fn find_submission(
        &self,
        ingestion_key: &str,
        document_type: &str,
        target_url: &str,
    ) -> Result<Option<Submission>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SUBMISSION_COLUMNS} FROM submissions
                     WHERE ingestion_key = ?1 AND document_type = ?2 AND target_url = ?3
                       AND {LIVE_SUBMISSION}
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![ingestion_key, document_type, target_url],
            )
            .await
            .map_err(query_err("find_submission"))?;
        first_row(rows, "find_submission", row_to_submission).await
    }

    async fn update_submission_if(
        &self,
        s: &Submission,
        expected: SubmissionStatus,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE submissions
                 SET submission_status = ?1, http_status = ?2, retry_count = ?3, max_retries = ?4,
                     next_retry_at = ?5, retry_delay_seconds = ?6, manual_payload_override = ?7,
                     partner_response = ?8, error_message = ?9, extracted_fields = ?10,
                     updated_at = ?11
                 WHERE id = ?12 AND submission_status = ?13",
                params![
                    s.submission_status.as_str(),
                    opt_int(s.http_status.map(i64::from)),
                    s.retry_count as i64,
                    s.max_retries as i64,
                    opt_text_owned(s.next_retry_at.as_ref().map(fmt_datetime)),
                    opt_int(s.retry_delay_seconds.map(|d| d as i64)),
                    opt_text_owned(s.manual_payload_override.as_ref().map(to_json).transpose()?),
                    opt_text(s.partner_response.as_deref()),
                    opt_text(s.error_message.as_deref()),
                    to_json(&s.extracted_fields)?,
                    fmt_datetime(&s.updated_at),
                    s.id.to_string(),
                    expected.as_str(),
                ],
            )
            .await
            .map_err(query_err("update_submission_if"))?;
        Ok(count == 1)
    }

    async fn list_due_submissions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Submission>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SUBMISSION_COLUMNS} FROM submissions
                     WHERE submission_status = 'failed'
                       AND next_retry_at IS NOT NULL AND next_retry_at <= ?1
                     ORDER BY next_retry_at ASC LIMIT ?2"
                ),
                params![fmt_datetime(&now), limit as i64],
            )
            .await
            .map_err(query_err("list_due_submissions"))?;
        collect_rows(rows, "list_due_submissions", row_to_submission).await
    }

    // ── Attempts ────────────────────────────────────────────────────

    async fn insert_attempt(&self, a: &SubmissionAttempt) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO submission_attempts ({ATTEMPT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    a.id.to_string(),
                    a.submission_id.to_string(),
                    a.attempt_number as i64,
                    fmt_datetime(&a.started_at),
                    opt_text_owned(a.finished_at.as_ref().map(fmt_datetime)),
                    opt_int(a.http_status.map(i64::from)),
                    opt_text(a.error.as_deref()),
                    a.used_override as i64,
                ],
            )
            .await
            .map_err(query_err("insert_attempt"))?;
        Ok(())
    }

    async fn finish_attempt(&self, a: &SubmissionAttempt) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE submission_attempts SET finished_at = ?1, http_status = ?2, error = ?3
                 WHERE id = ?4",
                params![
                    opt_text_owned(a.finished_at.as_ref().map(fmt_datetime)),
                    opt_int(a.http_status.map(i64::from)),
                    opt_text(a.error.as_deref()),
                    a.id.to_string(),
                ],
            )
            .await
            .map_err(query_err("finish_attempt"))?;
        Ok(())
    }

    async fn list_attempts(
        &self,
        submission_id: Uuid,
    ) -> Result<Vec<SubmissionAttempt>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM submission_attempts
                     WHERE submission_id = ?1 ORDER BY attempt_number ASC"
                ),
                params![submission_id.to_string()],
            )
            .await
            .map_err(query_err("list_attempts"))?;
        collect_rows(rows, "list_attempts", row_to_attempt).await
    }

    // ── Tenants ─────────────────────────────────────────────────────

    async fn upsert_tenant(&self, tenant: &TenantCapabilities) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO tenants (tenant_id, display_name, capabilities, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(tenant_id) DO UPDATE SET
                    display_name = excluded.display_name,
                    capabilities = excluded.capabilities,
                    updated_at = excluded.updated_at",
                params![
                    tenant.tenant_id.as_str(),
                    tenant.display_name.as_str(),
                    to_json(tenant)?,
                    fmt_datetime(&Utc::now()),
                ],
            )
            .await
            .map_err(query_err("upsert_tenant"))?;
        Ok(())
    }

    async fn get_tenant(
        &self,
        tenant_id: &str,
    ) -> Result<Option<TenantCapabilities>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                "SELECT capabilities FROM tenants WHERE tenant_id = ?1",
                params![tenant_id],
            )
            .await
            .map_err(query_err("get_tenant"))?;
        first_row(rows, "get_tenant", |row| {
            from_json(&get_text(row, 0)?, "capabilities")
        })
        .await
    }
}
