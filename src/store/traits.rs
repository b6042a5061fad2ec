//! Unified `Database` trait, the single async interface for persistence.
//!
//! Every status change on a shared row is a conditional write: the caller
//! names the status it expects and learns whether it won.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::classify::types::{ClassificationResult, ParseResult, ParseStatus};
use crate::error::DatabaseError;
use crate::submission::model::{Submission, SubmissionAttempt, SubmissionStatus};
use crate::tenant::TenantCapabilities;
use crate::workflow::execution::WorkflowExecution;
use crate::workflow::model::{WorkflowDefinition, WorkflowStep, WorkflowTemplate};

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Parse results ───────────────────────────────────────────────

    /// Get the parse result for an attachment.
    async fn get_parse_result(
        &self,
        attachment_id: Uuid,
    ) -> Result<Option<ParseResult>, DatabaseError>;

    /// Latest completed result for the same content and customer, under
    /// any attachment id.
    async fn find_completed_parse_by_ingestion(
        &self,
        ingestion_key: &str,
    ) -> Result<Option<ParseResult>, DatabaseError>;

    /// Create a `pending` row if none exists. Never overwrites.
    async fn ensure_parse_result(
        &self,
        attachment_id: Uuid,
        file_sha256: Option<&str>,
        ingestion_key: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Move the row to `processing` if its status is one of `from`.
    /// Returns false if another invocation holds it.
    async fn claim_parse_result(
        &self,
        attachment_id: Uuid,
        from: &[ParseStatus],
    ) -> Result<bool, DatabaseError>;

    /// Store a classification on a row this invocation holds.
    async fn complete_parse_result(
        &self,
        attachment_id: Uuid,
        model: &str,
        result: &ClassificationResult,
    ) -> Result<bool, DatabaseError>;

    /// Mark a held or pending row failed with a diagnostic message.
    async fn fail_parse_result(
        &self,
        attachment_id: Uuid,
        error: &str,
    ) -> Result<bool, DatabaseError>;

    // ── Workflows ───────────────────────────────────────────────────

    /// Store a workflow definition and all of its steps.
    async fn install_workflow(&self, template: &WorkflowTemplate) -> Result<(), DatabaseError>;

    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowDefinition>, DatabaseError>;

    /// Active workflows for a tenant and trigger, oldest first.
    async fn list_active_workflows(
        &self,
        tenant_id: &str,
        trigger_type: &str,
    ) -> Result<Vec<WorkflowDefinition>, DatabaseError>;

    /// All steps of a workflow, in advisory order.
    async fn list_workflow_steps(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<WorkflowStep>, DatabaseError>;

    async fn set_workflow_active(&self, id: Uuid, active: bool) -> Result<bool, DatabaseError>;

    async fn set_step_enabled(&self, step_id: Uuid, enabled: bool) -> Result<bool, DatabaseError>;

    // ── Executions ──────────────────────────────────────────────────

    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<(), DatabaseError>;

    /// Record the final status, path and context of a run.
    async fn finish_execution(&self, execution: &WorkflowExecution) -> Result<(), DatabaseError>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, DatabaseError>;

    /// Every run recorded for an attachment, oldest first.
    async fn list_executions_for_attachment(
        &self,
        attachment_id: Uuid,
    ) -> Result<Vec<WorkflowExecution>, DatabaseError>;

    // ── Submissions ─────────────────────────────────────────────────

    async fn insert_submission(&self, submission: &Submission) -> Result<(), DatabaseError>;

    /// Insert only if no live or completed row shares the dedup key.
    /// Returns false when one does.
    async fn insert_submission_unless_live(
        &self,
        submission: &Submission,
    ) -> Result<bool, DatabaseError>;

    async fn get_submission(&self, id: Uuid) -> Result<Option<Submission>, DatabaseError>;

    /// Most recent live or completed submission for a dedup key.
    /// Terminally failed rows are skipped.
    async fn find_submission(
        &self,
        ingestion_key: &str,
        document_type: &str,
        target_url: &str,
    ) -> Result<Option<Submission>, DatabaseError>;

    /// Write every mutable column, but only if the stored status is `expected`.
    async fn update_submission_if(
        &self,
        submission: &Submission,
        expected: SubmissionStatus,
    ) -> Result<bool, DatabaseError>;

    /// Failed submissions whose `next_retry_at` has passed, oldest first.
    async fn list_due_submissions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Submission>, DatabaseError>;

    // ── Attempts ────────────────────────────────────────────────────

    async fn insert_attempt(&self, attempt: &SubmissionAttempt) -> Result<(), DatabaseError>;

    async fn finish_attempt(&self, attempt: &SubmissionAttempt) -> Result<(), DatabaseError>;

    async fn list_attempts(
        &self,
        submission_id: Uuid,
    ) -> Result<Vec<SubmissionAttempt>, DatabaseError>;

    // ── Tenants ─────────────────────────────────────────────────────

    async fn upsert_tenant(&self, tenant: &TenantCapabilities) -> Result<(), DatabaseError>;

    async fn get_tenant(&self, tenant_id: &str)
    -> Result<Option<TenantCapabilities>, DatabaseError>;
}
