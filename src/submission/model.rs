//! Submission lifecycle types.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classify::types::DocumentType;

/// State of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    /// Created, not yet sent.
    Pending,
    /// HTTP call in flight.
    Submitting,
    /// Partner accepted it. Terminal.
    Completed,
    /// Last attempt failed; retried if `next_retry_at` is set.
    Failed,
}

impl SubmissionStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: SubmissionStatus) -> bool {
        use SubmissionStatus::*;

        matches!(
            (self, target),
            (Pending, Submitting)
                | (Submitting, Completed)
                | (Submitting, Failed)
                | (Failed, Submitting)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitting => "submitting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "submitting" => Ok(Self::Submitting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown submission status: {other}")),
        }
    }
}

/// Body encoding expected by the partner endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    /// `multipart/form-data` with scalar text parts and an optional `file` part.
    #[default]
    Multipart,
    /// JSON body.
    Json,
}

/// Where and how a submission is sent. Rendered once by the workflow and
/// persisted so retries don't need the workflow context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchTarget {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub format: PayloadFormat,
    /// Source file re-uploaded as the `file` part (multipart only).
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub file_media_type: Option<String>,
}

/// One row per (document, target endpoint).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub ingestion_key: String,
    pub attachment_id: Uuid,
    pub workflow_id: Option<Uuid>,
    pub step_id: Option<Uuid>,
    pub document_type: DocumentType,
    pub target: DispatchTarget,
    /// Canonical payload fields rendered from the extraction.
    pub extracted_fields: serde_json::Map<String, serde_json::Value>,
    pub submission_status: SubmissionStatus,
    pub http_status: Option<u16>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub retry_delay_seconds: Option<u64>,
    /// Operator-supplied payload used for exactly one attempt.
    pub manual_payload_override: Option<serde_json::Map<String, serde_json::Value>>,
    /// Raw body of the last partner response.
    pub partner_response: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Submission {
    /// A fresh pending submission.
    pub fn new(new: NewSubmission) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            ingestion_key: new.ingestion_key,
            attachment_id: new.attachment_id,
            workflow_id: new.workflow_id,
            step_id: new.step_id,
            document_type: new.document_type,
            target: new.target,
            extracted_fields: new.extracted_fields,
            submission_status: SubmissionStatus::Pending,
            http_status: None,
            retry_count: 0,
            max_retries: new.max_retries,
            next_retry_at: None,
            retry_delay_seconds: None,
            manual_payload_override: None,
            partner_response: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// No further attempts will be made without operator action.
    pub fn is_terminal(&self) -> bool {
        match self.submission_status {
            SubmissionStatus::Completed => true,
            SubmissionStatus::Failed => self.next_retry_at.is_none(),
            _ => false,
        }
    }

    /// Scheduled for a retry at or before `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.submission_status == SubmissionStatus::Failed
            && self.next_retry_at.is_some_and(|at| at <= now)
    }
}

/// Inputs for creating a submission.
#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub ingestion_key: String,
    pub attachment_id: Uuid,
    pub workflow_id: Option<Uuid>,
    pub step_id: Option<Uuid>,
    pub document_type: DocumentType,
    pub target: DispatchTarget,
    pub extracted_fields: serde_json::Map<String, serde_json::Value>,
    pub max_retries: u32,
}

/// One dispatch attempt, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionAttempt {
    pub id: Uuid,
    pub submission_id: Uuid,
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub http_status: Option<u16>,
    pub error: Option<String>,
    pub used_override: bool,
}

/// Submission plus its attempt history, as shown to operators.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionHistory {
    pub submission: Submission,
    pub attempts: Vec<SubmissionAttempt>,
}
