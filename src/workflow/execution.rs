//! Persisted record of one workflow run.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::model::EndStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failure,
    /// Stopped on a configuration defect or an unroutable parse failure.
    Aborted,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Aborted => "aborted",
        }
    }
}

impl From<EndStatus> for ExecutionStatus {
    fn from(status: EndStatus) -> Self {
        match status {
            EndStatus::Success => Self::Success,
            EndStatus::Failure => Self::Failure,
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub attachment_id: Uuid,
    pub ingestion_key: String,
    pub status: ExecutionStatus,
    /// Step ids in the order they were entered.
    pub visited_steps: Vec<Uuid>,
    /// Final context snapshot.
    pub context: serde_json::Value,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn start(workflow_id: Uuid, attachment_id: Uuid, ingestion_key: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            attachment_id,
            ingestion_key: ingestion_key.to_string(),
            status: ExecutionStatus::Running,
            visited_steps: Vec::new(),
            context: serde_json::Value::Null,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}
