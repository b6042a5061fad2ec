//! Workflow definition rows and step configuration.
//!
//! A workflow is a definition plus steps linked by explicit
//! `next_on_success` / `next_on_failure` edges. `order` is advisory.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::submission::model::PayloadFormat;

/// Trigger fired when a customer sends a file.
pub const TRIGGER_ATTACHMENT_RECEIVED: &str = "attachment_received";

/// Which attachments a workflow accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerFilters {
    /// Accepted media types; a trailing `/` matches a family (`image/`).
    /// Empty accepts everything.
    #[serde(default)]
    pub media_types: Vec<String>,
}

impl TriggerFilters {
    pub fn matches(&self, media_type: &str) -> bool {
        self.media_types.is_empty()
            || self.media_types.iter().any(|accepted| {
                if accepted.ends_with('/') {
                    media_type.starts_with(accepted.as_str())
                } else {
                    accepted.eq_ignore_ascii_case(media_type)
                }
            })
    }
}

/// Workflow root row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub tenant_id: String,
    #[serde(default)]
    pub name: String,
    pub trigger_type: String,
    #[serde(default)]
    pub trigger_filters: TriggerFilters,
    pub is_active: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Step kind tag stored in the `kind` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Parse,
    Condition,
    ApiAction,
    End,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Condition => "condition",
            Self::ApiAction => "api_action",
            Self::End => "end",
        }
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parse" => Ok(Self::Parse),
            "condition" => Ok(Self::Condition),
            "api_action" => Ok(Self::ApiAction),
            "end" => Ok(Self::End),
            other => Err(format!("unknown step kind: {other}")),
        }
    }
}

/// Step row as stored and exchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: Uuid,
    pub workflow_id: Uuid,
    #[serde(default)]
    pub order: i64,
    pub kind: StepKind,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub next_on_success: Option<Uuid>,
    #[serde(default)]
    pub next_on_failure: Option<Uuid>,
    /// Soft-disable flag; disabled steps are skipped, never deleted.
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Interchange format for "install a workflow template".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub definition: WorkflowDefinition,
    pub steps: Vec<WorkflowStep>,
}

// ── Step configs ────────────────────────────────────────────────────

/// How a clause combines with the running result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LogicalOperator {
    #[default]
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

/// Comparison applied by a clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Exists,
    NotExists,
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
}

/// One condition clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    pub field_path: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub logical_operator: LogicalOperator,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConditionConfig {
    #[serde(default)]
    pub clauses: Vec<Clause>,
}

/// Templated partner call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "empty_object")]
    pub body_template: serde_json::Value,
    #[serde(default)]
    pub format: PayloadFormat,
    /// Upload the source file as the `file` part. Defaults to true for multipart.
    #[serde(default)]
    pub attach_file: Option<bool>,
}

impl ActionConfig {
    pub fn attaches_file(&self) -> bool {
        self.attach_file
            .unwrap_or(self.format == PayloadFormat::Multipart)
    }
}

fn default_method() -> String {
    "POST".to_string()
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Final status recorded by an `end` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndConfig {
    pub status: EndStatus,
}
