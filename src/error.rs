//! Error types for document intake.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Identity error: {0}")]
    Hash(#[from] HashError),

    #[error("File fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Classification error: {0}")]
    Classification(#[from] ClassificationError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Submission error: {0}")]
    Tracker(#[from] TrackerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Customer identity hashing errors.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("Customer has no usable email, phone or id")]
    NoIdentity,
}

/// Failure to download a source file.
#[derive(Debug, thiserror::Error)]
#[error("Could not fetch {url}: {reason}")]
pub struct FetchError {
    pub url: String,
    pub reason: String,
}

/// Classification/extraction errors.
#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    #[error("File is {size} bytes, limit is {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Model {model} request failed: {reason}")]
    ModelRequest { model: String, reason: String },

    #[error("Model call timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Model output failed schema validation: {0}")]
    InvalidOutput(String),

    #[error("Attachment {attachment_id} previously failed classification: {reason}")]
    PreviouslyFailed { attachment_id: Uuid, reason: String },

    #[error("Attachment {attachment_id} is being classified by another invocation")]
    InFlight { attachment_id: Uuid },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Workflow graph and execution errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Workflow {workflow_id} revisits step {step_id}")]
    Cycle { workflow_id: Uuid, step_id: Uuid },

    #[error("Workflow configuration error: {0}")]
    Config(String),

    #[error("Workflow {0} not found")]
    NotFound(Uuid),

    #[error("Execution aborted: parse failed and no failure end is reachable: {0}")]
    ParseAborted(#[source] ClassificationError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Submission error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Partner dispatch errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Partner returned HTTP {status}")]
    Http { status: u16, body: String },

    #[error("File fetch failed: {0}")]
    FileFetch(#[from] FetchError),

    #[error("Invalid dispatch target: {0}")]
    InvalidTarget(String),

    #[error("Submission error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

impl DispatchError {
    /// Whether this failure is recovered through the retry schedule.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Http { .. } | Self::FileFetch(_)
        )
    }
}

/// Submission lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Submission {0} not found")]
    NotFound(Uuid),

    #[error("Submission {id} cannot move from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Dedup key for {ingestion_key} -> {url} kept changing under concurrent writers")]
    DedupContention { ingestion_key: String, url: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
