//! Append-only execution context.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::WorkflowError;

pub const ATTACHMENT_KEY: &str = "attachment";
pub const TENANT_KEY: &str = "tenant";
pub const PARSED_DATA_KEY: &str = "parsed_data";
pub const STEPS_KEY: &str = "steps";

/// Values accumulated while walking a workflow.
///
/// Keys are written once. Step outputs live under `steps.<step_id>`.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    values: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a top-level key. Overwriting is a configuration error.
    pub fn insert(&mut self, key: &str, value: Value) -> Result<(), WorkflowError> {
        if self.values.contains_key(key) {
            return Err(WorkflowError::Config(format!(
                "context key '{key}' already written"
            )));
        }
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    /// Store a step's output under `steps.<step_id>`.
    pub fn record_step(&mut self, step_id: Uuid, value: Value) -> Result<(), WorkflowError> {
        let steps = self
            .values
            .entry(STEPS_KEY)
            .or_insert_with(|| Value::Object(Map::new()));
        let Value::Object(steps) = steps else {
            return Err(WorkflowError::Config(format!(
                "context key '{STEPS_KEY}' is not an object"
            )));
        };

        let key = step_id.to_string();
        if steps.contains_key(&key) {
            return Err(WorkflowError::Config(format!(
                "context key '{STEPS_KEY}.{key}' already written"
            )));
        }
        steps.insert(key, value);
        Ok(())
    }

    /// Dot-path lookup (`parsed_data.mprn`, `steps.<id>.http_status`).
    /// Numeric segments index into arrays.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.').filter(|s| !s.is_empty());
        let mut current = self.values.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }
}
