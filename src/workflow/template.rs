//! `{{dot.path}}` placeholder rendering for api_action steps.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::workflow::context::ExecutionContext;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}").unwrap()
});

/// Render placeholders inside a string. Missing paths render empty.
pub fn render_str(template: &str, ctx: &ExecutionContext) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            ctx.lookup(&caps[1]).map(text_of).unwrap_or_default()
        })
        .into_owned()
}

/// Render every string inside a JSON value.
///
/// A string that is exactly one placeholder takes the referenced value with
/// its JSON type, or null when the path is missing.
pub fn render_value(template: &Value, ctx: &ExecutionContext) -> Value {
    match template {
        Value::String(s) => match whole_placeholder(s) {
            Some(path) => ctx.lookup(path).cloned().unwrap_or(Value::Null),
            None => Value::String(render_str(s, ctx)),
        },
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn whole_placeholder(s: &str) -> Option<&str> {
    let caps = PLACEHOLDER.captures(s.trim())?;
    let whole = caps.get(0)?;
    if whole.as_str().len() != s.trim().len() {
        return None;
    }
    caps.get(1).map(|m| m.as_str())
}

fn text_of(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
