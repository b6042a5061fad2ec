//! Request body construction for partner calls.

use reqwest::multipart::{Form, Part};
use serde_json::{Map, Value};

use crate::fetch::FetchedFile;

pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Text form of a payload value for a multipart part. Null is skipped.
pub fn form_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Content type for the re-streamed file: what the file server said, else
/// the attachment's declared type, else octet-stream.
pub fn infer_content_type(served: Option<&str>, declared: Option<&str>) -> String {
    served
        .or(declared)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(FALLBACK_CONTENT_TYPE)
        .to_string()
}

/// Multipart form with one text part per field and an optional `file` part.
pub fn multipart_form(
    payload: &Map<String, Value>,
    file: Option<FetchedFile>,
    declared_media_type: Option<&str>,
) -> Result<Form, reqwest::Error> {
    let mut form = Form::new();
    for (name, value) in payload {
        if let Some(text) = form_text(value) {
            form = form.text(name.clone(), text);
        }
    }

    if let Some(file) = file {
        let content_type = infer_content_type(file.content_type.as_deref(), declared_media_type);
        let content_type = if is_plain_mime(&content_type) {
            content_type
        } else {
            FALLBACK_CONTENT_TYPE.to_string()
        };
        let part = Part::bytes(file.bytes)
            .file_name(file.file_name)
            .mime_str(&content_type)?;
        form = form.part("file", part);
    }
    Ok(form)
}

/// `type/subtype` made of token characters.
fn is_plain_mime(s: &str) -> bool {
    let token = |t: &str| {
        !t.is_empty()
            && t.chars()
                .all(|c| c.is_ascii_alphanumeric() || "!#$&^_.+-".contains(c))
    };
    matches!(s.split_once('/'), Some((kind, sub)) if token(kind) && token(sub))
}
