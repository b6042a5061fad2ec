//! Classification result and parse-state types.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Document types ──────────────────────────────────────────────────

/// What kind of document the model recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Electricity,
    Gas,
    MeterReading,
    Other,
}

impl DocumentType {
    pub const ALL: [DocumentType; 4] = [
        DocumentType::Electricity,
        DocumentType::Gas,
        DocumentType::MeterReading,
        DocumentType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Electricity => "electricity",
            Self::Gas => "gas",
            Self::MeterReading => "meter_reading",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "electricity" => Ok(Self::Electricity),
            "gas" => Ok(Self::Gas),
            "meter_reading" => Ok(Self::MeterReading),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown document type: {other}")),
        }
    }
}

// ── Fields ──────────────────────────────────────────────────────────

/// Type tag attached to every extracted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Identifier,
    Phone,
    Date,
    Amount,
    Number,
}

impl FieldType {
    /// JSON Schema type the model must emit for this tag.
    pub fn json_type(&self) -> &'static str {
        match self {
            Self::Amount | Self::Number => "number",
            _ => "string",
        }
    }
}

/// One extracted value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub value: serde_json::Value,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Personally identifying; redact before logging.
    pub pii: bool,
}

// ── Classification ──────────────────────────────────────────────────

/// Validated output of one model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub document_type: DocumentType,
    pub confidence: f64,
    pub fields: BTreeMap<String, Field>,
    pub field_confidence: BTreeMap<String, f64>,
    pub low_confidence_fields: Vec<String>,
}

impl ClassificationResult {
    /// Shape written to the workflow context as `parsed_data`.
    ///
    /// Field values sit at the top level so conditions can address them as
    /// `parsed_data.mprn`.
    pub fn to_context_value(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (name, field) in &self.fields {
            map.insert(name.clone(), field.value.clone());
        }
        map.insert(
            "document_type".into(),
            serde_json::Value::String(self.document_type.as_str().into()),
        );
        map.insert("confidence".into(), serde_json::json!(self.confidence));
        map.insert(
            "low_confidence_fields".into(),
            serde_json::json!(self.low_confidence_fields),
        );
        serde_json::Value::Object(map)
    }

    /// Field values only, as sent to the partner.
    pub fn field_values(&self) -> serde_json::Map<String, serde_json::Value> {
        self.fields
            .iter()
            .map(|(name, field)| (name.clone(), field.value.clone()))
            .collect()
    }
}

// ── Parse state ─────────────────────────────────────────────────────

/// Lifecycle of a ParseResult row. `status` doubles as the cooperative lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ParseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for ParseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown parse status: {other}")),
        }
    }
}

/// Persisted classification state for one attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseResult {
    pub attachment_id: Uuid,
    pub status: ParseStatus,
    pub document_type: Option<DocumentType>,
    pub classification_confidence: Option<f64>,
    pub extracted_fields: BTreeMap<String, Field>,
    pub field_confidence: BTreeMap<String, f64>,
    pub low_confidence_fields: Vec<String>,
    pub error: Option<String>,
    pub model: Option<String>,
    pub file_sha256: Option<String>,
    pub ingestion_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ParseResult {
    /// The classification, if this row completed.
    pub fn classification(&self) -> Option<ClassificationResult> {
        if self.status != ParseStatus::Completed {
            return None;
        }
        Some(ClassificationResult {
            document_type: self.document_type?,
            confidence: self.classification_confidence.unwrap_or(0.0),
            fields: self.extracted_fields.clone(),
            field_confidence: self.field_confidence.clone(),
            low_confidence_fields: self.low_confidence_fields.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ClassificationResult {
        let mut fields = BTreeMap::new();
        fields.insert(
            "mprn".to_string(),
            Field {
                value: serde_json::json!("10012345678"),
                field_type: FieldType::Identifier,
                pii: false,
            },
        );
        ClassificationResult {
            document_type: DocumentType::Electricity,
            confidence: 0.93,
            fields,
            field_confidence: BTreeMap::from([("mprn".to_string(), 0.95)]),
            low_confidence_fields: vec![],
        }
    }

    #[test]
    fn document_type_round_trips_through_str() {
        for t in DocumentType::ALL {
            assert_eq!(t.as_str().parse::<DocumentType>().unwrap(), t);
        }
        assert!("water".parse::<DocumentType>().is_err());
    }

    #[test]
    fn context_value_flattens_fields() {
        let value = sample().to_context_value();
        assert_eq!(value["mprn"], "10012345678");
        assert_eq!(value["document_type"], "electricity");
        assert!(value["low_confidence_fields"].as_array().unwrap().is_empty());
    }

    #[test]
    fn field_serializes_type_tag() {
        let json = serde_json::to_value(&sample().fields["mprn"]).unwrap();
        assert_eq!(json["type"], "identifier");
        assert_eq!(json["pii"], false);
    }
}
