//! Extraction schema: what the model may return, and validation of what it did.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::classify::types::{ClassificationResult, DocumentType, Field, FieldType};
use crate::error::ClassificationError;

/// A field the model is asked to extract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub pii: bool,
    pub description: String,
}

impl FieldSpec {
    fn new(name: &str, field_type: FieldType, pii: bool, description: &str) -> Self {
        Self {
            name: name.into(),
            field_type,
            pii,
            description: description.into(),
        }
    }
}

/// Document types and fields the model output is held to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSchema {
    pub document_types: Vec<DocumentType>,
    pub fields: Vec<FieldSpec>,
}

impl ExtractionSchema {
    /// Utility bills and meter-reading photos.
    pub fn utility_documents() -> Self {
        use FieldType::*;
        Self {
            document_types: DocumentType::ALL.to_vec(),
            fields: vec![
                FieldSpec::new("mprn", Identifier, false, "Electricity meter point reference number (11 digits)"),
                FieldSpec::new("gprn", Identifier, false, "Gas point registration number"),
                FieldSpec::new("phone", Phone, true, "Customer phone number"),
                FieldSpec::new("account_number", Identifier, true, "Supplier account number"),
                FieldSpec::new("customer_name", Text, true, "Account holder name"),
                FieldSpec::new("supply_address", Text, true, "Supply address"),
                FieldSpec::new("supplier", Text, false, "Energy supplier name"),
                FieldSpec::new("bill_date", Date, false, "Bill issue date, YYYY-MM-DD"),
                FieldSpec::new("amount_due", Amount, false, "Total amount due"),
                FieldSpec::new("meter_number", Identifier, false, "Meter serial number"),
                FieldSpec::new("meter_reading", Number, false, "Reading shown on the meter"),
                FieldSpec::new("dg", Text, false, "Distribution group / DUoS group code"),
                FieldSpec::new("reading_date", Date, false, "Date of the meter reading, YYYY-MM-DD"),
            ],
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// JSON Schema the model's tool call must satisfy.
    pub fn to_json_schema(&self) -> Value {
        let document_types: Vec<&str> = self.document_types.iter().map(|t| t.as_str()).collect();

        let mut field_props = serde_json::Map::new();
        let mut confidence_props = serde_json::Map::new();
        for spec in &self.fields {
            field_props.insert(
                spec.name.clone(),
                json!({ "type": [spec.field_type.json_type(), "null"], "description": spec.description }),
            );
            confidence_props.insert(
                spec.name.clone(),
                json!({ "type": "number", "minimum": 0, "maximum": 1 }),
            );
        }

        json!({
            "type": "object",
            "properties": {
                "document_type": { "type": "string", "enum": document_types },
                "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
                "fields": { "type": "object", "properties": field_props, "additionalProperties": false },
                "field_confidence": { "type": "object", "properties": confidence_props, "additionalProperties": false },
                "low_confidence_fields": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["document_type", "confidence", "fields", "field_confidence"]
        })
    }

    /// Check raw model output and turn it into a typed result.
    ///
    /// Undeclared fields are dropped; null values count as absent. A field
    /// without a reported confidence is treated as confidence 0.
    pub fn validate(
        &self,
        raw: &Value,
        low_confidence_threshold: f64,
    ) -> Result<ClassificationResult, ClassificationError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| invalid("output is not a JSON object"))?;

        let document_type: DocumentType = obj
            .get("document_type")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing string 'document_type'"))?
            .parse()
            .map_err(|e: String| invalid(&e))?;
        if !self.document_types.contains(&document_type) {
            return Err(invalid(&format!(
                "document type '{document_type}' not allowed by schema"
            )));
        }

        let confidence = unit_interval(obj.get("confidence"), "confidence")?;

        let raw_fields = obj
            .get("fields")
            .and_then(Value::as_object)
            .ok_or_else(|| invalid("missing object 'fields'"))?;
        let raw_confidence = obj
            .get("field_confidence")
            .and_then(Value::as_object)
            .ok_or_else(|| invalid("missing object 'field_confidence'"))?;

        let mut fields = BTreeMap::new();
        for (name, value) in raw_fields {
            let Some(spec) = self.field(name) else {
                debug!(field = %name, "Dropping field not declared by schema");
                continue;
            };
            if value.is_null() {
                continue;
            }
            fields.insert(
                name.clone(),
                Field {
                    value: value.clone(),
                    field_type: spec.field_type,
                    pii: spec.pii,
                },
            );
        }

        let mut field_confidence = BTreeMap::new();
        for name in fields.keys() {
            if let Some(value) = raw_confidence.get(name) {
                let score = unit_interval(Some(value), &format!("field_confidence.{name}"))?;
                field_confidence.insert(name.clone(), score);
            }
        }

        let low_confidence_fields = fields
            .keys()
            .filter(|name| {
                field_confidence.get(*name).copied().unwrap_or(0.0) < low_confidence_threshold
            })
            .cloned()
            .collect();

        Ok(ClassificationResult {
            document_type,
            confidence,
            fields,
            field_confidence,
            low_confidence_fields,
        })
    }
}

impl Default for ExtractionSchema {
    fn default() -> Self {
        Self::utility_documents()
    }
}

fn invalid(reason: &str) -> ClassificationError {
    ClassificationError::InvalidOutput(reason.to_string())
}

fn unit_interval(value: Option<&Value>, name: &str) -> Result<f64, ClassificationError> {
    let n = value
        .and_then(Value::as_f64)
        .ok_or_else(|| invalid(&format!("'{name}' must be a number")))?;
    if !(0.0..=1.0).contains(&n) {
        return Err(invalid(&format!("'{name}' = {n} is outside [0, 1]")));
    }
    Ok(n)
}
