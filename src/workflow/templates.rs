//! Built-in workflow templates.

use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::workflow::model::{
    StepKind, TRIGGER_ATTACHMENT_RECEIVED, TriggerFilters, WorkflowDefinition, WorkflowStep,
    WorkflowTemplate,
};

/// Route electricity bills, gas bills and meter photos to a partner API.
///
/// `partner_base_url` has no trailing slash; endpoints are
/// `/electricity`, `/gas` and `/meter-readings`.
pub fn utility_bill_template(tenant_id: &str, partner_base_url: &str) -> WorkflowTemplate {
    let workflow_id = Uuid::new_v4();
    let base = partner_base_url.trim_end_matches('/');

    let parse = Uuid::new_v4();
    let is_electricity = Uuid::new_v4();
    let is_gas = Uuid::new_v4();
    let is_meter = Uuid::new_v4();
    let send_electricity = Uuid::new_v4();
    let send_gas = Uuid::new_v4();
    let send_meter = Uuid::new_v4();
    let done = Uuid::new_v4();
    let failed = Uuid::new_v4();
    let unrouted = Uuid::new_v4();

    let step = |id, order, kind, config: Value, success: Option<Uuid>, failure: Option<Uuid>| {
        WorkflowStep {
            id,
            workflow_id,
            order,
            kind,
            config,
            next_on_success: success,
            next_on_failure: failure,
            is_enabled: true,
        }
    };

    let steps = vec![
        step(parse, 1, StepKind::Parse, json!({}), Some(is_electricity), Some(failed)),
        step(
            is_electricity,
            2,
            StepKind::Condition,
            json!({ "clauses": [
                { "field_path": "parsed_data.document_type", "operator": "equals", "value": "electricity" },
                { "field_path": "parsed_data.mprn", "operator": "exists" }
            ]}),
            Some(send_electricity),
            Some(is_gas),
        ),
        step(
            is_gas,
            3,
            StepKind::Condition,
            json!({ "clauses": [
                { "field_path": "parsed_data.document_type", "operator": "equals", "value": "gas" },
                { "field_path": "parsed_data.gprn", "operator": "exists" }
            ]}),
            Some(send_gas),
            Some(is_meter),
        ),
        step(
            is_meter,
            4,
            StepKind::Condition,
            json!({ "clauses": [
                { "field_path": "parsed_data.document_type", "operator": "equals", "value": "meter_reading" },
                { "field_path": "tenant.meter_readings", "operator": "equals", "value": true },
                { "field_path": "parsed_data.meter_reading", "operator": "exists" }
            ]}),
            Some(send_meter),
            Some(unrouted),
        ),
        step(
            send_electricity,
            5,
            StepKind::ApiAction,
            json!({
                "method": "POST",
                "url": format!("{base}/electricity"),
                "body_template": {
                    "reference": "{{attachment.id}}",
                    "mprn": "{{parsed_data.mprn}}",
                    "dg": "{{parsed_data.dg}}",
                    "phone": "{{parsed_data.phone}}",
                    "account_number": "{{parsed_data.account_number}}",
                    "customer_name": "{{parsed_data.customer_name}}",
                    "supply_address": "{{parsed_data.supply_address}}",
                    "supplier": "{{parsed_data.supplier}}",
                    "bill_date": "{{parsed_data.bill_date}}",
                    "amount_due": "{{parsed_data.amount_due}}"
                }
            }),
            Some(done),
            Some(failed),
        ),
        step(
            send_gas,
            6,
            StepKind::ApiAction,
            json!({
                "method": "POST",
                "url": format!("{base}/gas"),
                "body_template": {
                    "reference": "{{attachment.id}}",
                    "gprn": "{{parsed_data.gprn}}",
                    "phone": "{{parsed_data.phone}}",
                    "account_number": "{{parsed_data.account_number}}",
                    "customer_name": "{{parsed_data.customer_name}}",
                    "supply_address": "{{parsed_data.supply_address}}",
                    "supplier": "{{parsed_data.supplier}}",
                    "bill_date": "{{parsed_data.bill_date}}",
                    "amount_due": "{{parsed_data.amount_due}}"
                }
            }),
            Some(done),
            Some(failed),
        ),
        step(
            send_meter,
            7,
            StepKind::ApiAction,
            json!({
                "method": "POST",
                "url": format!("{base}/meter-readings"),
                "body_template": {
                    "reference": "{{attachment.id}}",
                    "mprn": "{{parsed_data.mprn}}",
                    "gprn": "{{parsed_data.gprn}}",
                    "meter_number": "{{parsed_data.meter_number}}",
                    "meter_reading": "{{parsed_data.meter_reading}}",
                    "reading_date": "{{parsed_data.reading_date}}"
                }
            }),
            Some(done),
            Some(failed),
        ),
        step(done, 8, StepKind::End, json!({ "status": "success" }), None, None),
        step(failed, 9, StepKind::End, json!({ "status": "failure" }), None, None),
        step(unrouted, 10, StepKind::End, json!({ "status": "failure" }), None, None),
    ];

    WorkflowTemplate {
        definition: WorkflowDefinition {
            id: workflow_id,
            tenant_id: tenant_id.to_string(),
            name: "Utility bill routing".to_string(),
            trigger_type: TRIGGER_ATTACHMENT_RECEIVED.to_string(),
            trigger_filters: TriggerFilters {
                media_types: vec!["image/".into(), "application/pdf".into()],
            },
            is_active: true,
            created_at: Utc::now(),
        },
        steps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::graph::{Step, WorkflowGraph};

    #[test]
    fn template_builds_valid_graph() {
        let template = utility_bill_template("acme", "https://partner.example/api/");
        let graph =
            WorkflowGraph::build(template.definition.id, &template.steps).unwrap();

        assert_eq!(graph.node(graph.entry()).step, Step::Parse);
        let urls: Vec<String> = (0..graph.len())
            .filter_map(|i| match &graph.node(i).step {
                Step::Action(action) => Some(action.url.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            urls,
            vec![
                "https://partner.example/api/electricity",
                "https://partner.example/api/gas",
                "https://partner.example/api/meter-readings",
            ]
        );
    }

    #[test]
    fn template_round_trips_as_json() {
        let template = utility_bill_template("acme", "https://partner.example");
        let json = serde_json::to_string(&template).unwrap();
        let back: WorkflowTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, template);
    }
}
