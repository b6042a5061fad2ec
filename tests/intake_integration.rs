//! End-to-end intake tests.
//!
//! Each test spins up an Axum stub partner on a random port that serves the
//! source file and records partner calls, then drives the real fetcher,
//! dispatcher, workflow engine and retry sweeper against it. The vision model
//! is a stub with a call counter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{StatusCode, Uri, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use chrono::Utc;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use uuid::Uuid;

use doc_intake::api::{ApiState, api_routes};
use doc_intake::attachment::Attachment;
use doc_intake::classify::{
    Classifier, ExtractionSchema, ParseStatus, VisionModel, VisionRequest,
};
use doc_intake::config::{ClassifierConfig, DispatchConfig};
use doc_intake::dispatch::{Dispatcher, RetrySweeper};
use doc_intake::error::{ClassificationError, Error};
use doc_intake::fetch::FileFetcher;
use doc_intake::hashing::{ContentHasher, CustomerIdentity};
use doc_intake::intake::{IntakeRequest, IntakeService};
use doc_intake::store::{Database, LibSqlBackend};
use doc_intake::submission::{SubmissionStatus, SubmissionTracker};
use doc_intake::tenant::TenantCapabilities;
use doc_intake::workflow::model::{
    StepKind, TRIGGER_ATTACHMENT_RECEIVED, TriggerFilters, WorkflowDefinition, WorkflowStep,
    WorkflowTemplate,
};
use doc_intake::workflow::templates::utility_bill_template;
use doc_intake::workflow::{ExecutionStatus, WorkflowEngine};

const TENANT: &str = "acme";
const PDF_BYTES: &[u8] = b"%PDF-1.4 electricity bill";

// ── Stubs ───────────────────────────────────────────────────────────────

/// Vision model returning a fixed reply and counting calls.
struct StubVision {
    reply: Value,
    calls: AtomicUsize,
}

#[async_trait]
impl VisionModel for StubVision {
    fn model_name(&self) -> &str {
        "stub-vision"
    }

    async fn extract(&self, _request: VisionRequest<'_>) -> Result<Value, ClassificationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.clone())
    }
}

/// Partner calls seen by the stub: (path, raw body).
#[derive(Default)]
struct PartnerLog {
    calls: Mutex<Vec<(String, Bytes)>>,
}

impl PartnerLog {
    fn count(&self, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .count()
    }

    fn bodies(&self, path: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, body)| String::from_utf8_lossy(body).into_owned())
            .collect()
    }
}

async fn serve_file() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/pdf")], PDF_BYTES)
}

async fn accept(State(log): State<Arc<PartnerLog>>, uri: Uri, body: Bytes) -> impl IntoResponse {
    log.calls.lock().unwrap().push((uri.path().to_string(), body));
    (StatusCode::OK, axum::Json(json!({ "status": "received" })))
}

async fn reject(State(log): State<Arc<PartnerLog>>, uri: Uri, body: Bytes) -> impl IntoResponse {
    log.calls.lock().unwrap().push((uri.path().to_string(), body));
    (StatusCode::INTERNAL_SERVER_ERROR, "partner down")
}

/// Start the stub partner, return its base URL.
async fn start_partner(log: Arc<PartnerLog>) -> String {
    let app = Router::new()
        .route("/files/bill.pdf", get(serve_file))
        .route("/ok/electricity", post(accept))
        .route("/ok/gas", post(accept))
        .route("/ok/meter-readings", post(accept))
        .route("/ok/json", post(accept))
        .route("/down/electricity", post(reject))
        .with_state(log);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("http://127.0.0.1:{port}")
}

// ── Harness ─────────────────────────────────────────────────────────────

struct Harness {
    base: String,
    partner: Arc<PartnerLog>,
    store: Arc<dyn Database>,
    vision: Arc<StubVision>,
    tracker: Arc<SubmissionTracker>,
    intake: Arc<IntakeService>,
    sweeper: RetrySweeper,
}

impl Harness {
    async fn new(reply: Value) -> Self {
        let partner = Arc::new(PartnerLog::default());
        let base = start_partner(Arc::clone(&partner)).await;

        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let vision = Arc::new(StubVision {
            reply,
            calls: AtomicUsize::new(0),
        });
        let classifier = Arc::new(Classifier::new(
            Arc::clone(&store),
            Arc::clone(&vision) as Arc<dyn VisionModel>,
            ExtractionSchema::utility_documents(),
            ClassifierConfig::default(),
        ));
        let tracker = Arc::new(SubmissionTracker::new(Arc::clone(&store)));
        let dispatcher = Arc::new(
            Dispatcher::new(&DispatchConfig::default(), Arc::clone(&tracker)).unwrap(),
        );
        let engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&store),
            Arc::clone(&classifier),
            Arc::clone(&dispatcher),
        ));
        let intake = Arc::new(IntakeService::new(
            Arc::clone(&store),
            ContentHasher::new("353"),
            FileFetcher::new(Duration::from_secs(5)).unwrap(),
            classifier,
            engine,
        ));

        Self {
            base,
            partner,
            store,
            vision,
            tracker,
            intake,
            sweeper: RetrySweeper::new(dispatcher),
        }
    }

    /// Install the utility-bill workflow routed to `/{prefix}/...`.
    async fn install_utility_workflow(&self, prefix: &str) {
        let template = utility_bill_template(TENANT, &format!("{}/{prefix}", self.base));
        self.store.install_workflow(&template).await.unwrap();
    }

    fn attachment(&self) -> Attachment {
        Attachment {
            id: Uuid::new_v4(),
            url: format!("{}/files/bill.pdf", self.base),
            media_type: "application/pdf".into(),
            byte_size: PDF_BYTES.len() as u64,
        }
    }

    fn vision_calls(&self) -> usize {
        self.vision.calls.load(Ordering::SeqCst)
    }
}

fn request(attachment: &Attachment, force: bool) -> IntakeRequest {
    IntakeRequest {
        tenant_id: TENANT.into(),
        customer: CustomerIdentity {
            email: Some("Jane.Doe@Example.com".into()),
            phone: Some("087 123 4567".into()),
            id: None,
        },
        attachment: attachment.clone(),
        force,
    }
}

fn electricity_reply() -> Value {
    json!({
        "document_type": "electricity",
        "confidence": 0.94,
        "fields": {
            "mprn": "10012345678",
            "customer_name": "Jane Doe",
            "supplier": "Volt Energy",
            "amount_due": 84.2
        },
        "field_confidence": {
            "mprn": 0.98,
            "customer_name": 0.95,
            "supplier": 0.9,
            "amount_due": 0.6
        }
    })
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn electricity_bill_is_classified_and_dispatched() {
    let h = Harness::new(electricity_reply()).await;
    h.install_utility_workflow("ok").await;
    let attachment = h.attachment();

    let report = h.intake.process(request(&attachment, false)).await.unwrap();

    assert_eq!(report.execution_status, Some(ExecutionStatus::Success));
    assert_eq!(report.submissions.len(), 1);
    let submission = &report.submissions[0];
    assert_eq!(submission.submission_status, SubmissionStatus::Completed);
    assert_eq!(submission.http_status, Some(200));
    assert_eq!(submission.retry_count, 0);
    assert!(submission.next_retry_at.is_none());
    assert!(submission.target.url.ends_with("/ok/electricity"));

    let classification = report.classification.unwrap();
    assert_eq!(classification.low_confidence_fields, vec!["amount_due"]);

    // Multipart body carries the extracted fields and the re-uploaded file.
    let bodies = h.partner.bodies("/ok/electricity");
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].contains("10012345678"));
    assert!(bodies[0].contains(&attachment.id.to_string()));
    assert!(bodies[0].contains("%PDF-1.4 electricity bill"));

    let execution = h
        .store
        .get_execution(report.execution_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);
    // parse, electricity condition, action, done
    assert_eq!(execution.visited_steps.len(), 4);
    assert_eq!(
        execution.context["parsed_data"]["mprn"],
        json!("10012345678")
    );
}

#[tokio::test]
async fn repeat_intake_hits_cache_and_dedups_submission() {
    let h = Harness::new(electricity_reply()).await;
    h.install_utility_workflow("ok").await;
    let attachment = h.attachment();

    let first = h.intake.process(request(&attachment, false)).await.unwrap();
    let second = h.intake.process(request(&attachment, false)).await.unwrap();

    assert_eq!(h.vision_calls(), 1);
    assert_eq!(h.partner.count("/ok/electricity"), 1);
    assert_eq!(first.ingestion_key, second.ingestion_key);
    assert_eq!(second.execution_status, Some(ExecutionStatus::Success));
    assert_eq!(second.submissions[0].id, first.submissions[0].id);
    assert_eq!(
        second.submissions[0].submission_status,
        SubmissionStatus::Completed
    );
}

#[tokio::test]
async fn forced_intake_reparses_and_resubmits() {
    let h = Harness::new(electricity_reply()).await;
    h.install_utility_workflow("ok").await;
    let attachment = h.attachment();

    let first = h.intake.process(request(&attachment, false)).await.unwrap();
    let forced = h.intake.process(request(&attachment, true)).await.unwrap();

    assert_eq!(h.vision_calls(), 2);
    assert_eq!(h.partner.count("/ok/electricity"), 2);
    assert_ne!(forced.submissions[0].id, first.submissions[0].id);
}

#[tokio::test]
async fn resent_bill_under_new_attachment_reuses_classification() {
    let h = Harness::new(electricity_reply()).await;
    h.install_utility_workflow("ok").await;
    let original = h.attachment();
    let resent = h.attachment();

    let first = h.intake.process(request(&original, false)).await.unwrap();
    let second = h.intake.process(request(&resent, false)).await.unwrap();

    assert_eq!(h.vision_calls(), 1);
    assert_eq!(first.ingestion_key, second.ingestion_key);
    assert_eq!(second.classification, first.classification);
    assert_eq!(h.partner.count("/ok/electricity"), 1);
    assert_eq!(second.submissions[0].id, first.submissions[0].id);

    let row = h
        .store
        .get_parse_result(resent.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, ParseStatus::Completed);
}

#[tokio::test]
async fn partner_outage_exhausts_retries() {
    let h = Harness::new(electricity_reply()).await;
    h.install_utility_workflow("down").await;
    let attachment = h.attachment();

    let report = h.intake.process(request(&attachment, false)).await.unwrap();
    assert_eq!(report.execution_status, Some(ExecutionStatus::Failure));

    let submission = &report.submissions[0];
    assert_eq!(submission.submission_status, SubmissionStatus::Failed);
    assert_eq!(submission.retry_count, 1);
    assert_eq!(submission.retry_delay_seconds, Some(120));
    assert!(submission.next_retry_at.is_some());
    let id = submission.id;

    // Nothing is due yet.
    let idle = h.sweeper.sweep_once(Utc::now()).await.unwrap();
    assert_eq!(idle.due, 0);

    let second = h
        .sweeper
        .sweep_once(Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!((second.due, second.failed), (1, 1));
    assert_eq!(h.tracker.get(id).await.unwrap().retry_delay_seconds, Some(240));

    let third = h
        .sweeper
        .sweep_once(Utc::now() + chrono::Duration::hours(2))
        .await
        .unwrap();
    assert_eq!((third.due, third.failed), (1, 1));

    let history = h.tracker.history(id).await.unwrap();
    let final_state = &history.submission;
    assert_eq!(final_state.submission_status, SubmissionStatus::Failed);
    assert_eq!(final_state.retry_count, 3);
    assert!(final_state.next_retry_at.is_none());
    assert!(final_state.is_terminal());
    assert_eq!(final_state.http_status, Some(500));
    assert!(
        final_state
            .error_message
            .as_deref()
            .unwrap()
            .contains("partner down")
    );
    assert_eq!(history.attempts.len(), 3);
    assert_eq!(h.partner.count("/down/electricity"), 3);

    // Terminal rows are never picked up again.
    let after = h
        .sweeper
        .sweep_once(Utc::now() + chrono::Duration::days(1))
        .await
        .unwrap();
    assert_eq!(after.due, 0);

    // An exhausted submission no longer blocks a fresh delivery of the same bill.
    let rerun = h.intake.process(request(&attachment, false)).await.unwrap();
    assert_eq!(h.vision_calls(), 1);
    let fresh = &rerun.submissions[0];
    assert_ne!(fresh.id, id);
    assert_eq!(fresh.retry_count, 1);
    assert_eq!(h.partner.count("/down/electricity"), 4);
}

#[tokio::test]
async fn or_clauses_pass_even_when_fields_are_missing() {
    let h = Harness::new(json!({
        "document_type": "gas",
        "confidence": 0.8,
        "fields": { "gprn": "1234567" },
        "field_confidence": { "gprn": 0.9 }
    }))
    .await;

    let workflow_id = Uuid::new_v4();
    let parse = Uuid::new_v4();
    let check = Uuid::new_v4();
    let routed = Uuid::new_v4();
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
    let template = WorkflowTemplate {
        definition: WorkflowDefinition {
            id: workflow_id,
            tenant_id: TENANT.into(),
            name: "or fold".into(),
            trigger_type: TRIGGER_ATTACHMENT_RECEIVED.into(),
            trigger_filters: TriggerFilters::default(),
            is_active: true,
            created_at: Utc::now(),
        },
        steps: vec![
            step(parse, 1, StepKind::Parse, json!({}), Some(check), Some(unrouted)),
            step(
                check,
                2,
                StepKind::Condition,
                json!({ "clauses": [
                    { "field_path": "parsed_data.mprn", "operator": "exists", "logical_operator": "OR" },
                    { "field_path": "parsed_data.dg", "operator": "exists", "logical_operator": "OR" }
                ]}),
                Some(routed),
                Some(unrouted),
            ),
            step(routed, 3, StepKind::End, json!({ "status": "success" }), None, None),
            step(unrouted, 4, StepKind::End, json!({ "status": "failure" }), None, None),
        ],
    };
    h.store.install_workflow(&template).await.unwrap();

    let report = h.intake.process(request(&h.attachment(), false)).await.unwrap();

    assert_eq!(report.workflow_id, Some(workflow_id));
    assert_eq!(report.execution_status, Some(ExecutionStatus::Success));
    let execution = h
        .store
        .get_execution(report.execution_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.visited_steps, vec![parse, check, routed]);
    assert_eq!(
        execution.context["steps"][check.to_string()]["result"],
        json!(true)
    );
}

#[tokio::test]
async fn json_action_posts_rendered_body() {
    let h = Harness::new(electricity_reply()).await;

    let workflow_id = Uuid::new_v4();
    let (parse, send, done, failed) = (
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
    );
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
    let template = WorkflowTemplate {
        definition: WorkflowDefinition {
            id: workflow_id,
            tenant_id: TENANT.into(),
            name: "json partner".into(),
            trigger_type: TRIGGER_ATTACHMENT_RECEIVED.into(),
            trigger_filters: TriggerFilters::default(),
            is_active: true,
            created_at: Utc::now(),
        },
        steps: vec![
            step(parse, 1, StepKind::Parse, json!({}), Some(send), Some(failed)),
            step(
                send,
                2,
                StepKind::ApiAction,
                json!({
                    "url": format!("{}/ok/json", h.base),
                    "format": "json",
                    "body_template": {
                        "reference": "{{attachment.id}}",
                        "mprn": "{{parsed_data.mprn}}",
                        "amount_due": "{{parsed_data.amount_due}}"
                    }
                }),
                Some(done),
                Some(failed),
            ),
            step(done, 3, StepKind::End, json!({ "status": "success" }), None, None),
            step(failed, 4, StepKind::End, json!({ "status": "failure" }), None, None),
        ],
    };
    h.store.install_workflow(&template).await.unwrap();
    let attachment = h.attachment();

    let report = h.intake.process(request(&attachment, false)).await.unwrap();

    assert_eq!(report.execution_status, Some(ExecutionStatus::Success));
    assert_eq!(report.submissions[0].submission_status, SubmissionStatus::Completed);

    let bodies = h.partner.bodies("/ok/json");
    assert_eq!(bodies.len(), 1);
    let sent: Value = serde_json::from_str(&bodies[0]).unwrap();
    assert_eq!(sent["mprn"], json!("10012345678"));
    assert_eq!(sent["reference"], json!(attachment.id.to_string()));
    // No file part on JSON bodies.
    assert!(!bodies[0].contains("%PDF"));

    let executions = h
        .store
        .list_executions_for_attachment(attachment.id)
        .await
        .unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].visited_steps, vec![parse, send, done]);
}

#[tokio::test]
async fn tenant_without_partner_dispatch_skips_action() {
    let h = Harness::new(electricity_reply()).await;
    h.install_utility_workflow("ok").await;
    h.store
        .upsert_tenant(&TenantCapabilities {
            partner_dispatch: false,
            ..TenantCapabilities::defaults_for(TENANT)
        })
        .await
        .unwrap();

    let report = h.intake.process(request(&h.attachment(), false)).await.unwrap();

    assert_eq!(report.execution_status, Some(ExecutionStatus::Failure));
    assert!(report.submissions.is_empty());
    assert_eq!(h.partner.count("/ok/electricity"), 0);
}

#[tokio::test]
async fn invalid_model_output_routes_to_failure_end() {
    let h = Harness::new(json!({ "document_type": "invoice" })).await;
    h.install_utility_workflow("ok").await;

    let report = h.intake.process(request(&h.attachment(), false)).await.unwrap();

    assert_eq!(report.execution_status, Some(ExecutionStatus::Failure));
    assert!(report.classification.is_none());
    assert!(report.submissions.is_empty());
}

#[tokio::test]
async fn tenant_without_workflow_is_classified_only() {
    let h = Harness::new(electricity_reply()).await;

    let report = h.intake.process(request(&h.attachment(), false)).await.unwrap();

    assert!(report.workflow_id.is_none());
    assert!(report.execution_id.is_none());
    assert!(report.classification.is_some());
    assert_eq!(h.vision_calls(), 1);
}

#[tokio::test]
async fn oversize_attachment_is_rejected_before_fetch() {
    let h = Harness::new(electricity_reply()).await;
    h.install_utility_workflow("ok").await;
    let mut attachment = h.attachment();
    attachment.byte_size = 21 * 1024 * 1024;

    let err = h
        .intake
        .process(request(&attachment, false))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Classification(ClassificationError::PayloadTooLarge { .. })
    ));
    assert_eq!(h.vision_calls(), 0);
}

#[tokio::test]
async fn attachment_endpoint_runs_intake_over_http() {
    let h = Harness::new(electricity_reply()).await;
    h.install_utility_workflow("ok").await;
    let attachment = h.attachment();

    let app = api_routes(ApiState {
        store: Arc::clone(&h.store),
        intake: Arc::clone(&h.intake),
        tracker: Arc::clone(&h.tracker),
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://127.0.0.1:{port}/api/attachments"))
        .json(&json!({
            "tenant_id": TENANT,
            "customer": { "email": "jane.doe@example.com" },
            "attachment": attachment,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["execution_status"], "success");

    let submission_id = body["submissions"][0]["id"].as_str().unwrap();
    let history: Value = client
        .get(format!(
            "http://127.0.0.1:{port}/api/submissions/{submission_id}"
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["submission"]["submission_status"], "completed");
    assert_eq!(history["attempts"].as_array().unwrap().len(), 1);

    let parse: Value = client
        .get(format!(
            "http://127.0.0.1:{port}/api/attachments/{}/parse-result",
            attachment.id
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(parse["status"], "completed");
}
