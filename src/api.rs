//! REST endpoints for enqueueing attachments and reading back status.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{ClassificationError, Error, TrackerError, WorkflowError};
use crate::intake::{IntakeRequest, IntakeService};
use crate::store::Database;
use crate::submission::tracker::SubmissionTracker;
use crate::workflow::graph::WorkflowGraph;
use crate::workflow::model::WorkflowTemplate;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn Database>,
    pub intake: Arc<IntakeService>,
    pub tracker: Arc<SubmissionTracker>,
}

/// Build the Axum router.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/attachments", post(process_attachment))
        .route("/api/attachments/{id}/parse-result", get(get_parse_result))
        .route("/api/attachments/{id}/executions", get(list_executions))
        .route("/api/submissions/{id}", get(get_submission))
        .route("/api/submissions/{id}/override", post(set_override))
        .route("/api/workflows", post(install_workflow))
        .route("/api/executions/{id}", get(get_execution))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

type ApiResponse = (StatusCode, Json<Value>);

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> ApiResponse {
    (status, Json(json!({ "error": message.to_string() })))
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid, ApiResponse> {
    Uuid::parse_str(raw)
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, format!("Invalid {what} ID")))
}

/// HTTP status for an intake failure.
fn intake_status(e: &Error) -> StatusCode {
    match e {
        Error::Hash(_) => StatusCode::BAD_REQUEST,
        Error::Fetch(_) => StatusCode::BAD_GATEWAY,
        Error::Classification(c) | Error::Workflow(WorkflowError::ParseAborted(c)) => match c {
            ClassificationError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ClassificationError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ClassificationError::InFlight { .. } => StatusCode::CONFLICT,
            ClassificationError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        },
        Error::Workflow(WorkflowError::Config(_) | WorkflowError::Cycle { .. }) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn tracker_status(e: &TrackerError) -> StatusCode {
    match e {
        TrackerError::NotFound(_) => StatusCode::NOT_FOUND,
        TrackerError::InvalidTransition { .. } | TrackerError::DedupContention { .. } => {
            StatusCode::CONFLICT
        }
        TrackerError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "doc-intake"
    }))
}

// ── Attachments ─────────────────────────────────────────────────────────

async fn process_attachment(
    State(state): State<ApiState>,
    Json(request): Json<IntakeRequest>,
) -> impl IntoResponse {
    let attachment_id = request.attachment.id;
    match state.intake.process(request).await {
        Ok(report) => (StatusCode::OK, Json(json!(report))),
        Err(e) => {
            let status = intake_status(&e);
            if status.is_server_error() {
                error!(%attachment_id, error = %e, "Intake failed");
            }
            error_response(status, e)
        }
    }
}

async fn get_parse_result(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let id = match parse_id(&id, "attachment") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.store.get_parse_result(id).await {
        Ok(Some(result)) => (StatusCode::OK, Json(json!(result))),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Parse result not found"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

// ── Submissions ─────────────────────────────────────────────────────────

async fn get_submission(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let id = match parse_id(&id, "submission") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.tracker.history(id).await {
        Ok(history) => (StatusCode::OK, Json(json!(history))),
        Err(e) => error_response(tracker_status(&e), e),
    }
}

#[derive(Debug, Deserialize)]
struct OverrideRequest {
    payload: Map<String, Value>,
}

async fn set_override(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<OverrideRequest>,
) -> impl IntoResponse {
    let id = match parse_id(&id, "submission") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.tracker.set_override(id, body.payload).await {
        Ok(submission) => (StatusCode::OK, Json(json!(submission))),
        Err(e) => error_response(tracker_status(&e), e),
    }
}

// ── Workflows ───────────────────────────────────────────────────────────

async fn install_workflow(
    State(state): State<ApiState>,
    Json(mut template): Json<WorkflowTemplate>,
) -> impl IntoResponse {
    let workflow_id = template.definition.id;
    for step in &mut template.steps {
        step.workflow_id = workflow_id;
    }

    if let Err(e) = WorkflowGraph::build(workflow_id, &template.steps) {
        return error_response(StatusCode::BAD_REQUEST, e);
    }

    match state.store.install_workflow(&template).await {
        Ok(()) => {
            info!(%workflow_id, tenant = %template.definition.tenant_id, "Workflow installed via API");
            (
                StatusCode::CREATED,
                Json(json!({ "id": workflow_id, "steps": template.steps.len() })),
            )
        }
        Err(e) => error_response(StatusCode::CONFLICT, e),
    }
}

async fn get_execution(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let id = match parse_id(&id, "execution") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.store.get_execution(id).await {
        Ok(Some(execution)) => (StatusCode::OK, Json(json!(execution))),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Execution not found"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn list_executions(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let id = match parse_id(&id, "attachment") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.store.list_executions_for_attachment(id).await {
        Ok(executions) => (
            StatusCode::OK,
            Json(json!({ "attachment_id": id, "executions": executions })),
        ),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::classify::{Classifier, ExtractionSchema, VisionModel, VisionRequest};
    use crate::config::{ClassifierConfig, DispatchConfig};
    use crate::dispatch::Dispatcher;
    use crate::error::ClassificationError;
    use crate::fetch::FileFetcher;
    use crate::hashing::ContentHasher;
    use crate::store::LibSqlBackend;
    use crate::workflow::WorkflowEngine;
    use crate::workflow::templates::utility_bill_template;

    struct NoVision;

    #[async_trait::async_trait]
    impl VisionModel for NoVision {
        fn model_name(&self) -> &str {
            "none"
        }

        async fn extract(&self, _request: VisionRequest<'_>) -> Result<Value, ClassificationError> {
            Err(ClassificationError::ModelRequest {
                model: "none".into(),
                reason: "not used".into(),
            })
        }
    }

    async fn app() -> Router {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let classifier = Arc::new(Classifier::new(
            Arc::clone(&store),
            Arc::new(NoVision),
            ExtractionSchema::default(),
            ClassifierConfig::default(),
        ));
        let tracker = Arc::new(SubmissionTracker::new(Arc::clone(&store)));
        let dispatcher =
            Arc::new(Dispatcher::new(&DispatchConfig::default(), Arc::clone(&tracker)).unwrap());
        let engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&store),
            Arc::clone(&classifier),
            dispatcher,
        ));
        let intake = Arc::new(IntakeService::new(
            Arc::clone(&store),
            ContentHasher::new("353"),
            FileFetcher::new(std::time::Duration::from_secs(1)).unwrap(),
            classifier,
            engine,
        ));
        api_routes(ApiState {
            store,
            intake,
            tracker,
        })
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_service() {
        let app = app().await;
        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "doc-intake");
    }

    #[tokio::test]
    async fn malformed_ids_are_rejected() {
        let app = app().await;
        let (status, body) = send(&app, get("/api/submissions/not-a-uuid")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid submission ID");

        let (status, _) = send(&app, get("/api/executions/42")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_rows_are_not_found() {
        let app = app().await;
        let id = Uuid::new_v4();

        let (status, _) = send(&app, get(&format!("/api/attachments/{id}/parse-result"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, get(&format!("/api/submissions/{id}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, get(&format!("/api/executions/{id}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &app,
            post_json(
                &format!("/api/submissions/{id}/override"),
                &json!({ "payload": { "mprn": "1" } }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn execution_list_is_empty_for_new_attachment() {
        let app = app().await;
        let id = Uuid::new_v4();
        let (status, body) = send(&app, get(&format!("/api/attachments/{id}/executions"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["attachment_id"], json!(id));
        assert_eq!(body["executions"], json!([]));

        let (status, _) = send(&app, get("/api/attachments/nope/executions")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn workflow_install_validates_graph() {
        let app = app().await;
        let template = utility_bill_template("acme", "https://partner.example");
        let (status, body) =
            send(&app, post_json("/api/workflows", &json!(template))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["steps"], 10);

        let mut broken = utility_bill_template("acme", "https://partner.example");
        broken.steps[0].next_on_success = Some(Uuid::new_v4());
        let (status, body) = send(&app, post_json("/api/workflows", &json!(broken))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("configuration"));
    }

    #[tokio::test]
    async fn intake_without_identity_is_bad_request() {
        let app = app().await;
        let body = json!({
            "tenant_id": "acme",
            "customer": {},
            "attachment": {
                "id": Uuid::new_v4(),
                "url": "http://127.0.0.1:9/bill.pdf",
                "media_type": "application/pdf",
                "byte_size": 10
            }
        });
        let (status, _) = send(&app, post_json("/api/attachments", &body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
