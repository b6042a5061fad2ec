//! Walks a tenant's step graph for one attachment.
//!
//! Flow:
//! 1. Load steps, build and validate the graph
//! 2. Seed context with `attachment` and `tenant`
//! 3. Execute one step at a time, following success/failure edges
//! 4. Persist the execution with its path and final context
//!
//! Execution is strictly sequential. Entering a step twice is a cycle.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::attachment::Attachment;
use crate::classify::classifier::{Classifier, ClassifyRequest};
use crate::classify::types::ClassificationResult;
use crate::dispatch::dispatcher::Dispatcher;
use crate::error::{ClassificationError, WorkflowError};
use crate::hashing::FileIdentity;
use crate::store::Database;
use crate::submission::model::{DispatchTarget, NewSubmission, Submission, SubmissionStatus};
use crate::submission::tracker::DedupOutcome;
use crate::tenant::TenantCapabilities;
use crate::workflow::condition;
use crate::workflow::context::{ATTACHMENT_KEY, ExecutionContext, PARSED_DATA_KEY, TENANT_KEY};
use crate::workflow::execution::{ExecutionStatus, WorkflowExecution};
use crate::workflow::graph::{Node, Step, WorkflowGraph};
use crate::workflow::model::{ActionConfig, WorkflowDefinition};
use crate::workflow::template::{render_str, render_value};

/// Inputs for one workflow run.
pub struct ExecutionRequest<'a> {
    pub workflow: &'a WorkflowDefinition,
    pub attachment: &'a Attachment,
    pub file_bytes: &'a [u8],
    pub identity: &'a FileIdentity,
    pub tenant: &'a TenantCapabilities,
    /// Re-parse and re-dispatch even if earlier runs completed.
    pub force: bool,
}

/// Outcome of a finished run.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub execution: WorkflowExecution,
    pub classification: Option<ClassificationResult>,
    /// Submissions created or matched by api_action steps, in visit order.
    pub submissions: Vec<Submission>,
}

/// Which edge the walk last followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Success,
    Failure,
}

/// Mutable state of one walk.
struct RunState {
    ctx: ExecutionContext,
    execution: WorkflowExecution,
    classification: Option<ClassificationResult>,
    submissions: Vec<Submission>,
}

pub struct WorkflowEngine {
    store: Arc<dyn Database>,
    classifier: Arc<Classifier>,
    dispatcher: Arc<Dispatcher>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn Database>,
        classifier: Arc<Classifier>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            store,
            classifier,
            dispatcher,
        }
    }

    /// Run `request.workflow` to an end step.
    ///
    /// Structural problems (invalid graph, cycle, parse failure with no
    /// failure end) abort the run; the aborted execution is still persisted.
    pub async fn run(
        &self,
        request: ExecutionRequest<'_>,
    ) -> Result<ExecutionReport, WorkflowError> {
        let workflow_id = request.workflow.id;
        let mut state = RunState {
            ctx: ExecutionContext::new(),
            execution: WorkflowExecution::start(
                workflow_id,
                request.attachment.id,
                request.identity.ingestion_key.as_str(),
            ),
            classification: None,
            submissions: Vec::new(),
        };
        self.store.insert_execution(&state.execution).await?;

        info!(
            execution_id = %state.execution.id,
            %workflow_id,
            attachment_id = %request.attachment.id,
            tenant = %request.tenant.tenant_id,
            "Workflow execution started"
        );

        let outcome = self.walk(&request, &mut state).await;

        state.execution.context = state.ctx.to_value();
        state.execution.finished_at = Some(Utc::now());
        match &outcome {
            Ok(status) => state.execution.status = *status,
            Err(e) => {
                state.execution.status = ExecutionStatus::Aborted;
                state.execution.error = Some(e.to_string());
            }
        }
        self.store.finish_execution(&state.execution).await?;

        match outcome {
            Ok(status) => {
                info!(
                    execution_id = %state.execution.id,
                    status = status.as_str(),
                    steps = state.execution.visited_steps.len(),
                    "Workflow execution finished"
                );
                Ok(ExecutionReport {
                    execution: state.execution,
                    classification: state.classification,
                    submissions: state.submissions,
                })
            }
            Err(e) => {
                warn!(execution_id = %state.execution.id, error = %e, "Workflow execution aborted");
                Err(e)
            }
        }
    }

    async fn walk(
        &self,
        request: &ExecutionRequest<'_>,
        state: &mut RunState,
    ) -> Result<ExecutionStatus, WorkflowError> {
        let workflow_id = request.workflow.id;
        let rows = self.store.list_workflow_steps(workflow_id).await?;
        let graph = WorkflowGraph::build(workflow_id, &rows)?;

        state.ctx.insert(
            ATTACHMENT_KEY,
            serde_json::to_value(request.attachment)
                .map_err(|e| WorkflowError::Config(format!("attachment: {e}")))?,
        )?;
        state.ctx.insert(
            TENANT_KEY,
            serde_json::to_value(request.tenant)
                .map_err(|e| WorkflowError::Config(format!("tenant: {e}")))?,
        )?;

        let mut visited = HashSet::new();
        let mut current = Some(graph.entry());
        let mut last_edge = Edge::Success;

        while let Some(index) = current {
            let node = graph.node(index);
            if !visited.insert(index) {
                return Err(WorkflowError::Cycle {
                    workflow_id,
                    step_id: node.id,
                });
            }
            state.execution.visited_steps.push(node.id);

            if !node.enabled {
                debug!(step_id = %node.id, "Skipping disabled step");
                current = node.on_success;
                last_edge = Edge::Success;
                continue;
            }

            let edge = match &node.step {
                Step::End(status) => {
                    debug!(step_id = %node.id, status = ?status, "Reached end step");
                    return Ok((*status).into());
                }
                Step::Parse => match self.run_parse(request, node, state).await? {
                    Ok(()) => Edge::Success,
                    Err(e) => match graph.nearest_failure_end(index) {
                        Some(end) => {
                            warn!(step_id = %node.id, error = %e, "Parse failed, routing to failure end");
                            current = Some(end);
                            last_edge = Edge::Failure;
                            continue;
                        }
                        None => return Err(WorkflowError::ParseAborted(e)),
                    },
                },
                Step::Condition(config) => {
                    let result = condition::evaluate(config, &state.ctx);
                    debug!(step_id = %node.id, result, "Condition evaluated");
                    state.ctx.record_step(node.id, json!({ "result": result }))?;
                    if result { Edge::Success } else { Edge::Failure }
                }
                Step::Action(config) => self.run_action(request, node, config, state).await?,
            };

            last_edge = edge;
            current = match edge {
                Edge::Success => node.on_success,
                Edge::Failure => node.on_failure,
            };
        }

        // Walked off a missing edge.
        Ok(match last_edge {
            Edge::Success => ExecutionStatus::Success,
            Edge::Failure => ExecutionStatus::Failure,
        })
    }

    /// Classify the attachment. The inner error is a parse failure the
    /// caller routes; the outer one aborts the run.
    async fn run_parse(
        &self,
        request: &ExecutionRequest<'_>,
        node: &Node,
        state: &mut RunState,
    ) -> Result<Result<(), ClassificationError>, WorkflowError> {
        let result = self
            .classifier
            .classify(ClassifyRequest {
                attachment: request.attachment,
                file_bytes: request.file_bytes,
                identity: Some(request.identity),
                force_reparse: request.force,
            })
            .await;

        match result {
            Ok(classification) => {
                state
                    .ctx
                    .insert(PARSED_DATA_KEY, classification.to_context_value())?;
                state.classification = Some(classification);
                Ok(Ok(()))
            }
            Err(e) => {
                state
                    .ctx
                    .record_step(node.id, json!({ "error": e.to_string() }))?;
                Ok(Err(e))
            }
        }
    }

    async fn run_action(
        &self,
        request: &ExecutionRequest<'_>,
        node: &Node,
        config: &ActionConfig,
        state: &mut RunState,
    ) -> Result<Edge, WorkflowError> {
        let Some(classification) = state.classification.as_ref() else {
            return Err(WorkflowError::Config(format!(
                "api_action step {} runs before any parse step",
                node.id
            )));
        };
        let document_type = classification.document_type;

        if !request.tenant.partner_dispatch {
            info!(step_id = %node.id, tenant = %request.tenant.tenant_id, "Partner dispatch disabled for tenant");
            state.ctx.record_step(
                node.id,
                json!({ "skipped": "partner dispatch disabled for tenant" }),
            )?;
            return Ok(Edge::Failure);
        }

        let target = render_target(request.attachment, config, &state.ctx);
        let body = render_value(&config.body_template, &state.ctx);
        let Value::Object(mut fields) = body else {
            return Err(WorkflowError::Config(format!(
                "api_action step {} body_template must render to an object",
                node.id
            )));
        };
        if fields.is_empty() {
            fields = classification.field_values();
        }

        let tracker = self.dispatcher.tracker();
        let ingestion_key = request.identity.ingestion_key.as_str();

        let new = NewSubmission {
            ingestion_key: ingestion_key.to_string(),
            attachment_id: request.attachment.id,
            workflow_id: Some(request.workflow.id),
            step_id: Some(node.id),
            document_type,
            target,
            extracted_fields: fields,
            max_retries: request.tenant.max_retries,
        };
        let submission = if request.force {
            tracker.create(new).await?
        } else {
            match tracker.create_unless_duplicate(new).await? {
                DedupOutcome::Created(submission) => submission,
                DedupOutcome::Existing(existing) => {
                    let completed = existing.submission_status == SubmissionStatus::Completed;
                    info!(
                        step_id = %node.id,
                        submission_id = %existing.id,
                        status = %existing.submission_status,
                        "Submission already exists for this document and target"
                    );
                    state.ctx.record_step(
                        node.id,
                        json!({
                            "submission_id": existing.id,
                            "status": existing.submission_status,
                            "http_status": existing.http_status,
                            "deduplicated": true,
                        }),
                    )?;
                    state.submissions.push(existing);
                    return Ok(if completed { Edge::Success } else { Edge::Failure });
                }
            }
        };

        let report = self.dispatcher.submit(submission.id).await?;
        let succeeded = report.succeeded();
        state.ctx.record_step(
            node.id,
            json!({
                "submission_id": report.submission.id,
                "status": report.submission.submission_status,
                "http_status": report.submission.http_status,
                "error": report.error,
            }),
        )?;
        state.submissions.push(report.submission);

        Ok(if succeeded { Edge::Success } else { Edge::Failure })
    }
}

/// Render method, url and headers, and decide the file part.
fn render_target(
    attachment: &Attachment,
    config: &ActionConfig,
    ctx: &ExecutionContext,
) -> DispatchTarget {
    let headers: BTreeMap<String, String> = config
        .headers
        .iter()
        .map(|(name, value)| (name.clone(), render_str(value, ctx)))
        .collect();
    let attach = config.attaches_file();

    DispatchTarget {
        method: render_str(&config.method, ctx),
        url: render_str(&config.url, ctx),
        headers,
        format: config.format,
        file_url: attach.then(|| attachment.url.clone()),
        file_media_type: attach.then(|| attachment.media_type.clone()),
    }
}
