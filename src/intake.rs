//! Intake entry point for one received attachment.
//!
//! Resolves the tenant, derives content identity, fetches the file and hands
//! it to the tenant's first matching workflow. Tenants without a workflow
//! still get the attachment classified.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::attachment::Attachment;
use crate::classify::classifier::{Classifier, ClassifyRequest};
use crate::classify::types::ClassificationResult;
use crate::error::Result;
use crate::fetch::FileFetcher;
use crate::hashing::{ContentHasher, CustomerIdentity};
use crate::store::Database;
use crate::submission::model::Submission;
use crate::tenant::TenantCapabilities;
use crate::workflow::engine::{ExecutionRequest, WorkflowEngine};
use crate::workflow::execution::ExecutionStatus;
use crate::workflow::model::TRIGGER_ATTACHMENT_RECEIVED;

/// One attachment to process.
#[derive(Debug, Clone, Deserialize)]
pub struct IntakeRequest {
    pub tenant_id: String,
    pub customer: CustomerIdentity,
    pub attachment: Attachment,
    /// Re-parse and re-dispatch even if already done.
    #[serde(default)]
    pub force: bool,
}

/// What intake did with an attachment.
#[derive(Debug, Clone, Serialize)]
pub struct IntakeReport {
    pub attachment_id: Uuid,
    pub customer_key: String,
    pub file_sha256: String,
    pub ingestion_key: String,
    pub workflow_id: Option<Uuid>,
    pub execution_id: Option<Uuid>,
    pub execution_status: Option<ExecutionStatus>,
    pub classification: Option<ClassificationResult>,
    pub submissions: Vec<Submission>,
}

pub struct IntakeService {
    store: Arc<dyn Database>,
    hasher: ContentHasher,
    fetcher: FileFetcher,
    classifier: Arc<Classifier>,
    engine: Arc<WorkflowEngine>,
}

impl IntakeService {
    pub fn new(
        store: Arc<dyn Database>,
        hasher: ContentHasher,
        fetcher: FileFetcher,
        classifier: Arc<Classifier>,
        engine: Arc<WorkflowEngine>,
    ) -> Self {
        Self {
            store,
            hasher,
            fetcher,
            classifier,
            engine,
        }
    }

    /// Stored capabilities, or defaults for an unknown tenant.
    pub async fn resolve_tenant(&self, tenant_id: &str) -> Result<TenantCapabilities> {
        Ok(self
            .store
            .get_tenant(tenant_id)
            .await?
            .unwrap_or_else(|| TenantCapabilities::defaults_for(tenant_id)))
    }

    pub async fn process(&self, request: IntakeRequest) -> Result<IntakeReport> {
        let attachment = &request.attachment;
        let tenant = self.resolve_tenant(&request.tenant_id).await?;
        let customer_key = self.hasher.hash_customer(&request.customer)?;

        self.classifier.check_declared_size(attachment).await?;
        let file = self.fetcher.fetch(&attachment.url).await?;
        let identity = self.hasher.hash_ingestion(&customer_key, &file.bytes);

        info!(
            attachment_id = %attachment.id,
            tenant = %tenant.tenant_id,
            ingestion_key = %identity.ingestion_key,
            bytes = file.bytes.len(),
            "Attachment received"
        );

        let workflow = self
            .store
            .list_active_workflows(&tenant.tenant_id, TRIGGER_ATTACHMENT_RECEIVED)
            .await?
            .into_iter()
            .find(|w| w.trigger_filters.matches(&attachment.media_type));

        let mut report = IntakeReport {
            attachment_id: attachment.id,
            customer_key: customer_key.to_string(),
            file_sha256: identity.file_sha256.clone(),
            ingestion_key: identity.ingestion_key.to_string(),
            workflow_id: None,
            execution_id: None,
            execution_status: None,
            classification: None,
            submissions: Vec::new(),
        };

        match workflow {
            Some(workflow) => {
                let executed = self
                    .engine
                    .run(ExecutionRequest {
                        workflow: &workflow,
                        attachment,
                        file_bytes: &file.bytes,
                        identity: &identity,
                        tenant: &tenant,
                        force: request.force,
                    })
                    .await?;
                report.workflow_id = Some(workflow.id);
                report.execution_id = Some(executed.execution.id);
                report.execution_status = Some(executed.execution.status);
                report.classification = executed.classification;
                report.submissions = executed.submissions;
            }
            None => {
                info!(
                    attachment_id = %attachment.id,
                    tenant = %tenant.tenant_id,
                    "No active workflow, classifying only"
                );
                let classification = self
                    .classifier
                    .classify(ClassifyRequest {
                        attachment,
                        file_bytes: &file.bytes,
                        identity: Some(&identity),
                        force_reparse: request.force,
                    })
                    .await?;
                report.classification = Some(classification);
            }
        }

        Ok(report)
    }
}
