//! Turns file bytes into a cached, validated `ClassificationResult`.
//!
//! Flow:
//! 1. Cache lookup (completed → return, failed → error) unless forced
//! 2. Size and media type checks, before any network call
//! 3. Conditional `→ processing` write; losers poll the row instead
//! 4. Reuse a completed result for the same ingestion key, if any
//! 5. Model call under a timeout, schema validation, persist outcome

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::attachment::Attachment;
use crate::classify::model::{SUPPORTED_MEDIA_TYPES, VisionModel, VisionRequest};
use crate::classify::schema::ExtractionSchema;
use crate::classify::types::{ClassificationResult, ParseStatus};
use crate::config::ClassifierConfig;
use crate::error::ClassificationError;
use crate::hashing::FileIdentity;
use crate::store::Database;

/// One classification request.
pub struct ClassifyRequest<'a> {
    pub attachment: &'a Attachment,
    pub file_bytes: &'a [u8],
    /// Content identity recorded on the ParseResult when known.
    pub identity: Option<&'a FileIdentity>,
    /// Ignore a cached result and call the model again.
    pub force_reparse: bool,
}

pub struct Classifier {
    store: Arc<dyn Database>,
    model: Arc<dyn VisionModel>,
    schema: ExtractionSchema,
    config: ClassifierConfig,
}

impl Classifier {
    pub fn new(
        store: Arc<dyn Database>,
        model: Arc<dyn VisionModel>,
        schema: ExtractionSchema,
        config: ClassifierConfig,
    ) -> Self {
        Self {
            store,
            model,
            schema,
            config,
        }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Reject a file by declared size before downloading it.
    pub fn ensure_within_limit(&self, size: u64) -> Result<(), ClassificationError> {
        if size > self.config.max_file_bytes {
            return Err(ClassificationError::PayloadTooLarge {
                size,
                limit: self.config.max_file_bytes,
            });
        }
        Ok(())
    }

    /// Check the attachment's declared size and record a failed ParseResult
    /// when it is over the limit.
    pub async fn check_declared_size(
        &self,
        attachment: &Attachment,
    ) -> Result<(), ClassificationError> {
        if let Err(e) = self.ensure_within_limit(attachment.byte_size) {
            warn!(attachment_id = %attachment.id, error = %e, "Attachment too large to fetch");
            self.store
                .ensure_parse_result(attachment.id, None, None)
                .await?;
            self.store
                .fail_parse_result(attachment.id, &e.to_string())
                .await?;
            return Err(e);
        }
        Ok(())
    }

    /// Classify an attachment, reusing a completed result when one exists.
    pub async fn classify(
        &self,
        request: ClassifyRequest<'_>,
    ) -> Result<ClassificationResult, ClassificationError> {
        let attachment_id = request.attachment.id;

        if !request.force_reparse
            && let Some(existing) = self.store.get_parse_result(attachment_id).await?
        {
            match existing.status {
                ParseStatus::Completed => {
                    if let Some(cached) = existing.classification() {
                        debug!(%attachment_id, "Returning cached classification");
                        return Ok(cached);
                    }
                }
                ParseStatus::Failed => {
                    return Err(ClassificationError::PreviouslyFailed {
                        attachment_id,
                        reason: existing.error.unwrap_or_default(),
                    });
                }
                ParseStatus::Pending | ParseStatus::Processing => {}
            }
        }

        self.store
            .ensure_parse_result(
                attachment_id,
                request.identity.map(|i| i.file_sha256.as_str()),
                request.identity.map(|i| i.ingestion_key.as_str()),
            )
            .await?;

        let size = request.file_bytes.len() as u64;
        let media_type = request.attachment.media_type.to_ascii_lowercase();
        let precheck = self
            .ensure_within_limit(size.max(request.attachment.byte_size))
            .and_then(|()| {
                if SUPPORTED_MEDIA_TYPES.contains(&media_type.as_str()) {
                    Ok(())
                } else {
                    Err(ClassificationError::UnsupportedMediaType(media_type.clone()))
                }
            });
        if let Err(e) = precheck {
            warn!(%attachment_id, error = %e, "Rejecting attachment before model call");
            self.store
                .fail_parse_result(attachment_id, &e.to_string())
                .await?;
            return Err(e);
        }

        let claimable: &[ParseStatus] = if request.force_reparse {
            &[ParseStatus::Pending, ParseStatus::Failed, ParseStatus::Completed]
        } else {
            &[ParseStatus::Pending]
        };
        if !self
            .store
            .claim_parse_result(attachment_id, claimable)
            .await?
        {
            return self.wait_for_other(attachment_id).await;
        }

        // Same bytes from the same customer under a new attachment id.
        if !request.force_reparse
            && let Some(identity) = request.identity
            && let Some(prior) = self
                .store
                .find_completed_parse_by_ingestion(identity.ingestion_key.as_str())
                .await?
            && let Some(cached) = prior.classification()
        {
            info!(
                %attachment_id,
                source_attachment = %prior.attachment_id,
                "Reusing classification for identical content"
            );
            let model = prior.model.as_deref().unwrap_or(self.model.model_name());
            return self.finish(attachment_id, model, cached).await;
        }

        info!(
            %attachment_id,
            media_type = %media_type,
            bytes = size,
            model = self.model.model_name(),
            "Classifying attachment"
        );

        match self.call_model(request.file_bytes, &media_type).await {
            Ok(result) => {
                info!(
                    %attachment_id,
                    document_type = %result.document_type,
                    confidence = result.confidence,
                    fields = result.fields.len(),
                    low_confidence = result.low_confidence_fields.len(),
                    "Classification complete"
                );
                self.finish(attachment_id, self.model.model_name(), result)
                    .await
            }
            Err(e) => {
                warn!(%attachment_id, error = %e, "Classification failed");
                self.store
                    .fail_parse_result(attachment_id, &e.to_string())
                    .await?;
                Err(e)
            }
        }
    }

    /// Store the result on the held row. If the row moved on while we held
    /// it, the stored outcome wins over ours.
    async fn finish(
        &self,
        attachment_id: uuid::Uuid,
        model: &str,
        result: ClassificationResult,
    ) -> Result<ClassificationResult, ClassificationError> {
        let stored = self
            .store
            .complete_parse_result(attachment_id, model, &result)
            .await?;
        if !stored {
            warn!(%attachment_id, "Parse row changed while held, using stored outcome");
            return self.wait_for_other(attachment_id).await;
        }
        Ok(result)
    }

    async fn call_model(
        &self,
        file_bytes: &[u8],
        media_type: &str,
    ) -> Result<ClassificationResult, ClassificationError> {
        let request = VisionRequest {
            file_bytes,
            media_type,
            schema: &self.schema,
        };
        let timeout = self.config.request_timeout;
        let raw = tokio::time::timeout(timeout, self.model.extract(request))
            .await
            .map_err(|_| ClassificationError::Timeout { timeout })??;

        self.schema
            .validate(&raw, self.config.low_confidence_threshold)
    }

    /// Another invocation holds the row; poll until it settles.
    async fn wait_for_other(
        &self,
        attachment_id: uuid::Uuid,
    ) -> Result<ClassificationResult, ClassificationError> {
        debug!(%attachment_id, "Parse in progress elsewhere, waiting");
        let deadline = Instant::now() + self.config.lock_wait_timeout;

        loop {
            if let Some(row) = self.store.get_parse_result(attachment_id).await? {
                match row.status {
                    ParseStatus::Completed => {
                        if let Some(result) = row.classification() {
                            return Ok(result);
                        }
                    }
                    ParseStatus::Failed => {
                        return Err(ClassificationError::PreviouslyFailed {
                            attachment_id,
                            reason: row.error.unwrap_or_default(),
                        });
                    }
                    ParseStatus::Pending | ParseStatus::Processing => {}
                }
            }

            if Instant::now() >= deadline {
                return Err(ClassificationError::InFlight { attachment_id });
            }
            tokio::time::sleep(self.config.lock_poll_interval).await;
        }
    }
}
