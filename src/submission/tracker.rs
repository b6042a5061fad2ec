//! Owns every status change on a Submission row.
//!
//! Transitions are validated against `SubmissionStatus::can_transition_to`
//! and written as compare-and-swap on the stored status, so two workers
//! can never both move the same row.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::retry::{self, RetryDecision};
use crate::error::TrackerError;
use crate::store::Database;
use crate::submission::model::{
    NewSubmission, Submission, SubmissionAttempt, SubmissionHistory, SubmissionStatus,
};

/// An attempt that has been started and must be finished.
#[derive(Debug, Clone)]
pub struct AttemptTicket {
    pub submission: Submission,
    pub attempt: SubmissionAttempt,
    /// Fields to send: the override if one is set, else the extracted fields.
    pub payload: Map<String, Value>,
}

/// How an attempt failed.
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub http_status: Option<u16>,
    pub response_body: Option<String>,
    pub error: String,
    /// False for structural errors, which are never rescheduled.
    pub retryable: bool,
}

/// Result of [`SubmissionTracker::create_unless_duplicate`].
#[derive(Debug, Clone)]
pub enum DedupOutcome {
    Created(Submission),
    /// A live or completed submission already holds the dedup key.
    Existing(Submission),
}

const DEDUP_ATTEMPTS: usize = 3;

pub struct SubmissionTracker {
    store: Arc<dyn Database>,
}

impl SubmissionTracker {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    pub async fn create(&self, new: NewSubmission) -> Result<Submission, TrackerError> {
        let submission = Submission::new(new);
        self.store.insert_submission(&submission).await?;
        info!(
            id = %submission.id,
            document_type = %submission.document_type,
            url = %submission.target.url,
            "Submission created"
        );
        Ok(submission)
    }

    pub async fn get(&self, id: Uuid) -> Result<Submission, TrackerError> {
        self.store
            .get_submission(id)
            .await?
            .ok_or(TrackerError::NotFound(id))
    }

    /// Create the submission unless a live or completed one already holds
    /// its dedup key. The check and the insert are one statement, so two
    /// concurrent runs for the same document cannot both create a row.
    pub async fn create_unless_duplicate(
        &self,
        new: NewSubmission,
    ) -> Result<DedupOutcome, TrackerError> {
        let submission = Submission::new(new);
        let url = submission.target.url.clone();

        for _ in 0..DEDUP_ATTEMPTS {
            if self.store.insert_submission_unless_live(&submission).await? {
                info!(
                    id = %submission.id,
                    document_type = %submission.document_type,
                    url = %url,
                    "Submission created"
                );
                return Ok(DedupOutcome::Created(submission));
            }

            // The blocking row can turn terminal between the insert and this read.
            if let Some(existing) = self
                .store
                .find_submission(
                    &submission.ingestion_key,
                    submission.document_type.as_str(),
                    &url,
                )
                .await?
            {
                debug!(id = %existing.id, status = %existing.submission_status, "Dedup hit");
                return Ok(DedupOutcome::Existing(existing));
            }
        }

        Err(TrackerError::DedupContention {
            ingestion_key: submission.ingestion_key,
            url,
        })
    }

    /// Move to `submitting` and open an attempt row.
    pub async fn begin_attempt(&self, id: Uuid) -> Result<AttemptTicket, TrackerError> {
        let mut submission = self.get(id).await?;
        let from = submission.submission_status;
        self.transition(&mut submission, SubmissionStatus::Submitting)?;
        self.write(&submission, from).await?;

        let attempt_number = self.store.list_attempts(id).await?.len() as u32 + 1;
        let used_override = submission.manual_payload_override.is_some();
        let attempt = SubmissionAttempt {
            id: Uuid::new_v4(),
            submission_id: id,
            attempt_number,
            started_at: Utc::now(),
            finished_at: None,
            http_status: None,
            error: None,
            used_override,
        };
        self.store.insert_attempt(&attempt).await?;

        let payload = submission
            .manual_payload_override
            .clone()
            .unwrap_or_else(|| submission.extracted_fields.clone());

        debug!(%id, attempt_number, used_override, "Attempt started");
        Ok(AttemptTicket {
            submission,
            attempt,
            payload,
        })
    }

    /// Partner accepted the submission. Terminal.
    pub async fn record_success(
        &self,
        ticket: AttemptTicket,
        http_status: u16,
        response_body: String,
    ) -> Result<Submission, TrackerError> {
        let AttemptTicket {
            mut submission,
            mut attempt,
            ..
        } = ticket;

        self.transition(&mut submission, SubmissionStatus::Completed)?;
        submission.http_status = Some(http_status);
        submission.partner_response = Some(response_body);
        submission.error_message = None;
        submission.next_retry_at = None;
        submission.retry_delay_seconds = None;
        submission.manual_payload_override = None;
        self.write(&submission, SubmissionStatus::Submitting).await?;

        attempt.finished_at = Some(Utc::now());
        attempt.http_status = Some(http_status);
        self.store.finish_attempt(&attempt).await?;

        info!(id = %submission.id, http_status, "Submission completed");
        Ok(submission)
    }

    /// Attempt failed: bump `retry_count` and schedule the next attempt or
    /// give up. The override is spent either way.
    pub async fn record_failure(
        &self,
        ticket: AttemptTicket,
        failure: AttemptFailure,
        now: DateTime<Utc>,
    ) -> Result<Submission, TrackerError> {
        let AttemptTicket {
            mut submission,
            mut attempt,
            ..
        } = ticket;

        self.transition(&mut submission, SubmissionStatus::Failed)?;
        submission.retry_count = submission.retry_count.saturating_add(1);
        submission.http_status = failure.http_status;
        submission.error_message = Some(failure.error.clone());
        if failure.response_body.is_some() {
            submission.partner_response = failure.response_body;
        }
        submission.manual_payload_override = None;

        let decision = if failure.retryable {
            retry::decide(submission.retry_count, submission.max_retries, now)
        } else {
            RetryDecision::GiveUp
        };
        match decision {
            RetryDecision::RetryAt { delay_seconds, at } => {
                submission.retry_delay_seconds = Some(delay_seconds);
                submission.next_retry_at = Some(at);
            }
            RetryDecision::GiveUp => {
                submission.retry_delay_seconds = None;
                submission.next_retry_at = None;
            }
        }
        self.write(&submission, SubmissionStatus::Submitting).await?;

        attempt.finished_at = Some(now);
        attempt.http_status = failure.http_status;
        attempt.error = Some(failure.error);
        self.store.finish_attempt(&attempt).await?;

        match submission.next_retry_at {
            Some(at) => warn!(
                id = %submission.id,
                retry_count = submission.retry_count,
                next_retry_at = %at,
                "Submission failed, retry scheduled"
            ),
            None => warn!(
                id = %submission.id,
                retry_count = submission.retry_count,
                error = submission.error_message.as_deref().unwrap_or(""),
                "Submission failed terminally"
            ),
        }
        Ok(submission)
    }

    /// Replace the payload for the next attempt only.
    ///
    /// Allowed on `pending` and `failed` rows. A failed row is re-armed to
    /// retry immediately.
    pub async fn set_override(
        &self,
        id: Uuid,
        payload: Map<String, Value>,
    ) -> Result<Submission, TrackerError> {
        let mut submission = self.get(id).await?;
        let status = submission.submission_status;
        if !matches!(status, SubmissionStatus::Pending | SubmissionStatus::Failed) {
            return Err(TrackerError::InvalidTransition {
                id,
                from: status.to_string(),
                to: "override".into(),
            });
        }

        let now = Utc::now();
        submission.manual_payload_override = Some(payload);
        if status == SubmissionStatus::Failed {
            submission.next_retry_at = Some(now);
        }
        submission.updated_at = now;
        if !self.store.update_submission_if(&submission, status).await? {
            return Err(self.lost_race(id, "override").await);
        }

        info!(%id, "Manual payload override set");
        Ok(submission)
    }

    pub async fn attempts(&self, id: Uuid) -> Result<Vec<SubmissionAttempt>, TrackerError> {
        Ok(self.store.list_attempts(id).await?)
    }

    pub async fn history(&self, id: Uuid) -> Result<SubmissionHistory, TrackerError> {
        let submission = self.get(id).await?;
        let attempts = self.attempts(id).await?;
        Ok(SubmissionHistory {
            submission,
            attempts,
        })
    }

    /// Failed submissions whose retry time has passed.
    pub async fn due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Submission>, TrackerError> {
        Ok(self.store.list_due_submissions(now, limit).await?)
    }

    fn transition(
        &self,
        submission: &mut Submission,
        to: SubmissionStatus,
    ) -> Result<(), TrackerError> {
        let from = submission.submission_status;
        if !from.can_transition_to(to) {
            return Err(TrackerError::InvalidTransition {
                id: submission.id,
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        submission.submission_status = to;
        submission.updated_at = Utc::now();
        Ok(())
    }

    async fn write(
        &self,
        submission: &Submission,
        expected: SubmissionStatus,
    ) -> Result<(), TrackerError> {
        if self
            .store
            .update_submission_if(submission, expected)
            .await?
        {
            Ok(())
        } else {
            Err(self
                .lost_race(submission.id, submission.submission_status.as_str())
                .await)
        }
    }

    /// The row changed underneath us; report what it is now.
    async fn lost_race(&self, id: Uuid, to: &str) -> TrackerError {
        let from = match self.store.get_submission(id).await {
            Ok(Some(current)) => current.submission_status.to_string(),
            Ok(None) => return TrackerError::NotFound(id),
            Err(e) => return TrackerError::Database(e),
        };
        TrackerError::InvalidTransition {
            id,
            from,
            to: to.to_string(),
        }
    }
}
