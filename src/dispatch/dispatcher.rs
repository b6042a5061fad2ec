//! One outbound partner call per invocation.
//!
//! `submit` opens an attempt through the tracker, sends the payload once and
//! records the outcome. There is no synchronous retry; a failed attempt is
//! rescheduled through `next_retry_at` and picked up by the retry sweeper.

use std::sync::Arc;

use chrono::Utc;
use reqwest::header::{AUTHORIZATION, HeaderName, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::dispatch::payload;
use crate::error::DispatchError;
use crate::fetch::FileFetcher;
use crate::submission::model::{DispatchTarget, PayloadFormat, Submission, SubmissionStatus};
use crate::submission::tracker::{AttemptFailure, SubmissionTracker};

/// Longest partner body kept in an error message.
const MAX_ERROR_BODY_CHARS: usize = 500;

/// What the partner answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitOutcome {
    pub http_status: u16,
    pub response_body: String,
}

/// Result of one `submit` call.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    /// Submission as stored after the attempt.
    pub submission: Submission,
    /// Partner reply when the call reached the partner with a 2xx.
    pub outcome: Option<SubmitOutcome>,
    /// Why the attempt failed.
    pub error: Option<String>,
}

impl AttemptReport {
    pub fn succeeded(&self) -> bool {
        self.submission.submission_status == SubmissionStatus::Completed
    }
}

pub struct Dispatcher {
    client: reqwest::Client,
    fetcher: FileFetcher,
    tracker: Arc<SubmissionTracker>,
    api_key: Option<SecretString>,
}

impl Dispatcher {
    pub fn new(
        config: &DispatchConfig,
        tracker: Arc<SubmissionTracker>,
    ) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| DispatchError::Client(e.to_string()))?;

        Ok(Self {
            fetcher: FileFetcher::with_client(client.clone()),
            client,
            tracker,
            api_key: config.api_key.clone(),
        })
    }

    pub fn tracker(&self) -> &Arc<SubmissionTracker> {
        &self.tracker
    }

    /// Make one attempt and record its outcome.
    ///
    /// Errors are returned only when the attempt could not be started or
    /// recorded; partner failures come back inside the report.
    pub async fn submit(&self, submission_id: Uuid) -> Result<AttemptReport, DispatchError> {
        let ticket = self.tracker.begin_attempt(submission_id).await?;
        info!(
            id = %submission_id,
            attempt = ticket.attempt.attempt_number,
            url = %ticket.submission.target.url,
            "Dispatching submission"
        );

        match self.send(&ticket.submission.target, &ticket.payload).await {
            Ok(outcome) => {
                let submission = self
                    .tracker
                    .record_success(ticket, outcome.http_status, outcome.response_body.clone())
                    .await?;
                Ok(AttemptReport {
                    submission,
                    outcome: Some(outcome),
                    error: None,
                })
            }
            Err(e) => {
                let message = error_message(&e);
                let (http_status, response_body) = match &e {
                    DispatchError::Http { status, body } => (Some(*status), Some(body.clone())),
                    _ => (None, None),
                };
                let failure = AttemptFailure {
                    http_status,
                    response_body,
                    error: message.clone(),
                    retryable: e.is_transient(),
                };
                let submission = self
                    .tracker
                    .record_failure(ticket, failure, Utc::now())
                    .await?;
                Ok(AttemptReport {
                    submission,
                    outcome: None,
                    error: Some(message),
                })
            }
        }
    }

    /// Send `payload` to `target` once. Non-2xx is `DispatchError::Http`.
    pub async fn send(
        &self,
        target: &DispatchTarget,
        payload: &Map<String, Value>,
    ) -> Result<SubmitOutcome, DispatchError> {
        let method = reqwest::Method::from_bytes(target.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| DispatchError::InvalidTarget(format!("bad method '{}'", target.method)))?;
        let url = reqwest::Url::parse(&target.url)
            .map_err(|e| DispatchError::InvalidTarget(format!("bad url '{}': {e}", target.url)))?;

        let mut request = self.client.request(method, url);

        let mut has_auth = false;
        for (name, value) in &target.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| DispatchError::InvalidTarget(format!("bad header '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| DispatchError::InvalidTarget(format!("bad value for '{name}': {e}")))?;
            has_auth |= name == AUTHORIZATION;
            request = request.header(name, value);
        }
        if !has_auth && let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        request = match target.format {
            PayloadFormat::Json => request.json(payload),
            PayloadFormat::Multipart => {
                let file = match &target.file_url {
                    Some(file_url) => Some(self.fetcher.fetch(file_url).await?),
                    None => None,
                };
                let form = payload::multipart_form(payload, file, target.file_media_type.as_deref())
                    .map_err(|e| DispatchError::InvalidTarget(format!("bad file part: {e}")))?;
                request.multipart(form)
            }
        };

        let resp = request
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| DispatchError::Transport(format!("reading response: {e}")))?;

        debug!(url = %target.url, status = status.as_u16(), "Partner responded");
        if !status.is_success() {
            return Err(DispatchError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(SubmitOutcome {
            http_status: status.as_u16(),
            response_body: body,
        })
    }
}

/// Human-readable failure text, with the partner body when there is one.
fn error_message(e: &DispatchError) -> String {
    match e {
        DispatchError::Http { status, body } if !body.trim().is_empty() => {
            let snippet: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
            format!("Partner returned HTTP {status}: {snippet}")
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_includes_body() {
        let e = DispatchError::Http {
            status: 422,
            body: r#"{"error":"mprn invalid"}"#.into(),
        };
        assert_eq!(
            error_message(&e),
            r#"Partner returned HTTP 422: {"error":"mprn invalid"}"#
        );
        let e = DispatchError::Http {
            status: 500,
            body: String::new(),
        };
        assert_eq!(error_message(&e), "Partner returned HTTP 500");
    }

    #[test]
    fn long_bodies_are_truncated() {
        let e = DispatchError::Http {
            status: 500,
            body: "x".repeat(2000),
        };
        assert!(error_message(&e).len() < 600);
    }
}
