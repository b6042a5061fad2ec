//! Re-sends failed submissions whose `next_retry_at` has passed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::dispatch::dispatcher::Dispatcher;
use crate::error::{DispatchError, TrackerError};

/// Rows picked up per sweep.
const DEFAULT_BATCH_SIZE: usize = 50;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub due: usize,
    pub completed: usize,
    pub failed: usize,
    /// Claimed by another worker between listing and sending.
    pub skipped: usize,
}

pub struct RetrySweeper {
    dispatcher: Arc<Dispatcher>,
    batch_size: usize,
}

impl RetrySweeper {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Send every submission due at `now`.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepSummary, TrackerError> {
        let due = self
            .dispatcher
            .tracker()
            .due_for_retry(now, self.batch_size)
            .await?;

        let mut summary = SweepSummary {
            due: due.len(),
            ..SweepSummary::default()
        };

        for submission in due {
            match self.dispatcher.submit(submission.id).await {
                Ok(report) if report.succeeded() => summary.completed += 1,
                Ok(_) => summary.failed += 1,
                Err(DispatchError::Tracker(TrackerError::InvalidTransition { .. })) => {
                    summary.skipped += 1;
                }
                Err(e) => {
                    error!(id = %submission.id, error = %e, "Retry attempt could not be recorded");
                    summary.failed += 1;
                }
            }
        }

        if summary.due > 0 {
            info!(
                due = summary.due,
                completed = summary.completed,
                failed = summary.failed,
                skipped = summary.skipped,
                "Retry sweep finished"
            );
        }
        Ok(summary)
    }
}

/// Spawn the retry poller.
pub fn spawn_retry_ticker(
    sweeper: Arc<RetrySweeper>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = sweeper.sweep_once(Utc::now()).await {
                warn!(error = %e, "Retry sweep failed");
            }
        }
    })
}
