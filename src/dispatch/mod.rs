//! Outbound partner dispatch with scheduled retries.

pub mod dispatcher;
pub mod payload;
pub mod retry;
pub mod sweeper;

pub use dispatcher::{AttemptReport, Dispatcher, SubmitOutcome};
pub use retry::retry_delay_seconds;
pub use sweeper::{RetrySweeper, SweepSummary, spawn_retry_ticker};
