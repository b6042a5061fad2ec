//! Partner submissions and their attempt history.

pub mod model;
pub mod tracker;

pub use model::{
    DispatchTarget, NewSubmission, PayloadFormat, Submission, SubmissionAttempt,
    SubmissionHistory, SubmissionStatus,
};
pub use tracker::{AttemptFailure, AttemptTicket, SubmissionTracker};
