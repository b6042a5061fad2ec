//! Doc Intake: classify customer-sent documents and route them to partners.

pub mod api;
pub mod attachment;
pub mod classify;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fetch;
pub mod hashing;
pub mod intake;
pub mod store;
pub mod submission;
pub mod tenant;
pub mod workflow;
