//! Tenant workflows: definitions, graph, and the engine that walks them.

pub mod condition;
pub mod context;
pub mod engine;
pub mod execution;
pub mod graph;
pub mod model;
pub mod template;
pub mod templates;

pub use context::ExecutionContext;
pub use engine::{ExecutionReport, ExecutionRequest, WorkflowEngine};
pub use execution::{ExecutionStatus, WorkflowExecution};
pub use graph::WorkflowGraph;
pub use model::{WorkflowDefinition, WorkflowStep, WorkflowTemplate};
