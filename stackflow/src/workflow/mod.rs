//! Sequential workflow engine.
//!
//! A [`WorkflowDefinition`] is a validated chain of task states. The
//! [`WorkflowEngine`] runs executions of it, one job at a time, and keeps
//! every [`WorkflowExecution`] in an [`ExecutionStore`] until it is purged.

mod definition;
mod engine;
mod execution;

#[cfg(test)]
mod scenario_tests;

pub use definition::{TaskState, Transition, WorkflowDefinition};
pub use engine::{failure_of, EngineConfig, WorkflowEngine};
pub use execution::{ActiveJob, Cursor, ExecutionSlot, ExecutionStore, HistoryEntry, WorkflowExecution};
