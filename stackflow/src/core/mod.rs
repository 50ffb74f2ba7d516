//! Core domain enums shared by every component:
//! - Resource group status
//! - Job and terminal statuses
//! - Execution status, mode and failure policy

mod status;

pub use status::{
    ExecutionMode, ExecutionStatus, FailurePolicy, JobStatus, ResourceStatus, TerminalStatus,
};
