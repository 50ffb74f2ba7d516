//! Event sink system for observability.
//!
//! Components emit lifecycle events through an [`EventSink`]:
//! `stack.*` from the reconciler, `dispatch.*` from the event dispatcher,
//! `execution.*` and `task.*` from the workflow engine.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names emitted by stackflow components.
pub mod names {
    /// A reconcile pass started for a group.
    pub const STACK_RECONCILING: &str = "stack.reconciling";
    /// A group was already healthy; nothing was changed.
    pub const STACK_UNCHANGED: &str = "stack.unchanged";
    /// A non-healthy group is being deleted before redeploy.
    pub const STACK_DELETING: &str = "stack.deleting";
    /// A deploy was issued.
    pub const STACK_DEPLOYING: &str = "stack.deploying";
    /// A group reached HEALTHY.
    pub const STACK_HEALTHY: &str = "stack.healthy";
    /// A group ended FAILED.
    pub const STACK_FAILED: &str = "stack.failed";
    /// A group was skipped because the run aborted.
    pub const STACK_SKIPPED: &str = "stack.skipped";
    /// A notification started an execution.
    pub const DISPATCH_STARTED: &str = "dispatch.started";
    /// A duplicate notification was dropped.
    pub const DISPATCH_DUPLICATE: &str = "dispatch.duplicate";
    /// An execution started running.
    pub const EXECUTION_STARTED: &str = "execution.started";
    /// An execution finished.
    pub const EXECUTION_FINISHED: &str = "execution.finished";
    /// A task submitted its job.
    pub const TASK_SUBMITTED: &str = "task.submitted";
    /// A task's job reached a terminal status.
    pub const TASK_COMPLETED: &str = "task.completed";
    /// A task failed but the execution continues.
    pub const TASK_CONTINUED: &str = "task.continued";
}
