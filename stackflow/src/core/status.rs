//! Status and policy enums shared across stacks, jobs and executions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Observed status of a resource group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    /// Nothing is deployed.
    #[default]
    Absent,
    /// A create, update or delete is underway.
    InProgress,
    /// Deployed and stable.
    Healthy,
    /// Deployed but not fully functional (e.g. a failed update left behind).
    Degraded,
    /// Deployment failed.
    Failed,
}

impl ResourceStatus {
    /// Returns true if the group exists in some form.
    #[must_use]
    pub fn is_present(&self) -> bool {
        !matches!(self, Self::Absent)
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "ABSENT"),
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Healthy => write!(f, "HEALTHY"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Terminal outcome of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalStatus {
    /// The job finished successfully.
    Succeeded,
    /// The job failed.
    Failed,
    /// The job was cancelled.
    Cancelled,
}

impl TerminalStatus {
    /// Returns true if the job succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        JobStatus::from(*self).fmt(f)
    }
}

/// Uniform status view over a job handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Submitted, not yet running.
    #[default]
    Pending,
    /// Running.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Failed.
    Failed,
    /// Cancelled.
    Cancelled,
}

impl JobStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns the terminal status, if this is one.
    #[must_use]
    pub fn terminal(&self) -> Option<TerminalStatus> {
        match self {
            Self::Succeeded => Some(TerminalStatus::Succeeded),
            Self::Failed => Some(TerminalStatus::Failed),
            Self::Cancelled => Some(TerminalStatus::Cancelled),
            Self::Pending | Self::Running => None,
        }
    }
}

impl From<TerminalStatus> for JobStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Succeeded => Self::Succeeded,
            TerminalStatus::Failed => Self::Failed,
            TerminalStatus::Cancelled => Self::Cancelled,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Overall status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Still advancing through the chain.
    #[default]
    Running,
    /// Reached the end of the chain.
    Succeeded,
    /// Aborted by a failure policy, a timeout or a cancel request.
    Failed,
}

impl ExecutionStatus {
    /// Returns true once the execution can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Whether the engine waits for a task's job to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// Block until the job reaches a terminal status.
    #[default]
    Sync,
    /// Submit and advance immediately.
    FireAndForget,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => write!(f, "SYNC"),
            Self::FireAndForget => write!(f, "FIRE_AND_FORGET"),
        }
    }
}

/// What a failed job does to the rest of the execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailurePolicy {
    /// End the execution FAILED.
    #[default]
    Abort,
    /// Record the failure and advance as if the job succeeded.
    Continue,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abort => write!(f, "ABORT"),
            Self::Continue => write!(f, "CONTINUE"),
        }
    }
}
