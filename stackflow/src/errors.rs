//! Error types for stackflow.
//!
//! The taxonomy mirrors how failures travel through the system: transient
//! backend errors are absorbed by retry loops, configuration errors are raised
//! at load time, and everything else ends up as the terminal status of the
//! owning stack or workflow execution together with an [`ErrorRecord`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The main error type for stackflow operations.
#[derive(Debug, Error)]
pub enum StackflowError {
    /// A definition or plan was rejected at load time.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// A resource group failed to reach HEALTHY.
    #[error("Provisioning of '{group_id}' failed: {message}")]
    Provisioning {
        /// The affected resource group.
        group_id: String,
        /// What went wrong.
        message: String,
    },

    /// A backend call failed in a way that may succeed when retried.
    #[error("Transient backend error during {operation}: {message}")]
    TransientBackend {
        /// The backend operation that failed.
        operation: String,
        /// The backend's message.
        message: String,
    },

    /// A task's job reached a failed terminal status.
    #[error("Job for task '{task}' failed: {message}")]
    JobFailure {
        /// The task state name.
        task: String,
        /// Failure detail.
        message: String,
    },

    /// Polling exceeded its bound.
    #[error("Timed out waiting for '{entity}' after {}s", after.as_secs_f64())]
    Timeout {
        /// The stack or task that was being waited on.
        entity: String,
        /// The bound that was exceeded.
        after: Duration,
    },

    /// An execution was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A secret could not be provisioned or resolved.
    #[error("{0}")]
    Secret(#[from] crate::secrets::SecretError),

    /// An ingest notification was rejected.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StackflowError {
    /// Creates a provisioning error.
    #[must_use]
    pub fn provisioning(group_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provisioning {
            group_id: group_id.into(),
            message: message.into(),
        }
    }

    /// Creates a transient backend error.
    #[must_use]
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientBackend {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a job failure error.
    #[must_use]
    pub fn job_failure(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::JobFailure {
            task: task.into(),
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(entity: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            entity: entity.into(),
            after,
        }
    }

    /// Returns the coarse kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Provisioning { .. } => ErrorKind::Provisioning,
            Self::TransientBackend { .. } => ErrorKind::TransientBackend,
            Self::JobFailure { .. } => ErrorKind::JobFailure,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Secret(_) => ErrorKind::SecretAccess,
            Self::InvalidEvent(_) => ErrorKind::InvalidEvent,
            Self::Serialization(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if retrying the failed operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientBackend { .. })
    }

    /// Converts the error into a structured record about `entity`.
    #[must_use]
    pub fn to_record(&self, entity: impl Into<String>) -> ErrorRecord {
        ErrorRecord::new(self.kind(), entity, self.to_string())
    }
}

impl From<serde_json::Error> for StackflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for StackflowError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Coarse error classification used in reports and execution history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A resource group failed to reach HEALTHY.
    Provisioning,
    /// Network or throttling failure.
    TransientBackend,
    /// A job reached FAILED or CANCELLED.
    JobFailure,
    /// Malformed definition or plan.
    Configuration,
    /// A polling bound was exceeded.
    Timeout,
    /// External cancellation.
    Cancelled,
    /// Secret provisioning or access failure.
    SecretAccess,
    /// Rejected ingest notification.
    InvalidEvent,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Provisioning => "ProvisioningError",
            Self::TransientBackend => "TransientBackendError",
            Self::JobFailure => "JobFailure",
            Self::Configuration => "ConfigurationError",
            Self::Timeout => "TimeoutError",
            Self::Cancelled => "Cancelled",
            Self::SecretAccess => "SecretAccessError",
            Self::InvalidEvent => "InvalidEvent",
            Self::Internal => "InternalError",
        };
        f.write_str(name)
    }
}

/// A structured error attached to a stack state or an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// The error kind.
    pub kind: ErrorKind,
    /// Id of the entity the error affects (group id, task name, execution id).
    pub entity: String,
    /// Human-readable message.
    pub message: String,
}

impl ErrorRecord {
    /// Creates a new error record.
    #[must_use]
    pub fn new(kind: ErrorKind, entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            entity: entity.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on '{}': {}", self.kind, self.entity, self.message)
    }
}

/// Diagnostic metadata for configuration errors.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code (e.g., "CONFIG-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a workflow definition or stack plan is malformed.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// The states or groups involved in the error.
    pub subjects: Vec<String>,
    /// Optional diagnostic info.
    pub info: Option<ErrorInfo>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            subjects: Vec::new(),
            info: None,
        }
    }

    /// Sets the subjects involved.
    #[must_use]
    pub fn with_subjects(mut self, subjects: Vec<String>) -> Self {
        self.subjects = subjects;
        self
    }

    /// Sets the diagnostic info.
    #[must_use]
    pub fn with_info(mut self, info: ErrorInfo) -> Self {
        self.info = Some(info);
        self
    }

    /// Returns the diagnostic code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.info.as_ref().map(|i| i.code.as_str())
    }
}

/// Error raised when a cycle is found in a workflow chain or stack plan.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of nodes forming the cycle.
    pub cycle_path: Vec<String>,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        Self { cycle_path }
    }
}

impl From<CycleDetectedError> for ConfigurationError {
    fn from(err: CycleDetectedError) -> Self {
        let info = ErrorInfo::new(
            codes::CYCLE,
            format!("Definition revisits a node: {}", err.cycle_path.join(" -> ")),
        )
        .with_fix_hint("Break the cycle; workflows and stack plans must be acyclic.");
        ConfigurationError {
            message: err.to_string(),
            subjects: err.cycle_path,
            info: Some(info),
        }
    }
}

/// Diagnostic codes attached to [`ConfigurationError`]s.
pub mod codes {
    /// A node is revisited.
    pub const CYCLE: &str = "CONFIG-CYCLE";
    /// A reference names a node that does not exist.
    pub const MISSING_REF: &str = "CONFIG-MISSING-REF";
    /// A name is declared more than once.
    pub const DUPLICATE: &str = "CONFIG-DUPLICATE";
    /// A value references its own not-yet-created resource.
    pub const SELF_REFERENCE: &str = "CONFIG-SELF-REFERENCE";
    /// A dependency points at a later tier.
    pub const TIER_ORDER: &str = "CONFIG-TIER-ORDER";
    /// A workflow state is malformed.
    pub const INVALID_STATE: &str = "CONFIG-INVALID-STATE";
    /// The document could not be parsed.
    pub const PARSE: &str = "CONFIG-PARSE";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_info_creation() {
        let info = ErrorInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("state", "T1");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("state"), Some(&"T1".to_string()));
    }

    #[test]
    fn test_cycle_detected_into_configuration_error() {
        let err = CycleDetectedError::new(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);
        assert!(err.to_string().contains("a -> b -> a"));

        let config: ConfigurationError = err.into();
        assert_eq!(config.code(), Some(codes::CYCLE));
        assert_eq!(config.subjects.len(), 3);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            StackflowError::provisioning("network", "boom").kind(),
            ErrorKind::Provisioning
        );
        assert_eq!(
            StackflowError::timeout("T1", Duration::from_secs(5)).kind(),
            ErrorKind::Timeout
        );
        assert!(StackflowError::transient("deploy", "throttled").is_transient());
        assert!(!StackflowError::job_failure("T1", "exit 1").is_transient());
    }

    #[test]
    fn test_error_record_display() {
        let record = StackflowError::provisioning("network", "subnet quota").to_record("network");
        assert_eq!(record.kind, ErrorKind::Provisioning);
        assert_eq!(record.entity, "network");
        assert!(record.to_string().starts_with("ProvisioningError on 'network'"));
    }
}
