//! The uniform job runner interface.

use crate::core::JobStatus;
use crate::polling::Transient;
use crate::secrets::{resolve_dynamic_references, CallerKind, SecretCache, SecretError, SecretProvisioner};
use crate::utils::{now_utc, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Which adapter runs a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunnerKind {
    /// Managed ETL job service.
    Etl,
    /// Step on a managed compute cluster.
    ClusterStep,
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Etl => write!(f, "etl"),
            Self::ClusterStep => write!(f, "cluster-step"),
        }
    }
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job definition name (ETL job name, cluster step name).
    #[serde(rename = "jobKind")]
    pub job_kind: String,
    /// Job arguments.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Cluster or service to run on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl JobSpec {
    /// Creates a spec with no parameters.
    #[must_use]
    pub fn new(job_kind: impl Into<String>) -> Self {
        Self {
            job_kind: job_kind.into(),
            ..Self::default()
        }
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Sets the target.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// Reference to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    /// Adapter that owns the job.
    pub runner_kind: RunnerKind,
    /// The native service's id (run id, step id).
    pub native_id: String,
    /// Where the job runs: the cluster id for steps, the job name for ETL runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// When the job was accepted.
    pub submitted_at: Timestamp,
}

impl JobHandle {
    /// Creates a handle stamped with the current time.
    #[must_use]
    pub fn new(runner_kind: RunnerKind, native_id: impl Into<String>, target: Option<String>) -> Self {
        Self {
            runner_kind,
            native_id: native_id.into(),
            target,
            submitted_at: now_utc(),
        }
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => write!(f, "{}:{}/{}", self.runner_kind, target, self.native_id),
            None => write!(f, "{}:{}", self.runner_kind, self.native_id),
        }
    }
}

/// Errors from job runners and the services behind them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Throttling, timeouts, unavailable endpoints.
    #[error("Transient error during {operation}: {message}")]
    Transient {
        /// The service call.
        operation: String,
        /// The service's message.
        message: String,
    },

    /// The service or adapter refused the job.
    #[error("Job rejected: {0}")]
    Rejected(String),

    /// The service does not know the handle.
    #[error("Unknown job handle: {0}")]
    UnknownHandle(String),

    /// A secret reference in the parameters could not be resolved.
    #[error("{0}")]
    Secret(#[from] SecretError),
}

impl JobError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

impl Transient for JobError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Adapter from a native job service to the uniform job contract.
///
/// Implementations retry transient service errors themselves; errors that
/// reach the caller are final.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// The kind of jobs this runner handles.
    fn kind(&self) -> RunnerKind;

    /// Submits a job.
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, JobError>;

    /// Reports the job's status.
    async fn poll(&self, handle: &JobHandle) -> Result<JobStatus, JobError>;

    /// Requests cancellation. Cancelling a finished job is not an error.
    async fn cancel(&self, handle: &JobHandle) -> Result<(), JobError>;
}

/// Resolves `{{resolve:secret:..}}` references in job parameters as one
/// caller kind.
#[derive(Debug, Clone)]
pub struct SecretBinding {
    provisioner: Arc<SecretProvisioner>,
    cache: Arc<SecretCache>,
}

impl SecretBinding {
    /// Creates a binding that resolves as `caller`, caching values for `ttl`.
    #[must_use]
    pub fn new(provisioner: Arc<SecretProvisioner>, caller: CallerKind, ttl: Duration) -> Self {
        let cache = Arc::new(SecretCache::new(provisioner.clone(), caller, ttl));
        Self { provisioner, cache }
    }

    /// Returns `parameters` with every secret reference substituted.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Secret`] if a reference cannot be resolved.
    pub fn bind(&self, parameters: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>, JobError> {
        Ok(resolve_dynamic_references(parameters, &self.cache, |name| {
            self.provisioner.lookup(name)
        })?)
    }
}

/// Substitutes secrets when a binding is configured.
pub(crate) fn bind_parameters(
    binding: Option<&SecretBinding>,
    parameters: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, JobError> {
    match binding {
        Some(binding) => binding.bind(parameters),
        None => Ok(parameters.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_kind_serde() {
        assert_eq!(serde_json::to_string(&RunnerKind::ClusterStep).unwrap(), r#""cluster-step""#);
        let kind: RunnerKind = serde_json::from_str(r#""etl""#).unwrap();
        assert_eq!(kind, RunnerKind::Etl);
    }

    #[test]
    fn test_job_spec_wire_names() {
        let spec: JobSpec = serde_json::from_str(
            r#"{"jobKind":"glue-etl","parameters":{"input":"s3://b/k"},"target":"j-1"}"#,
        )
        .unwrap();
        assert_eq!(spec, JobSpec::new("glue-etl").with_parameter("input", "s3://b/k").with_target("j-1"));
    }

    #[test]
    fn test_handle_display() {
        let handle = JobHandle::new(RunnerKind::ClusterStep, "s-1", Some("j-1".to_string()));
        assert_eq!(handle.to_string(), "cluster-step:j-1/s-1");
    }

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(JobError::transient("start", "throttled").is_transient());
        assert!(!JobError::Rejected("bad".into()).is_transient());
        assert!(!JobError::UnknownHandle("x".into()).is_transient());
    }
}
