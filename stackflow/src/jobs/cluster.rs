//! Runner for steps on a managed compute cluster.

use super::adapter::{bind_parameters, JobError, JobHandle, JobRunner, JobSpec, RunnerKind, SecretBinding};
use crate::core::JobStatus;
use crate::polling::{with_retry, RetryConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Jar the cluster uses to run shell commands as steps.
pub const COMMAND_RUNNER_JAR: &str = "command-runner.jar";

/// What the cluster does when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionOnFailure {
    /// Keep the cluster and later steps running.
    #[default]
    Continue,
    /// Cancel pending steps and wait.
    CancelAndWait,
    /// Shut the cluster down.
    TerminateCluster,
}

impl std::str::FromStr for ActionOnFailure {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CONTINUE" => Ok(Self::Continue),
            "CANCEL_AND_WAIT" => Ok(Self::CancelAndWait),
            "TERMINATE_CLUSTER" => Ok(Self::TerminateCluster),
            other => Err(JobError::Rejected(format!("unknown actionOnFailure '{other}'"))),
        }
    }
}

/// A step as submitted to the cluster service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepConfig {
    /// Step name.
    pub name: String,
    /// Failure behaviour.
    pub action_on_failure: ActionOnFailure,
    /// Jar to run.
    pub jar: String,
    /// Jar arguments.
    pub args: Vec<String>,
}

/// Native step states reported by the cluster service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    /// Queued.
    Pending,
    /// Cancellation requested.
    CancelPending,
    /// Executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Cancelled.
    Cancelled,
    /// Failed.
    Failed,
    /// Stopped by the cluster going away.
    Interrupted,
}

impl StepState {
    /// Maps the native state onto the uniform view.
    #[must_use]
    pub fn status(self) -> JobStatus {
        match self {
            Self::Pending => JobStatus::Pending,
            Self::Running | Self::CancelPending => JobStatus::Running,
            Self::Completed => JobStatus::Succeeded,
            Self::Cancelled => JobStatus::Cancelled,
            Self::Failed | Self::Interrupted => JobStatus::Failed,
        }
    }
}

/// Managed cluster service.
#[async_trait]
pub trait ClusterService: Send + Sync {
    /// Adds a step to a cluster and returns its step id.
    async fn add_step(&self, cluster_id: &str, step: &StepConfig) -> Result<String, JobError>;

    /// Reads a step's state.
    async fn describe_step(&self, cluster_id: &str, step_id: &str) -> Result<StepState, JobError>;

    /// Cancels steps.
    async fn cancel_steps(&self, cluster_id: &str, step_ids: &[String]) -> Result<(), JobError>;
}

/// [`JobRunner`] for [`RunnerKind::ClusterStep`].
///
/// Recognized parameters: `entryPoint` (required script), `args`
/// (whitespace-separated positional arguments), `deployMode` (default
/// `cluster`), `actionOnFailure` (default `CONTINUE`) and `name` (default
/// the job kind). The target is the cluster id and is required.
pub struct ClusterStepRunner {
    service: Arc<dyn ClusterService>,
    retry: RetryConfig,
    secrets: Option<SecretBinding>,
}

impl ClusterStepRunner {
    /// Creates a runner over `service`.
    #[must_use]
    pub fn new(service: Arc<dyn ClusterService>) -> Self {
        Self {
            service,
            retry: RetryConfig::default(),
            secrets: None,
        }
    }

    /// Sets the transient-error retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Resolves secret references in parameters at submit time.
    #[must_use]
    pub fn with_secrets(mut self, binding: SecretBinding) -> Self {
        self.secrets = Some(binding);
        self
    }

    /// Builds the `spark-submit` step for a job spec.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Rejected`] if `entryPoint` is missing or
    /// `actionOnFailure` is unknown.
    pub fn build_step(job_kind: &str, parameters: &BTreeMap<String, String>) -> Result<StepConfig, JobError> {
        let entry_point = parameters
            .get("entryPoint")
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| JobError::Rejected(format!("cluster step '{job_kind}' has no entryPoint")))?;
        let deploy_mode = parameters.get("deployMode").map_or("cluster", String::as_str);
        let action_on_failure = match parameters.get("actionOnFailure") {
            Some(raw) => raw.parse()?,
            None => ActionOnFailure::default(),
        };

        let mut args = vec![
            "spark-submit".to_string(),
            "--deploy-mode".to_string(),
            deploy_mode.to_string(),
            entry_point.clone(),
        ];
        if let Some(extra) = parameters.get("args") {
            args.extend(extra.split_whitespace().map(str::to_string));
        }

        Ok(StepConfig {
            name: parameters.get("name").cloned().unwrap_or_else(|| job_kind.to_string()),
            action_on_failure,
            jar: COMMAND_RUNNER_JAR.to_string(),
            args,
        })
    }

    fn cluster_id(handle: &JobHandle) -> Result<&str, JobError> {
        handle
            .target
            .as_deref()
            .ok_or_else(|| JobError::UnknownHandle(format!("step handle {handle} has no cluster id")))
    }
}

#[async_trait]
impl JobRunner for ClusterStepRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::ClusterStep
    }

    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, JobError> {
        let cluster_id = spec
            .target
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| JobError::Rejected(format!("cluster step '{}' has no target cluster", spec.job_kind)))?;
        let parameters = bind_parameters(self.secrets.as_ref(), &spec.parameters)?;
        let step = Self::build_step(&spec.job_kind, &parameters)?;

        let step_id = with_retry(&self.retry, "cluster.add_step", || {
            self.service.add_step(cluster_id, &step)
        })
        .await?;

        tracing::info!(cluster = cluster_id, step_id = %step_id, step = %step.name, "Added cluster step");
        Ok(JobHandle::new(RunnerKind::ClusterStep, step_id, Some(cluster_id.to_string())))
    }

    async fn poll(&self, handle: &JobHandle) -> Result<JobStatus, JobError> {
        let cluster_id = Self::cluster_id(handle)?;
        let state = with_retry(&self.retry, "cluster.describe_step", || {
            self.service.describe_step(cluster_id, &handle.native_id)
        })
        .await?;
        Ok(state.status())
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), JobError> {
        let cluster_id = Self::cluster_id(handle)?;
        let step_ids = [handle.native_id.clone()];
        with_retry(&self.retry, "cluster.cancel_steps", || {
            self.service.cancel_steps(cluster_id, &step_ids)
        })
        .await
    }
}

impl std::fmt::Debug for ClusterStepRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterStepRunner")
            .field("retry", &self.retry)
            .field("secrets", &self.secrets.is_some())
            .finish_non_exhaustive()
    }
}
