//! Runner for managed ETL jobs.

use super::adapter::{bind_parameters, JobError, JobHandle, JobRunner, JobSpec, RunnerKind, SecretBinding};
use crate::core::JobStatus;
use crate::polling::{with_retry, RetryConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Native run states reported by the ETL service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EtlRunState {
    /// Run is being scheduled.
    Starting,
    /// Run is executing.
    Running,
    /// A stop was requested.
    Stopping,
    /// Run was stopped.
    Stopped,
    /// Run finished successfully.
    Succeeded,
    /// Run failed.
    Failed,
    /// Run exceeded the job's timeout.
    Timeout,
    /// Run hit an internal service error.
    Error,
    /// Run is waiting for capacity.
    Waiting,
}

impl EtlRunState {
    /// Maps the native state onto the uniform view.
    #[must_use]
    pub fn status(self) -> JobStatus {
        match self {
            Self::Starting | Self::Waiting => JobStatus::Pending,
            Self::Running | Self::Stopping => JobStatus::Running,
            Self::Succeeded => JobStatus::Succeeded,
            Self::Stopped => JobStatus::Cancelled,
            Self::Failed | Self::Timeout | Self::Error => JobStatus::Failed,
        }
    }
}

/// Managed ETL job service.
#[async_trait]
pub trait EtlService: Send + Sync {
    /// Starts a run of `job_name` and returns its run id.
    async fn start_job_run(&self, job_name: &str, arguments: &BTreeMap<String, String>) -> Result<String, JobError>;

    /// Reads a run's state.
    async fn get_job_run(&self, job_name: &str, run_id: &str) -> Result<EtlRunState, JobError>;

    /// Stops a run.
    async fn stop_job_run(&self, job_name: &str, run_id: &str) -> Result<(), JobError>;
}

/// [`JobRunner`] for [`RunnerKind::Etl`].
///
/// A job's `job_kind` names the ETL job. Parameters are passed as job
/// arguments with a `--` prefix (`input` becomes `--input`).
pub struct EtlJobRunner {
    service: Arc<dyn EtlService>,
    retry: RetryConfig,
    secrets: Option<SecretBinding>,
}

impl EtlJobRunner {
    /// Creates a runner over `service`.
    #[must_use]
    pub fn new(service: Arc<dyn EtlService>) -> Self {
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

    fn arguments(parameters: BTreeMap<String, String>) -> BTreeMap<String, String> {
        parameters
            .into_iter()
            .map(|(key, value)| {
                if key.starts_with("--") {
                    (key, value)
                } else {
                    (format!("--{key}"), value)
                }
            })
            .collect()
    }

    fn job_name(handle: &JobHandle) -> Result<&str, JobError> {
        handle
            .target
            .as_deref()
            .ok_or_else(|| JobError::UnknownHandle(format!("ETL handle {handle} has no job name")))
    }
}

#[async_trait]
impl JobRunner for EtlJobRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Etl
    }

    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, JobError> {
        if spec.job_kind.trim().is_empty() {
            return Err(JobError::Rejected("ETL job name is empty".to_string()));
        }
        let arguments = Self::arguments(bind_parameters(self.secrets.as_ref(), &spec.parameters)?);
        let job_name = spec.job_kind.as_str();

        let run_id = with_retry(&self.retry, "etl.start_job_run", || {
            self.service.start_job_run(job_name, &arguments)
        })
        .await?;

        tracing::info!(job = job_name, run_id = %run_id, "Started ETL job run");
        Ok(JobHandle::new(RunnerKind::Etl, run_id, Some(job_name.to_string())))
    }

    async fn poll(&self, handle: &JobHandle) -> Result<JobStatus, JobError> {
        let job_name = Self::job_name(handle)?;
        let state = with_retry(&self.retry, "etl.get_job_run", || {
            self.service.get_job_run(job_name, &handle.native_id)
        })
        .await?;
        tracing::debug!(job = job_name, run_id = %handle.native_id, state = ?state, "Polled ETL job run");
        Ok(state.status())
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), JobError> {
        let job_name = Self::job_name(handle)?;
        with_retry(&self.retry, "etl.stop_job_run", || {
            self.service.stop_job_run(job_name, &handle.native_id)
        })
        .await
    }
}

impl std::fmt::Debug for EtlJobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtlJobRunner")
            .field("retry", &self.retry)
            .field("secrets", &self.secrets.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::polling::JitterStrategy;
    use crate::secrets::{CallerKind, SecretError, SecretProvisioner, SecretValue};
    use crate::testing::ScriptedEtlService;
    use std::time::Duration;

    fn fast_retry() -> RetryConfig {
        RetryConfig::new()
            .with_base_delay_ms(1)
            .with_jitter(JitterStrategy::None)
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(EtlRunState::Waiting.status(), JobStatus::Pending);
        assert_eq!(EtlRunState::Stopping.status(), JobStatus::Running);
        assert_eq!(EtlRunState::Stopped.status(), JobStatus::Cancelled);
        assert_eq!(EtlRunState::Timeout.status(), JobStatus::Failed);
        assert_eq!(EtlRunState::Error.status(), JobStatus::Failed);
        assert_eq!(EtlRunState::Succeeded.status(), JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_submit_prefixes_arguments() {
        let service = Arc::new(ScriptedEtlService::new());
        let runner = EtlJobRunner::new(service.clone()).with_retry(fast_retry());

        let handle = runner
            .submit(&JobSpec::new("ingest-etl").with_parameter("input", "s3://b/k"))
            .await
            .unwrap();

        assert_eq!(handle.runner_kind, RunnerKind::Etl);
        assert_eq!(handle.target.as_deref(), Some("ingest-etl"));
        let (job, args) = service.last_start().unwrap();
        assert_eq!(job, "ingest-etl");
        assert_eq!(args.get("--input").map(String::as_str), Some("s3://b/k"));
    }

    #[tokio::test]
    async fn test_poll_follows_script() {
        let service = Arc::new(ScriptedEtlService::new());
        service.script("ingest-etl", vec![EtlRunState::Running, EtlRunState::Succeeded]);
        let runner = EtlJobRunner::new(service).with_retry(fast_retry());

        let handle = runner.submit(&JobSpec::new("ingest-etl")).await.unwrap();
        assert_eq!(runner.poll(&handle).await.unwrap(), JobStatus::Running);
        assert_eq!(runner.poll(&handle).await.unwrap(), JobStatus::Succeeded);
        assert_eq!(runner.poll(&handle).await.unwrap(), JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_transient_submit_errors_are_retried() {
        let service = Arc::new(ScriptedEtlService::new());
        service.inject_transient_failures(2);
        let runner = EtlJobRunner::new(service.clone()).with_retry(fast_retry());

        assert!(runner.submit(&JobSpec::new("ingest-etl")).await.is_ok());
        assert_eq!(service.start_calls(), 3);
    }

    #[tokio::test]
    async fn test_rejected_submit_is_not_retried() {
        let service = Arc::new(ScriptedEtlService::new());
        service.reject_next_start("concurrent runs exceeded");
        let runner = EtlJobRunner::new(service.clone()).with_retry(fast_retry());

        let err = runner.submit(&JobSpec::new("ingest-etl")).await.unwrap_err();
        assert!(matches!(err, JobError::Rejected(_)));
        assert_eq!(service.start_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_run() {
        let service = Arc::new(ScriptedEtlService::new());
        service.script("ingest-etl", vec![EtlRunState::Running]);
        let runner = EtlJobRunner::new(service.clone()).with_retry(fast_retry());

        let handle = runner.submit(&JobSpec::new("ingest-etl")).await.unwrap();
        runner.cancel(&handle).await.unwrap();
        assert_eq!(runner.poll(&handle).await.unwrap(), JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_secret_references_resolved_as_etl_caller() {
        let provisioner = Arc::new(SecretProvisioner::new([CallerKind::EtlJob]));
        let generator = || -> Result<SecretValue, SecretError> {
            Ok(SecretValue::new().with_field("password", "pw"))
        };
        provisioner.provision("db", &generator).unwrap();

        let service = Arc::new(ScriptedEtlService::new());
        let runner = EtlJobRunner::new(service.clone())
            .with_retry(fast_retry())
            .with_secrets(SecretBinding::new(provisioner, CallerKind::EtlJob, Duration::from_secs(60)));

        runner
            .submit(&JobSpec::new("load").with_parameter("db_password", "{{resolve:secret:db:password}}"))
            .await
            .unwrap();

        let (_, args) = service.last_start().unwrap();
        assert_eq!(args.get("--db_password").map(String::as_str), Some("pw"));
    }
}
