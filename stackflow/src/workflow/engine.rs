//! The workflow engine.
//!
//! Each execution is driven by one tokio task that walks the definition's
//! chain strictly serially: submit the task's job, wait for it (SYNC) or
//! record it as RUNNING (FIRE_AND_FORGET), then apply the task's failure
//! policy to pick the next state. Entry points never return job failures as
//! errors; they end up in the execution record instead.

use super::definition::{TaskState, Transition, WorkflowDefinition};
use super::execution::{ActiveJob, ExecutionSlot, ExecutionStore, HistoryEntry, WorkflowExecution};
use crate::core::{ExecutionMode, ExecutionStatus, FailurePolicy, JobStatus, TerminalStatus};
use crate::errors::{ConfigurationError, ErrorRecord, StackflowError};
use crate::events::{names, EventSink, NoOpEventSink};
use crate::jobs::{JobHandle, JobRunner, RunnerRegistry};
use crate::polling::{wait_until, PollConfig, WaitOutcome};
use crate::utils::{execution_id, now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Job status polling cadence.
    #[serde(default)]
    pub poll: PollConfig,
    /// Bound on a SYNC task without its own `timeoutSeconds`.
    #[serde(default = "default_task_timeout_secs")]
    pub default_task_timeout_secs: u64,
    /// Bound on a whole execution; overrides the definition's own timeout.
    #[serde(default)]
    pub execution_timeout_secs: Option<u64>,
}

fn default_task_timeout_secs() -> u64 {
    3600
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            default_task_timeout_secs: default_task_timeout_secs(),
            execution_timeout_secs: None,
        }
    }
}

impl EngineConfig {
    /// Sets the polling cadence.
    #[must_use]
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Sets the default SYNC task bound.
    #[must_use]
    pub fn with_default_task_timeout(mut self, timeout: Duration) -> Self {
        self.default_task_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Sets the execution-wide bound.
    #[must_use]
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    /// The default SYNC task bound.
    #[must_use]
    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs(self.default_task_timeout_secs)
    }
}

/// How a task ended, before the failure policy is applied.
enum TaskOutcome {
    /// The job reached a terminal status, or never started.
    Finished {
        handle: Option<JobHandle>,
        status: TerminalStatus,
        error: Option<StackflowError>,
    },
    /// A fire-and-forget job was submitted.
    Detached(JobHandle),
    /// The execution itself was cancelled or ran out of time.
    Interrupted {
        handle: Option<JobHandle>,
        error: StackflowError,
    },
}

/// Runs workflow executions against registered job runners.
pub struct WorkflowEngine {
    runners: RunnerRegistry,
    executions: Arc<ExecutionStore>,
    config: EngineConfig,
    event_sink: Arc<dyn EventSink>,
    spawned: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkflowEngine {
    /// Creates an engine with its own execution store.
    #[must_use]
    pub fn new(runners: RunnerRegistry) -> Self {
        Self {
            runners,
            executions: Arc::new(ExecutionStore::new()),
            config: EngineConfig::default(),
            event_sink: Arc::new(NoOpEventSink),
            spawned: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Sets the engine configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Shares an execution store with other components.
    #[must_use]
    pub fn with_store(mut self, executions: Arc<ExecutionStore>) -> Self {
        self.executions = executions;
        self
    }

    /// The execution registry.
    #[must_use]
    pub fn executions(&self) -> Arc<ExecutionStore> {
        self.executions.clone()
    }

    /// Returns a snapshot of an execution.
    #[must_use]
    pub fn execution(&self, id: &str) -> Option<WorkflowExecution> {
        self.executions.get(id)
    }

    /// Registers a new execution and drives it on its own task.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the definition has no states.
    pub fn start(
        self: &Arc<Self>,
        definition: Arc<WorkflowDefinition>,
        input: serde_json::Value,
    ) -> Result<String, StackflowError> {
        self.start_with_id(execution_id(), definition, input)
    }

    /// Like [`start`](Self::start) with a caller-chosen id.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the id is already registered or the
    /// definition has no states.
    pub fn start_with_id(
        self: &Arc<Self>,
        id: impl Into<String>,
        definition: Arc<WorkflowDefinition>,
        input: serde_json::Value,
    ) -> Result<String, StackflowError> {
        let slot = self.register(id.into(), &definition, input)?;
        let id = slot.snapshot().id;
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            engine.drive(&slot, &definition).await;
        });

        let mut spawned = self.spawned.lock();
        spawned.retain(|h| !h.is_finished());
        spawned.push(handle);
        Ok(id)
    }

    /// Runs an execution to completion on the current task.
    ///
    /// # Errors
    ///
    /// Returns a configuration error only if the execution cannot be
    /// registered; job failures are reported in the returned record.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        input: serde_json::Value,
    ) -> Result<WorkflowExecution, StackflowError> {
        let slot = self.register(execution_id(), definition, input)?;
        self.drive(&slot, definition).await;
        Ok(slot.snapshot())
    }

    /// Requests cancellation of a running execution.
    ///
    /// Returns false if the execution is unknown, already terminal or
    /// already cancelled.
    pub fn cancel(&self, id: &str, reason: impl Into<String>) -> bool {
        let Some(slot) = self.executions.slot(id) else {
            return false;
        };
        if slot.snapshot().is_terminal() {
            return false;
        }
        let cancelled = slot.token().cancel(reason);
        if cancelled {
            tracing::info!(execution = id, "Cancellation requested");
        }
        cancelled
    }

    /// Waits for every spawned execution to finish.
    pub async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.spawned.lock());
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Execution task panicked");
            }
        }
    }

    fn register(
        &self,
        id: String,
        definition: &WorkflowDefinition,
        input: serde_json::Value,
    ) -> Result<Arc<ExecutionSlot>, StackflowError> {
        if definition.start().is_none() {
            return Err(ConfigurationError::new(format!(
                "Workflow '{}' has no states",
                definition.name()
            ))
            .into());
        }
        self.executions
            .insert(WorkflowExecution::new(id.clone(), definition, input))
            .ok_or_else(|| {
                ConfigurationError::new(format!("Execution '{id}' already exists")).into()
            })
    }

    async fn drive(&self, slot: &ExecutionSlot, definition: &WorkflowDefinition) {
        let snapshot = slot.snapshot();
        let id = snapshot.id.clone();
        let execution_timeout = self
            .config
            .execution_timeout_secs
            .map(Duration::from_secs)
            .or(definition.timeout());
        let deadline = execution_timeout.map(|t| (Instant::now() + t, t));

        tracing::info!(execution = %id, workflow = definition.name(), "Execution started");
        self.emit(
            names::EXECUTION_STARTED,
            &id,
            Some(serde_json::json!({ "workflow": definition.name(), "input": snapshot.input })),
        )
        .await;

        loop {
            let Some(name) = slot.snapshot().current_state().map(str::to_string) else {
                break;
            };
            let Some(task) = definition.state(&name) else {
                let error = StackflowError::job_failure(&name, "state is not part of the definition");
                slot.update(|e| e.fail(error.to_record(&name)));
                break;
            };

            if let Some(reason) = slot.token().reason() {
                slot.update(|e| e.fail(StackflowError::Cancelled(reason).to_record(&id)));
                break;
            }
            if let Some((at, after)) = deadline {
                if Instant::now() >= at {
                    slot.update(|e| e.fail(StackflowError::timeout(&id, after).to_record(&id)));
                    break;
                }
            }

            let started_at = now_utc();
            let outcome = self.run_task(slot, task, deadline).await;
            self.apply(slot, task, started_at, outcome).await;
        }

        let finished = slot.snapshot();
        match finished.status {
            ExecutionStatus::Succeeded => {
                tracing::info!(execution = %id, "Execution succeeded");
            }
            _ => {
                tracing::warn!(
                    execution = %id,
                    error = ?finished.error.as_ref().map(|e| &e.message),
                    "Execution failed"
                );
            }
        }
        self.emit(
            names::EXECUTION_FINISHED,
            &id,
            Some(serde_json::json!({
                "status": finished.status,
                "error": finished.error,
                "tasks": finished.history.len(),
            })),
        )
        .await;
    }

    async fn run_task(
        &self,
        slot: &ExecutionSlot,
        task: &TaskState,
        deadline: Option<(Instant, Duration)>,
    ) -> TaskOutcome {
        let finished_without_job = |error: StackflowError| TaskOutcome::Finished {
            handle: None,
            status: TerminalStatus::Failed,
            error: Some(error),
        };

        let input = slot.snapshot().input;
        let spec = match task.job_spec(&input) {
            Ok(spec) => spec,
            Err(message) => return finished_without_job(StackflowError::job_failure(&task.name, message)),
        };
        let Some(runner) = self.runners.get(task.runner_kind) else {
            return finished_without_job(StackflowError::job_failure(
                &task.name,
                format!("no runner registered for '{}'", task.runner_kind),
            ));
        };

        if let Some(active) = slot.snapshot().active_job {
            return finished_without_job(StackflowError::job_failure(
                &task.name,
                format!("job {} for '{}' is still active", active.handle, active.task),
            ));
        }

        let handle = match runner.submit(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(task = %task.name, error = %e, "Job submission failed");
                return finished_without_job(StackflowError::job_failure(&task.name, e.to_string()));
            }
        };
        slot.update(|e| {
            e.active_job = Some(ActiveJob {
                task: task.name.clone(),
                handle: handle.clone(),
            });
        });
        tracing::info!(task = %task.name, handle = %handle, mode = ?task.mode, "Submitted job");
        self.emit(
            names::TASK_SUBMITTED,
            &slot.snapshot().id,
            Some(serde_json::json!({ "task": task.name, "handle": handle.to_string() })),
        )
        .await;

        let outcome = match task.mode {
            ExecutionMode::FireAndForget => TaskOutcome::Detached(handle),
            ExecutionMode::Sync => self.await_job(slot, task, runner.as_ref(), handle, deadline).await,
        };
        slot.update(|e| e.active_job = None);
        outcome
    }

    async fn await_job(
        &self,
        slot: &ExecutionSlot,
        task: &TaskState,
        runner: &dyn JobRunner,
        handle: JobHandle,
        deadline: Option<(Instant, Duration)>,
    ) -> TaskOutcome {
        let task_timeout = task.timeout.unwrap_or_else(|| self.config.default_task_timeout());
        let remaining = deadline.map(|(at, after)| (at.saturating_duration_since(Instant::now()), after));
        let (timeout, execution_bound) = match remaining {
            Some((left, after)) if left < task_timeout => (left, Some(after)),
            _ => (task_timeout, None),
        };

        let job = &handle;
        let outcome: WaitOutcome<TerminalStatus, _> =
            wait_until(&self.config.poll, timeout, Some(slot.token()), || async move {
                runner.poll(job).await.map(|status| status.terminal())
            })
            .await;

        match outcome {
            WaitOutcome::Ready(status) => {
                let error = (!status.is_success()).then(|| {
                    StackflowError::job_failure(&task.name, format!("job {handle} ended {status}"))
                });
                TaskOutcome::Finished {
                    handle: Some(handle),
                    status,
                    error,
                }
            }
            WaitOutcome::Failed(e) => {
                self.cancel_job(runner, &handle, &task.name).await;
                TaskOutcome::Finished {
                    handle: Some(handle),
                    status: TerminalStatus::Failed,
                    error: Some(StackflowError::job_failure(&task.name, format!("polling failed: {e}"))),
                }
            }
            WaitOutcome::TimedOut { after } => {
                self.cancel_job(runner, &handle, &task.name).await;
                match execution_bound {
                    Some(execution_after) => TaskOutcome::Interrupted {
                        handle: Some(handle),
                        error: StackflowError::timeout(slot.snapshot().id, execution_after),
                    },
                    None => TaskOutcome::Finished {
                        handle: Some(handle),
                        status: TerminalStatus::Failed,
                        error: Some(StackflowError::timeout(&task.name, after)),
                    },
                }
            }
            WaitOutcome::Cancelled { reason } => {
                self.cancel_job(runner, &handle, &task.name).await;
                TaskOutcome::Interrupted {
                    handle: Some(handle),
                    error: StackflowError::Cancelled(reason),
                }
            }
        }
    }

    async fn cancel_job(&self, runner: &dyn JobRunner, handle: &JobHandle, task: &str) {
        if let Err(e) = runner.cancel(handle).await {
            tracing::warn!(task, handle = %handle, error = %e, "Failed to cancel job");
        }
    }

    async fn apply(
        &self,
        slot: &ExecutionSlot,
        task: &TaskState,
        started_at: Timestamp,
        outcome: TaskOutcome,
    ) {
        let next = match &task.transition {
            Transition::Next(next) => Some(next.as_str()),
            Transition::End => None,
        };
        let entry = |handle, status, error: Option<&StackflowError>| HistoryEntry {
            state: task.name.clone(),
            handle,
            status,
            continued: false,
            error: error.map(|e| e.to_record(&task.name)),
            started_at,
            finished_at: Some(now_utc()),
        };
        let id = slot.snapshot().id;

        match outcome {
            TaskOutcome::Detached(handle) => {
                let mut detached = entry(Some(handle), JobStatus::Running, None);
                detached.finished_at = None;
                slot.update(|e| {
                    e.history.push(detached);
                    e.advance_to(next);
                });
            }
            TaskOutcome::Finished {
                handle,
                status: TerminalStatus::Succeeded,
                ..
            } => {
                self.emit_completed(&id, task, JobStatus::Succeeded).await;
                slot.update(|e| {
                    e.history.push(entry(handle, JobStatus::Succeeded, None));
                    e.advance_to(next);
                });
            }
            TaskOutcome::Finished { handle, status, error } => {
                let status = JobStatus::from(status);
                let error =
                    error.unwrap_or_else(|| StackflowError::job_failure(&task.name, format!("job ended {status}")));
                self.emit_completed(&id, task, status).await;
                match task.failure_policy {
                    FailurePolicy::Abort => {
                        tracing::warn!(task = %task.name, status = %status, "Task failed; aborting execution");
                        let record = error.to_record(&task.name);
                        slot.update(|e| {
                            e.history.push(entry(handle, status, Some(&error)));
                            e.fail(record);
                        });
                    }
                    FailurePolicy::Continue => {
                        tracing::warn!(task = %task.name, status = %status, "Task failed; continuing");
                        let mut continued = entry(handle, status, Some(&error));
                        continued.continued = true;
                        slot.update(|e| {
                            e.history.push(continued);
                            e.advance_to(next);
                        });
                        self.emit(
                            names::TASK_CONTINUED,
                            &id,
                            Some(serde_json::json!({ "task": task.name, "status": status })),
                        )
                        .await;
                    }
                }
            }
            TaskOutcome::Interrupted { handle, error } => {
                let status = if handle.is_some() {
                    JobStatus::Cancelled
                } else {
                    JobStatus::Failed
                };
                self.emit_completed(&id, task, status).await;
                let record = error.to_record(&id);
                slot.update(|e| {
                    e.history.push(entry(handle, status, Some(&error)));
                    e.fail(record);
                });
            }
        }
    }

    async fn emit_completed(&self, id: &str, task: &TaskState, status: JobStatus) {
        self.emit(
            names::TASK_COMPLETED,
            id,
            Some(serde_json::json!({ "task": task.name, "status": status })),
        )
        .await;
    }

    async fn emit(&self, event_type: &str, execution: &str, extra: Option<serde_json::Value>) {
        let mut data = serde_json::json!({ "execution": execution });
        if let (Some(serde_json::Value::Object(extra)), Some(map)) = (extra, data.as_object_mut()) {
            map.extend(extra);
        }
        self.event_sink.emit(event_type, Some(data)).await;
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("runners", &self.runners)
            .field("config", &self.config)
            .field("executions", &self.executions.len())
            .finish_non_exhaustive()
    }
}

/// Returns the record of a failed execution's first error, if any.
#[must_use]
pub fn failure_of(execution: &WorkflowExecution) -> Option<&ErrorRecord> {
    (execution.status == ExecutionStatus::Failed)
        .then_some(execution.error.as_ref())
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::events::CollectingEventSink;
    use crate::jobs::{ClusterStepRunner, EtlJobRunner, EtlRunState, JobError, JobSpec, RunnerKind, StepState};
    use crate::testing::{ScriptedClusterService, ScriptedEtlService};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick_config() -> EngineConfig {
        EngineConfig::default().with_poll(PollConfig::fixed(Duration::from_millis(5)))
    }

    fn pipeline(t1_policy: &str, t2_mode: &str) -> WorkflowDefinition {
        WorkflowDefinition::from_yaml(&format!(
            r"
name: pipeline
startAt: T1
states:
  T1:
    type: task
    runnerKind: etl
    jobKind: ingest-etl
    failurePolicy: {t1_policy}
    parameters:
      input: $.Key
    next: T2
  T2:
    type: task
    runnerKind: cluster-step
    jobKind: spark-aggregate
    mode: {t2_mode}
    target: j-CLUSTER
    parameters:
      entryPoint: s3://scripts/sparkjob1.py
      args: $.Key
    end: true
"
        ))
        .unwrap()
    }

    struct Services {
        etl: Arc<ScriptedEtlService>,
        cluster: Arc<ScriptedClusterService>,
        registry: RunnerRegistry,
    }

    fn services() -> Services {
        let etl = Arc::new(ScriptedEtlService::new());
        let cluster = Arc::new(ScriptedClusterService::new());
        let registry = RunnerRegistry::new()
            .with_runner(Arc::new(EtlJobRunner::new(etl.clone())))
            .with_runner(Arc::new(ClusterStepRunner::new(cluster.clone())));
        Services { etl, cluster, registry }
    }

    fn input() -> serde_json::Value {
        serde_json::json!({"Bucket": "ingest", "Key": "data/file.csv"})
    }

    #[tokio::test]
    async fn test_successful_chain() {
        let s = services();
        s.etl.script("ingest-etl", vec![EtlRunState::Running, EtlRunState::Succeeded]);
        s.cluster.script(vec![StepState::Pending, StepState::Running, StepState::Completed]);
        let sink = Arc::new(CollectingEventSink::new());
        let engine = WorkflowEngine::new(s.registry)
            .with_config(quick_config())
            .with_event_sink(sink.clone());

        let exec = engine.run(&pipeline("ABORT", "SYNC"), input()).await.unwrap();

        assert_eq!(exec.status, ExecutionStatus::Succeeded);
        assert_eq!(
            exec.history.iter().map(|e| (e.state.as_str(), e.status)).collect::<Vec<_>>(),
            vec![("T1", JobStatus::Succeeded), ("T2", JobStatus::Succeeded)]
        );
        assert!(exec.active_job.is_none());
        assert!(exec.ended_at.is_some());

        let (_, args) = s.etl.last_start().unwrap();
        assert_eq!(args["--input"], "data/file.csv");
        assert_eq!(s.cluster.last_step().unwrap().args.last().map(String::as_str), Some("data/file.csv"));

        let types = sink.event_types();
        assert_eq!(types.first().map(String::as_str), Some(names::EXECUTION_STARTED));
        assert_eq!(types.last().map(String::as_str), Some(names::EXECUTION_FINISHED));
        assert_eq!(sink.events_of_type(names::TASK_SUBMITTED).len(), 2);
    }

    #[tokio::test]
    async fn test_abort_stops_chain() {
        let s = services();
        s.etl.script("ingest-etl", vec![EtlRunState::Running, EtlRunState::Failed]);
        let engine = WorkflowEngine::new(s.registry).with_config(quick_config());

        let exec = engine.run(&pipeline("ABORT", "SYNC"), input()).await.unwrap();

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.history.len(), 1);
        assert_eq!(exec.history[0].status, JobStatus::Failed);
        assert!(!exec.history[0].continued);
        assert_eq!(failure_of(&exec).map(|e| (e.kind, e.entity.as_str())), Some((ErrorKind::JobFailure, "T1")));
        assert!(s.cluster.last_step().is_none());
    }

    #[tokio::test]
    async fn test_continue_advances_after_failure() {
        let s = services();
        s.etl.script("ingest-etl", vec![EtlRunState::Failed]);
        let sink = Arc::new(CollectingEventSink::new());
        let engine = WorkflowEngine::new(s.registry)
            .with_config(quick_config())
            .with_event_sink(sink.clone());

        let exec = engine.run(&pipeline("CONTINUE", "SYNC"), input()).await.unwrap();

        assert_eq!(exec.status, ExecutionStatus::Succeeded);
        let t1 = exec.entry("T1").unwrap();
        assert_eq!(t1.status, JobStatus::Failed);
        assert!(t1.continued);
        assert!(t1.error.is_some());
        assert_eq!(exec.entry("T2").map(|e| e.status), Some(JobStatus::Succeeded));
        assert_eq!(sink.events_of_type(names::TASK_CONTINUED).len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_submit_counts_as_failure() {
        let s = services();
        s.etl.reject_next_start("concurrent runs exceeded");
        let engine = WorkflowEngine::new(s.registry).with_config(quick_config());

        let exec = engine.run(&pipeline("ABORT", "SYNC"), input()).await.unwrap();

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.history[0].handle.is_none());
        assert_eq!(exec.history[0].status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_missing_input_field_fails_task() {
        let s = services();
        let engine = WorkflowEngine::new(s.registry).with_config(quick_config());

        let exec = engine
            .run(&pipeline("ABORT", "SYNC"), serde_json::json!({"Bucket": "ingest"}))
            .await
            .unwrap();

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(s.etl.start_calls(), 0);
    }

    #[tokio::test]
    async fn test_fire_and_forget_records_running() {
        let s = services();
        s.cluster.script(vec![StepState::Running]);
        let engine = WorkflowEngine::new(s.registry).with_config(quick_config());

        let exec = engine.run(&pipeline("ABORT", "FIRE_AND_FORGET"), input()).await.unwrap();

        assert_eq!(exec.status, ExecutionStatus::Succeeded);
        let t2 = exec.entry("T2").unwrap();
        assert_eq!(t2.status, JobStatus::Running);
        assert!(t2.handle.is_some());
        assert!(t2.finished_at.is_none());
    }

    #[tokio::test]
    async fn test_task_timeout_cancels_job_and_applies_policy() {
        let s = services();
        s.etl.script("ingest-etl", vec![EtlRunState::Running]);
        let def = WorkflowDefinition::from_yaml(
            r"
startAt: Slow
states:
  Slow:
    type: task
    runnerKind: etl
    jobKind: ingest-etl
    timeoutSeconds: 1
    failurePolicy: CONTINUE
    end: true
",
        )
        .unwrap();
        let engine = WorkflowEngine::new(s.registry).with_config(quick_config());

        let exec = engine.run(&def, input()).await.unwrap();

        assert_eq!(exec.status, ExecutionStatus::Succeeded);
        let slow = exec.entry("Slow").unwrap();
        assert_eq!(slow.status, JobStatus::Failed);
        assert!(slow.continued);
        assert_eq!(slow.error.as_ref().map(|e| e.kind), Some(ErrorKind::Timeout));
        assert_eq!(s.etl.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_execution_timeout_fails_execution() {
        let s = services();
        s.etl.script("ingest-etl", vec![EtlRunState::Running]);
        let engine = WorkflowEngine::new(s.registry)
            .with_config(quick_config().with_execution_timeout(Duration::from_secs(1)));

        let exec = engine.run(&pipeline("CONTINUE", "SYNC"), input()).await.unwrap();

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.history.len(), 1);
        assert_eq!(exec.error.as_ref().map(|e| e.kind), Some(ErrorKind::Timeout));
        assert_eq!(exec.error.as_ref().map(|e| e.entity.as_str()), Some(exec.id.as_str()));
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_active_job() {
        let s = services();
        s.etl.script("ingest-etl", vec![EtlRunState::Running]);
        let engine = Arc::new(WorkflowEngine::new(s.registry).with_config(quick_config()));

        let id = engine
            .start_with_id("exec-cancel", Arc::new(pipeline("CONTINUE", "SYNC")), input())
            .unwrap();
        for _ in 0..200 {
            if engine.execution(&id).and_then(|e| e.active_job).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(engine.cancel(&id, "operator request"));
        assert!(!engine.cancel(&id, "again"));
        engine.drain().await;

        let exec = engine.execution(&id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.history.len(), 1);
        assert_eq!(exec.history[0].status, JobStatus::Cancelled);
        assert_eq!(exec.error.as_ref().map(|e| e.kind), Some(ErrorKind::Cancelled));
        assert_eq!(s.etl.stop_calls(), 1);
        assert!(s.cluster.last_step().is_none());
        assert!(!engine.cancel(&id, "after the fact"));
    }

    #[tokio::test]
    async fn test_unknown_runner_fails_task() {
        let engine = WorkflowEngine::new(RunnerRegistry::new()).with_config(quick_config());
        let exec = engine.run(&pipeline("ABORT", "SYNC"), input()).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.error.unwrap().message.contains("no runner registered"));
    }

    /// Runner that tracks how many of its jobs are unfinished at once.
    #[derive(Default)]
    struct OverlapRunner {
        polls_left: Mutex<HashMap<String, usize>>,
        live: AtomicUsize,
        max_live: AtomicUsize,
        submitted: AtomicUsize,
    }

    #[async_trait]
    impl JobRunner for OverlapRunner {
        fn kind(&self) -> RunnerKind {
            RunnerKind::Etl
        }

        async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, JobError> {
            let n = self.submitted.fetch_add(1, Ordering::SeqCst);
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_live.fetch_max(live, Ordering::SeqCst);
            let id = format!("{}-{n}", spec.job_kind);
            self.polls_left.lock().insert(id.clone(), 3);
            Ok(JobHandle::new(RunnerKind::Etl, id, Some(spec.job_kind.clone())))
        }

        async fn poll(&self, handle: &JobHandle) -> Result<JobStatus, JobError> {
            let mut polls = self.polls_left.lock();
            let left = polls.get_mut(&handle.native_id).ok_or_else(|| JobError::UnknownHandle(handle.to_string()))?;
            if *left == 0 {
                return Ok(JobStatus::Succeeded);
            }
            *left -= 1;
            if *left == 0 {
                self.live.fetch_sub(1, Ordering::SeqCst);
                return Ok(JobStatus::Succeeded);
            }
            Ok(JobStatus::Running)
        }

        async fn cancel(&self, _handle: &JobHandle) -> Result<(), JobError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_at_most_one_active_job_per_execution() {
        let runner = Arc::new(OverlapRunner::default());
        let engine = WorkflowEngine::new(RunnerRegistry::new().with_runner(runner.clone())).with_config(quick_config());
        let def = WorkflowDefinition::from_yaml(
            r"
startAt: A
states:
  A: {type: task, runnerKind: etl, next: B}
  B: {type: task, runnerKind: etl, next: C}
  C: {type: task, runnerKind: etl, end: true}
",
        )
        .unwrap();

        let exec = engine.run(&def, serde_json::json!({})).await.unwrap();

        assert_eq!(exec.status, ExecutionStatus::Succeeded);
        assert_eq!(runner.submitted.load(Ordering::SeqCst), 3);
        assert_eq!(runner.max_live.load(Ordering::SeqCst), 1);
    }

    /// Loses track of its first job: every poll of it errors.
    #[derive(Default)]
    struct LostJobRunner {
        submitted: AtomicUsize,
        cancelled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobRunner for LostJobRunner {
        fn kind(&self) -> RunnerKind {
            RunnerKind::Etl
        }

        async fn submit(&self, _spec: &JobSpec) -> Result<JobHandle, JobError> {
            let n = self.submitted.fetch_add(1, Ordering::SeqCst);
            Ok(JobHandle::new(RunnerKind::Etl, format!("run-{n}"), None))
        }

        async fn poll(&self, handle: &JobHandle) -> Result<JobStatus, JobError> {
            if handle.native_id == "run-0" {
                return Err(JobError::UnknownHandle(handle.to_string()));
            }
            Ok(JobStatus::Succeeded)
        }

        async fn cancel(&self, handle: &JobHandle) -> Result<(), JobError> {
            self.cancelled.lock().push(handle.native_id.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_poll_failure_cancels_job_before_continuing() {
        let runner = Arc::new(LostJobRunner::default());
        let engine = WorkflowEngine::new(RunnerRegistry::new().with_runner(runner.clone())).with_config(quick_config());
        let def = WorkflowDefinition::from_yaml(
            r"
startAt: A
states:
  A: {type: task, runnerKind: etl, failurePolicy: CONTINUE, next: B}
  B: {type: task, runnerKind: etl, end: true}
",
        )
        .unwrap();

        let exec = engine.run(&def, serde_json::json!({})).await.unwrap();

        assert_eq!(exec.status, ExecutionStatus::Succeeded);
        assert_eq!(
            exec.history.iter().map(|e| (e.state.as_str(), e.status)).collect::<Vec<_>>(),
            vec![("A", JobStatus::Failed), ("B", JobStatus::Succeeded)]
        );
        assert_eq!(*runner.cancelled.lock(), vec!["run-0".to_string()]);
        assert_eq!(runner.submitted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_executions_are_independent() {
        let s = services();
        s.etl.script("ingest-etl", vec![EtlRunState::Running, EtlRunState::Succeeded]);
        let engine = Arc::new(WorkflowEngine::new(s.registry).with_config(quick_config()));
        let def = Arc::new(pipeline("ABORT", "SYNC"));

        let ids: Vec<String> = (0..4)
            .map(|i| {
                engine
                    .start(def.clone(), serde_json::json!({"Bucket": "ingest", "Key": format!("k{i}")}))
                    .unwrap()
            })
            .collect();
        engine.drain().await;

        for id in &ids {
            assert_eq!(engine.execution(id).map(|e| e.status), Some(ExecutionStatus::Succeeded));
        }
        assert_eq!(s.etl.start_calls(), 4);
        assert_eq!(engine.executions().list().len(), 4);
    }

    #[tokio::test]
    async fn test_duplicate_execution_id_rejected() {
        let s = services();
        let engine = Arc::new(WorkflowEngine::new(s.registry).with_config(quick_config()));
        let def = Arc::new(pipeline("ABORT", "SYNC"));
        engine.start_with_id("same", def.clone(), input()).unwrap();
        assert!(engine.start_with_id("same", def, input()).is_err());
        engine.drain().await;
    }
}
