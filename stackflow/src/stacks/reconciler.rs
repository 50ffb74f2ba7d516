//! Drives declared resource groups to HEALTHY.

use super::backend::StackBackend;
use super::plan::StackPlan;
use super::spec::ResourceGroupSpec;
use crate::core::ResourceStatus;
use crate::errors::{ErrorKind, ErrorRecord, StackflowError};
use crate::events::{names, EventSink, NoOpEventSink};
use crate::polling::{wait_until, with_retry, PollConfig, RetryConfig, WaitOutcome};
use crate::store::{ExportRegistry, ResourceGroupState, ResourceStore, StateReader};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Reconciler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Upper bound for one group's reconcile, delete and redeploy included.
    #[serde(default = "default_group_timeout_secs")]
    pub group_timeout_secs: u64,
    /// Status polling cadence.
    #[serde(default)]
    pub poll: PollConfig,
    /// Retry policy for transient backend errors.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_group_timeout_secs() -> u64 {
    1800
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            group_timeout_secs: default_group_timeout_secs(),
            poll: PollConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl ReconcilerConfig {
    /// Sets the per-group timeout.
    #[must_use]
    pub fn with_group_timeout(mut self, timeout: Duration) -> Self {
        self.group_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Sets the poll cadence.
    #[must_use]
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// The per-group timeout.
    #[must_use]
    pub fn group_timeout(&self) -> Duration {
        Duration::from_secs(self.group_timeout_secs)
    }
}

/// Outcome of reconciling a whole plan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Final state of every attempted group, in plan order.
    pub groups: Vec<ResourceGroupState>,
    /// Groups skipped because an earlier group failed.
    pub not_attempted: Vec<String>,
    /// The first failure, if any.
    pub first_error: Option<ErrorRecord>,
}

impl ReconcileReport {
    /// Returns true if every group is HEALTHY.
    #[must_use]
    pub fn success(&self) -> bool {
        self.first_error.is_none() && self.groups.iter().all(ResourceGroupState::is_healthy)
    }

    /// Looks up an attempted group's state.
    #[must_use]
    pub fn state(&self, id: &str) -> Option<&ResourceGroupState> {
        self.groups.iter().find(|g| g.id == id)
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for group in &self.groups {
            writeln!(f, "{:<24} {}", group.id, group.status)?;
        }
        for id in &self.not_attempted {
            writeln!(f, "{id:<24} NOT_ATTEMPTED")?;
        }
        if let Some(error) = &self.first_error {
            writeln!(f, "{} {}", error.kind, error.entity)?;
        }
        Ok(())
    }
}

/// Brings resource groups to HEALTHY through a [`StackBackend`].
///
/// Reconciles of the same group are serialized; different groups may be
/// reconciled concurrently.
pub struct Reconciler {
    backend: Arc<dyn StackBackend>,
    store: Arc<dyn ResourceStore>,
    exports: Arc<ExportRegistry>,
    config: ReconcilerConfig,
    event_sink: Arc<dyn EventSink>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Reconciler {
    /// Creates a reconciler with default settings.
    #[must_use]
    pub fn new(backend: Arc<dyn StackBackend>, store: Arc<dyn ResourceStore>) -> Self {
        Self {
            backend,
            store,
            exports: Arc::new(ExportRegistry::new()),
            config: ReconcilerConfig::default(),
            event_sink: Arc::new(NoOpEventSink),
            locks: DashMap::new(),
        }
    }

    /// Sets the config.
    #[must_use]
    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Shares an existing export registry.
    #[must_use]
    pub fn with_exports(mut self, exports: Arc<ExportRegistry>) -> Self {
        self.exports = exports;
        self
    }

    /// Read-only view of recorded group states.
    #[must_use]
    pub fn state_reader(&self) -> StateReader {
        StateReader::new(self.store.clone())
    }

    /// The export registry this reconciler publishes to.
    #[must_use]
    pub fn exports(&self) -> Arc<ExportRegistry> {
        self.exports.clone()
    }

    /// Reconciles one group and returns its final state.
    ///
    /// An absent group is deployed. A present group that is not HEALTHY is
    /// deleted, waited on until ABSENT, then deployed. A HEALTHY group is left
    /// alone unless its declared spec changed since the last deploy.
    /// Failures never escape; they end up as a FAILED state with an error.
    pub async fn reconcile(&self, spec: &ResourceGroupSpec) -> ResourceGroupState {
        let lock = self.locks.entry(spec.id.clone()).or_default().clone();
        let _guard = lock.lock().await;

        tracing::info!(group = %spec.id, tier = %spec.tier, "Reconciling resource group");
        self.emit(names::STACK_RECONCILING, &spec.id, None).await;

        let deadline = Instant::now() + self.config.group_timeout();
        let mut state = match self.store.state(&spec.id).await {
            Ok(Some(state)) => state,
            Ok(None) => ResourceGroupState::absent(&spec.id),
            Err(e) => {
                tracing::warn!(group = %spec.id, error = %e, "Could not load recorded state");
                ResourceGroupState::absent(&spec.id)
            }
        };

        match self.converge(spec, &mut state, deadline).await {
            Ok(()) => {
                state.transition(ResourceStatus::Healthy);
                tracing::info!(group = %spec.id, "Resource group healthy");
                self.emit(names::STACK_HEALTHY, &spec.id, None).await;
            }
            Err(err) => {
                let record = err.to_record(&spec.id);
                state.transition(ResourceStatus::Failed);
                state.error = Some(record.clone());
                tracing::error!(group = %spec.id, kind = %record.kind, error = %err, "Resource group failed");
                self.emit(
                    names::STACK_FAILED,
                    &spec.id,
                    Some(serde_json::json!({ "kind": record.kind, "message": record.message })),
                )
                .await;
            }
        }

        self.save(&state).await;
        state
    }

    /// Reconciles every group of `plan` in order.
    ///
    /// The run stops at the first group that does not reach HEALTHY; later
    /// groups are reported as not attempted.
    pub async fn reconcile_all(&self, plan: &StackPlan) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for spec in plan.iter() {
            if report.first_error.is_some() {
                self.emit(names::STACK_SKIPPED, &spec.id, None).await;
                report.not_attempted.push(spec.id.clone());
                continue;
            }

            let state = self.reconcile(spec).await;
            if !state.is_healthy() {
                report.first_error = Some(state.error.clone().unwrap_or_else(|| {
                    ErrorRecord::new(
                        ErrorKind::Provisioning,
                        &spec.id,
                        format!("ended {}", state.status),
                    )
                }));
            }
            report.groups.push(state);
        }

        if let Some(error) = &report.first_error {
            tracing::warn!(
                failed = %error.entity,
                skipped = report.not_attempted.len(),
                "Reconcile run aborted"
            );
        } else {
            tracing::info!(groups = report.groups.len(), "Reconcile run complete");
        }
        report
    }

    /// Plans and reconciles every spec declared in the store.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the declared specs do not form a
    /// valid plan, or the store's error.
    pub async fn reconcile_declared(&self) -> Result<ReconcileReport, StackflowError> {
        let specs = self.store.specs().await?;
        let plan = StackPlan::new(specs)?;
        Ok(self.reconcile_all(&plan).await)
    }

    async fn converge(
        &self,
        spec: &ResourceGroupSpec,
        state: &mut ResourceGroupState,
        deadline: Instant,
    ) -> Result<(), StackflowError> {
        let fingerprint = spec.fingerprint();
        let observed = self.describe(&spec.id).await?;
        tracing::debug!(group = %spec.id, status = %observed, "Observed status");

        match observed {
            ResourceStatus::Healthy => {
                let deployed = match state.deployed_fingerprint.clone() {
                    Some(deployed) => Some(deployed),
                    None => {
                        with_retry(&self.config.retry, "deployed_fingerprint", || {
                            self.backend.deployed_fingerprint(&spec.id)
                        })
                        .await?
                    }
                };
                let drifted = deployed.is_some_and(|deployed| deployed != fingerprint);
                if drifted {
                    tracing::info!(group = %spec.id, "Declared spec changed; updating");
                    self.deploy_and_wait(spec, state, deadline).await?;
                } else {
                    self.emit(names::STACK_UNCHANGED, &spec.id, None).await;
                }
            }
            ResourceStatus::Absent => {
                self.deploy_and_wait(spec, state, deadline).await?;
            }
            ResourceStatus::InProgress | ResourceStatus::Degraded | ResourceStatus::Failed => {
                state.transition(observed);
                self.delete_and_wait(spec, state, deadline).await?;
                self.deploy_and_wait(spec, state, deadline).await?;
            }
        }

        state.deployed_fingerprint = Some(fingerprint);
        self.publish_exports(spec, state).await
    }

    async fn deploy_and_wait(
        &self,
        spec: &ResourceGroupSpec,
        state: &mut ResourceGroupState,
        deadline: Instant,
    ) -> Result<(), StackflowError> {
        let imports = self.exports.resolve_all(&spec.imports).map_err(|missing| {
            StackflowError::provisioning(
                &spec.id,
                format!("unresolved imports: {}", missing.join(", ")),
            )
        })?;

        state.transition(ResourceStatus::InProgress);
        self.save(state).await;
        self.emit(names::STACK_DEPLOYING, &spec.id, None).await;

        with_retry(&self.config.retry, "deploy", || {
            self.backend.deploy(spec, &imports)
        })
        .await?;

        let id = spec.id.as_str();
        let outcome: WaitOutcome<(), StackflowError> =
            wait_until(&self.config.poll, remaining(deadline), None, || async move {
                match self.describe(id).await? {
                    ResourceStatus::Healthy => Ok(Some(())),
                    ResourceStatus::Absent => Err(StackflowError::provisioning(
                        id,
                        "deploy was rolled back; the group is absent",
                    )),
                    status @ (ResourceStatus::Failed | ResourceStatus::Degraded) => Err(
                        StackflowError::provisioning(id, format!("backend reported {status} after deploy")),
                    ),
                    ResourceStatus::InProgress => Ok(None),
                }
            })
            .await;
        self.settle(outcome, id)
    }

    async fn delete_and_wait(
        &self,
        spec: &ResourceGroupSpec,
        state: &mut ResourceGroupState,
        deadline: Instant,
    ) -> Result<(), StackflowError> {
        tracing::info!(group = %spec.id, status = %state.status, "Deleting unhealthy resource group");
        self.emit(
            names::STACK_DELETING,
            &spec.id,
            Some(serde_json::json!({ "observed": state.status })),
        )
        .await;
        self.exports.withdraw(&spec.id);
        state.deployed_fingerprint = None;

        let id = spec.id.as_str();
        with_retry(&self.config.retry, "delete", || self.backend.delete(id)).await?;

        let outcome = wait_until(&self.config.poll, remaining(deadline), None, || async move {
            Ok::<_, StackflowError>((self.describe(id).await? == ResourceStatus::Absent).then_some(()))
        })
        .await;
        self.settle(outcome, id)?;

        state.transition(ResourceStatus::Absent);
        state.outputs.clear();
        self.save(state).await;
        Ok(())
    }

    async fn publish_exports(
        &self,
        spec: &ResourceGroupSpec,
        state: &mut ResourceGroupState,
    ) -> Result<(), StackflowError> {
        let outputs = with_retry(&self.config.retry, "outputs", || self.backend.outputs(&spec.id)).await?;

        let mut values = BTreeMap::new();
        for export in &spec.exports {
            let key = export.output_key();
            let value = outputs.get(&key).ok_or_else(|| {
                StackflowError::provisioning(
                    &spec.id,
                    format!("backend reported no '{key}' output for export '{}'", export.name),
                )
            })?;
            values.insert(export.name.clone(), value.clone());
        }

        self.exports.publish(&spec.id, values);
        state.outputs = outputs;
        Ok(())
    }

    async fn describe(&self, group_id: &str) -> Result<ResourceStatus, StackflowError> {
        with_retry(&self.config.retry, "describe_status", || {
            self.backend.describe_status(group_id)
        })
        .await
    }

    fn settle(&self, outcome: WaitOutcome<(), StackflowError>, group_id: &str) -> Result<(), StackflowError> {
        match outcome {
            WaitOutcome::Ready(()) => Ok(()),
            WaitOutcome::TimedOut { .. } => Err(StackflowError::timeout(group_id, self.config.group_timeout())),
            WaitOutcome::Cancelled { reason } => Err(StackflowError::Cancelled(reason)),
            WaitOutcome::Failed(e) => Err(e),
        }
    }

    async fn save(&self, state: &ResourceGroupState) {
        if let Err(e) = self.store.put_state(state.clone()).await {
            tracing::warn!(group = %state.id, error = %e, "Could not record state");
        }
    }

    async fn emit(&self, event_type: &str, group_id: &str, extra: Option<serde_json::Value>) {
        let mut data = serde_json::json!({ "group": group_id });
        if let (Some(serde_json::Value::Object(extra)), Some(map)) = (extra, data.as_object_mut()) {
            map.extend(extra);
        }
        self.event_sink.emit(event_type, Some(data)).await;
    }
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .field("groups_locked", &self.locks.len())
            .finish_non_exhaustive()
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}
