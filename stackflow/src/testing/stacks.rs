//! In-memory stack backend with scripted behaviour.

use crate::core::ResourceStatus;
use crate::errors::StackflowError;
use crate::stacks::{synthesize_outputs, ResourceGroupSpec, StackBackend};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Default)]
struct Group {
    status: ResourceStatus,
    polls_until_settled: u32,
    settles_to: ResourceStatus,
    outputs: BTreeMap<String, String>,
    imports: BTreeMap<String, String>,
    fingerprint: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    groups: HashMap<String, Group>,
    fail_next_deploy: HashSet<String>,
    transient: HashMap<String, u32>,
    deploy_calls: HashMap<String, usize>,
    delete_calls: HashMap<String, usize>,
    total_calls: usize,
}

impl Inner {
    fn call(&mut self, operation: &str) -> Result<(), StackflowError> {
        self.total_calls += 1;
        match self.transient.get_mut(operation) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(StackflowError::transient(operation, "simulated throttling"))
            }
            _ => Ok(()),
        }
    }
}

/// A [`StackBackend`] that keeps groups in memory.
///
/// A deploy reports IN_PROGRESS for a configurable number of status polls
/// and then HEALTHY, or FAILED when a failure was scripted with
/// [`fail_next_deploy`](Self::fail_next_deploy). Deletes settle to ABSENT
/// after one IN_PROGRESS poll. Outputs are synthesized from the declared
/// resources.
#[derive(Debug)]
pub struct SimulatedStackBackend {
    deploy_polls: u32,
    inner: Mutex<Inner>,
}

impl Default for SimulatedStackBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedStackBackend {
    /// Creates a backend where deploys settle after one IN_PROGRESS poll.
    #[must_use]
    pub fn new() -> Self {
        Self {
            deploy_polls: 1,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Sets how many status polls a deploy stays IN_PROGRESS.
    #[must_use]
    pub fn with_deploy_polls(mut self, polls: u32) -> Self {
        self.deploy_polls = polls;
        self
    }

    /// Forces the live status of a group.
    pub fn set_status(&self, group_id: &str, status: ResourceStatus) {
        let mut inner = self.inner.lock();
        let group = inner.groups.entry(group_id.to_string()).or_default();
        group.status = status;
        group.settles_to = status;
        group.polls_until_settled = 0;
    }

    /// Makes the next deploy of `group_id` end FAILED.
    pub fn fail_next_deploy(&self, group_id: &str) {
        self.inner.lock().fail_next_deploy.insert(group_id.to_string());
    }

    /// Makes the next `count` calls of `operation` fail transiently.
    ///
    /// Operations are named after the trait methods: `describe_status`,
    /// `deploy`, `delete`, `outputs` and `deployed_fingerprint`.
    pub fn inject_transient_failures(&self, operation: &str, count: u32) {
        self.inner.lock().transient.insert(operation.to_string(), count);
    }

    /// Number of deploys issued for a group.
    #[must_use]
    pub fn deploy_calls(&self, group_id: &str) -> usize {
        self.inner.lock().deploy_calls.get(group_id).copied().unwrap_or(0)
    }

    /// Number of deletes issued for a group.
    #[must_use]
    pub fn delete_calls(&self, group_id: &str) -> usize {
        self.inner.lock().delete_calls.get(group_id).copied().unwrap_or(0)
    }

    /// Import values passed to the last deploy of a group.
    #[must_use]
    pub fn last_imports(&self, group_id: &str) -> BTreeMap<String, String> {
        self.inner
            .lock()
            .groups
            .get(group_id)
            .map(|g| g.imports.clone())
            .unwrap_or_default()
    }

    /// Number of backend calls of any kind.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.inner.lock().total_calls
    }
}

#[async_trait]
impl StackBackend for SimulatedStackBackend {
    async fn describe_status(&self, group_id: &str) -> Result<ResourceStatus, StackflowError> {
        let mut inner = self.inner.lock();
        inner.call("describe_status")?;
        let Some(group) = inner.groups.get_mut(group_id) else {
            return Ok(ResourceStatus::Absent);
        };
        if group.status == ResourceStatus::InProgress {
            if group.polls_until_settled == 0 {
                group.status = group.settles_to;
            } else {
                group.polls_until_settled = group.polls_until_settled.saturating_sub(1);
            }
        }
        Ok(group.status)
    }

    async fn deploy(
        &self,
        spec: &ResourceGroupSpec,
        imports: &BTreeMap<String, String>,
    ) -> Result<(), StackflowError> {
        let mut inner = self.inner.lock();
        inner.call("deploy")?;
        *inner.deploy_calls.entry(spec.id.clone()).or_default() += 1;
        let fails = inner.fail_next_deploy.remove(&spec.id);

        let polls = self.deploy_polls;
        let group = inner.groups.entry(spec.id.clone()).or_default();
        group.imports = imports.clone();
        group.status = ResourceStatus::InProgress;
        group.polls_until_settled = polls;
        if fails {
            group.settles_to = ResourceStatus::Failed;
            group.outputs.clear();
            group.fingerprint = None;
        } else {
            group.settles_to = ResourceStatus::Healthy;
            group.outputs = synthesize_outputs(spec);
            group.fingerprint = Some(spec.fingerprint());
        }
        Ok(())
    }

    async fn delete(&self, group_id: &str) -> Result<(), StackflowError> {
        let mut inner = self.inner.lock();
        inner.call("delete")?;
        *inner.delete_calls.entry(group_id.to_string()).or_default() += 1;
        if let Some(group) = inner.groups.get_mut(group_id) {
            group.status = ResourceStatus::InProgress;
            group.settles_to = ResourceStatus::Absent;
            group.polls_until_settled = 1;
            group.outputs.clear();
            group.fingerprint = None;
        }
        Ok(())
    }

    async fn outputs(&self, group_id: &str) -> Result<BTreeMap<String, String>, StackflowError> {
        let mut inner = self.inner.lock();
        inner.call("outputs")?;
        Ok(inner
            .groups
            .get(group_id)
            .map(|g| g.outputs.clone())
            .unwrap_or_default())
    }

    async fn deployed_fingerprint(&self, group_id: &str) -> Result<Option<String>, StackflowError> {
        let mut inner = self.inner.lock();
        inner.call("deployed_fingerprint")?;
        Ok(inner.groups.get(group_id).and_then(|g| g.fingerprint.clone()))
    }
}
