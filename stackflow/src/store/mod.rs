//! Record of declared resource groups, their last observed status and the
//! values they export.
//!
//! The reconciler is the only writer of [`ResourceGroupState`]. Everything
//! else reads through a [`StateReader`].

mod exports;

pub use exports::{ExportRegistry, ExportedValue};

use crate::core::ResourceStatus;
use crate::errors::{ErrorRecord, StackflowError};
use crate::stacks::ResourceGroupSpec;
use crate::utils::{now_utc, Timestamp};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Last observed state of a resource group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceGroupState {
    /// Group id.
    pub id: String,
    /// Current status.
    pub status: ResourceStatus,
    /// When `status` last changed.
    pub last_transition: Timestamp,
    /// Fingerprint of the declaration that was last deployed successfully.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_fingerprint: Option<String>,
    /// Why the group is FAILED, if it is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    /// Backend outputs from the last healthy observation.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

impl ResourceGroupState {
    /// Creates a state that has never been observed.
    #[must_use]
    pub fn absent(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ResourceStatus::Absent,
            last_transition: now_utc(),
            deployed_fingerprint: None,
            error: None,
            outputs: BTreeMap::new(),
        }
    }

    /// Moves to `status`, touching the transition time only on change.
    pub fn transition(&mut self, status: ResourceStatus) {
        if self.status != status {
            self.status = status;
            self.last_transition = now_utc();
        }
        if status != ResourceStatus::Failed {
            self.error = None;
        }
    }

    /// Returns true if the group is HEALTHY.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == ResourceStatus::Healthy
    }
}

/// Storage for declared specs and observed states.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Declares or replaces a spec.
    async fn put_spec(&self, spec: ResourceGroupSpec) -> Result<(), StackflowError>;

    /// Returns the declared spec for `id`.
    async fn spec(&self, id: &str) -> Result<Option<ResourceGroupSpec>, StackflowError>;

    /// Returns all declared specs in declaration order.
    async fn specs(&self) -> Result<Vec<ResourceGroupSpec>, StackflowError>;

    /// Returns the last recorded state for `id`.
    async fn state(&self, id: &str) -> Result<Option<ResourceGroupState>, StackflowError>;

    /// Records a state.
    async fn put_state(&self, state: ResourceGroupState) -> Result<(), StackflowError>;

    /// Returns all recorded states.
    async fn states(&self) -> Result<Vec<ResourceGroupState>, StackflowError>;
}

/// In-memory [`ResourceStore`].
#[derive(Debug, Default)]
pub struct InMemoryResourceStore {
    specs: RwLock<Vec<ResourceGroupSpec>>,
    states: RwLock<HashMap<String, ResourceGroupState>>,
}

impl InMemoryResourceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store with `specs` already declared.
    #[must_use]
    pub fn with_specs(specs: Vec<ResourceGroupSpec>) -> Self {
        Self {
            specs: RwLock::new(specs),
            states: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn put_spec(&self, spec: ResourceGroupSpec) -> Result<(), StackflowError> {
        let mut specs = self.specs.write();
        match specs.iter_mut().find(|s| s.id == spec.id) {
            Some(existing) => *existing = spec,
            None => specs.push(spec),
        }
        Ok(())
    }

    async fn spec(&self, id: &str) -> Result<Option<ResourceGroupSpec>, StackflowError> {
        Ok(self.specs.read().iter().find(|s| s.id == id).cloned())
    }

    async fn specs(&self) -> Result<Vec<ResourceGroupSpec>, StackflowError> {
        Ok(self.specs.read().clone())
    }

    async fn state(&self, id: &str) -> Result<Option<ResourceGroupState>, StackflowError> {
        Ok(self.states.read().get(id).cloned())
    }

    async fn put_state(&self, state: ResourceGroupState) -> Result<(), StackflowError> {
        self.states.write().insert(state.id.clone(), state);
        Ok(())
    }

    async fn states(&self) -> Result<Vec<ResourceGroupState>, StackflowError> {
        let mut states: Vec<_> = self.states.read().values().cloned().collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(states)
    }
}

/// Read-only view of recorded states.
#[derive(Clone)]
pub struct StateReader {
    store: Arc<dyn ResourceStore>,
}

impl StateReader {
    /// Wraps a store.
    #[must_use]
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    /// Returns the state of `id`, or ABSENT if it was never recorded.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn state(&self, id: &str) -> Result<ResourceGroupState, StackflowError> {
        Ok(self
            .store
            .state(id)
            .await?
            .unwrap_or_else(|| ResourceGroupState::absent(id)))
    }

    /// Returns true if `id` is HEALTHY.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn is_healthy(&self, id: &str) -> Result<bool, StackflowError> {
        Ok(self.state(id).await?.is_healthy())
    }

    /// Returns every recorded state.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn all(&self) -> Result<Vec<ResourceGroupState>, StackflowError> {
        self.store.states().await
    }
}

impl std::fmt::Debug for StateReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateReader").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stacks::StackTier;

    #[tokio::test]
    async fn test_put_spec_replaces_in_place() {
        let store = InMemoryResourceStore::with_specs(vec![
            ResourceGroupSpec::new("network", StackTier::Network),
            ResourceGroupSpec::new("storage", StackTier::Storage),
        ]);
        store
            .put_spec(ResourceGroupSpec::new("network", StackTier::Network).depends_on("x"))
            .await
            .unwrap();

        let specs = store.specs().await.unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].id, "network");
        assert_eq!(specs[0].depends_on, vec!["x"]);
    }

    #[tokio::test]
    async fn test_reader_defaults_to_absent() {
        let store: Arc<dyn ResourceStore> = Arc::new(InMemoryResourceStore::new());
        let reader = StateReader::new(store.clone());

        let state = reader.state("network").await.unwrap();
        assert_eq!(state.status, ResourceStatus::Absent);
        assert!(!reader.is_healthy("network").await.unwrap());

        let mut healthy = ResourceGroupState::absent("network");
        healthy.transition(ResourceStatus::Healthy);
        store.put_state(healthy).await.unwrap();
        assert!(reader.is_healthy("network").await.unwrap());
        assert_eq!(reader.all().await.unwrap().len(), 1);
    }

    #[test]
    fn test_transition_keeps_timestamp_when_unchanged() {
        let mut state = ResourceGroupState::absent("a");
        state.transition(ResourceStatus::Healthy);
        let first = state.last_transition;
        state.transition(ResourceStatus::Healthy);
        assert_eq!(state.last_transition, first);
    }

    #[test]
    fn test_transition_clears_error_when_leaving_failed() {
        let mut state = ResourceGroupState::absent("a");
        state.transition(ResourceStatus::Failed);
        state.error = Some(StackflowError::provisioning("a", "boom").to_record("a"));
        state.transition(ResourceStatus::InProgress);
        assert!(state.error.is_none());
    }
}
