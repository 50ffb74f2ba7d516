//! Lookup of job runners by kind.

use super::adapter::{JobRunner, RunnerKind};
use std::collections::HashMap;
use std::sync::Arc;

/// Maps each [`RunnerKind`] to the runner that handles it.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: HashMap<RunnerKind, Arc<dyn JobRunner>>,
}

impl RunnerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a runner under its own kind, replacing any previous one.
    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn JobRunner>) -> Self {
        self.register(runner);
        self
    }

    /// Registers a runner under its own kind, replacing any previous one.
    pub fn register(&mut self, runner: Arc<dyn JobRunner>) {
        self.runners.insert(runner.kind(), runner);
    }

    /// Returns the runner for `kind`.
    #[must_use]
    pub fn get(&self, kind: RunnerKind) -> Option<Arc<dyn JobRunner>> {
        self.runners.get(&kind).cloned()
    }

    /// Returns true if a runner is registered for `kind`.
    #[must_use]
    pub fn contains(&self, kind: RunnerKind) -> bool {
        self.runners.contains_key(&kind)
    }
}

impl std::fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerRegistry")
            .field("kinds", &self.runners.keys().collect::<Vec<_>>())
            .finish()
    }
}
