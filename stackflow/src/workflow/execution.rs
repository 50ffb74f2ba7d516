//! Workflow execution records and their registry.

use super::definition::WorkflowDefinition;
use crate::cancellation::CancellationToken;
use crate::core::{ExecutionStatus, JobStatus};
use crate::errors::ErrorRecord;
use crate::jobs::JobHandle;
use crate::utils::{now_utc, Timestamp};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Position of an execution in its chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "state", rename_all = "snake_case")]
pub enum Cursor {
    /// About to run, or running, the named state.
    At(String),
    /// Past the end of the chain; the execution is terminal.
    Done,
}

/// The job an execution is currently waiting on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveJob {
    /// Task state that submitted the job.
    pub task: String,
    /// The job.
    pub handle: JobHandle,
}

/// One task's record in an execution's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Task state name.
    pub state: String,
    /// The submitted job; absent when submission itself failed.
    pub handle: Option<JobHandle>,
    /// Last observed status. RUNNING for fire-and-forget tasks.
    pub status: JobStatus,
    /// The task failed and the execution advanced under CONTINUE.
    pub continued: bool,
    /// Failure detail.
    pub error: Option<ErrorRecord>,
    /// When the task started.
    pub started_at: Timestamp,
    /// When the engine stopped tracking the task.
    pub finished_at: Option<Timestamp>,
}

/// A single run of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Execution id.
    pub id: String,
    /// Name of the definition being run.
    pub definition: String,
    /// Input document, bound into task parameters.
    pub input: serde_json::Value,
    /// Current position.
    pub current: Cursor,
    /// At most one in-flight job.
    pub active_job: Option<ActiveJob>,
    /// Overall status.
    pub status: ExecutionStatus,
    /// Creation time.
    pub started_at: Timestamp,
    /// Set once terminal.
    pub ended_at: Option<Timestamp>,
    /// Completed and detached tasks in order.
    pub history: Vec<HistoryEntry>,
    /// The error that failed the execution.
    pub error: Option<ErrorRecord>,
}

impl WorkflowExecution {
    /// Creates a RUNNING execution positioned at the definition's start state.
    #[must_use]
    pub fn new(id: impl Into<String>, definition: &WorkflowDefinition, input: serde_json::Value) -> Self {
        let current = definition
            .start()
            .map_or(Cursor::Done, |start| Cursor::At(start.name.clone()));
        Self {
            id: id.into(),
            definition: definition.name().to_string(),
            input,
            current,
            active_job: None,
            status: ExecutionStatus::Running,
            started_at: now_utc(),
            ended_at: None,
            history: Vec::new(),
            error: None,
        }
    }

    /// Returns the state the execution is positioned at.
    #[must_use]
    pub fn current_state(&self) -> Option<&str> {
        match &self.current {
            Cursor::At(name) => Some(name),
            Cursor::Done => None,
        }
    }

    /// Returns true once the execution can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns the history entry for `state`, if it ran.
    #[must_use]
    pub fn entry(&self, state: &str) -> Option<&HistoryEntry> {
        self.history.iter().find(|e| e.state == state)
    }

    pub(crate) fn advance_to(&mut self, next: Option<&str>) {
        match next {
            Some(name) => self.current = Cursor::At(name.to_string()),
            None => {
                self.current = Cursor::Done;
                self.status = ExecutionStatus::Succeeded;
                self.ended_at = Some(now_utc());
            }
        }
    }

    pub(crate) fn fail(&mut self, error: ErrorRecord) {
        self.current = Cursor::Done;
        self.active_job = None;
        self.status = ExecutionStatus::Failed;
        self.ended_at = Some(now_utc());
        self.error.get_or_insert(error);
    }
}

/// An execution plus its cancellation token.
///
/// The record is only touched through short closures so the lock is never
/// held across an await.
#[derive(Debug)]
pub struct ExecutionSlot {
    execution: Mutex<WorkflowExecution>,
    token: CancellationToken,
}

impl ExecutionSlot {
    fn new(execution: WorkflowExecution) -> Self {
        Self {
            execution: Mutex::new(execution),
            token: CancellationToken::new(),
        }
    }

    /// Returns a copy of the record.
    #[must_use]
    pub fn snapshot(&self) -> WorkflowExecution {
        self.execution.lock().clone()
    }

    /// Applies `f` to the record under its lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut WorkflowExecution) -> R) -> R {
        f(&mut self.execution.lock())
    }

    /// The execution's cancellation token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Registry of executions keyed by id.
#[derive(Debug, Default)]
pub struct ExecutionStore {
    slots: DashMap<String, Arc<ExecutionSlot>>,
}

impl ExecutionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an execution. Returns `None` if the id is taken.
    pub fn insert(&self, execution: WorkflowExecution) -> Option<Arc<ExecutionSlot>> {
        match self.slots.entry(execution.id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let slot = Arc::new(ExecutionSlot::new(execution));
                vacant.insert(slot.clone());
                Some(slot)
            }
        }
    }

    /// Returns the slot for `id`.
    #[must_use]
    pub fn slot(&self, id: &str) -> Option<Arc<ExecutionSlot>> {
        self.slots.get(id).map(|s| s.value().clone())
    }

    /// Returns a snapshot of the execution `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<WorkflowExecution> {
        self.slot(id).map(|s| s.snapshot())
    }

    /// Returns snapshots of every execution, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<WorkflowExecution> {
        let mut all: Vec<WorkflowExecution> = self.slots.iter().map(|s| s.snapshot()).collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Number of registered executions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if no executions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Removes a terminal execution. Running executions are kept.
    pub fn purge(&self, id: &str) -> Option<WorkflowExecution> {
        self.slots
            .remove_if(id, |_, slot| slot.snapshot().is_terminal())
            .map(|(_, slot)| slot.snapshot())
    }

    /// Removes every terminal execution and returns how many were removed.
    pub fn purge_finished(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.snapshot().is_terminal());
        before - self.slots.len()
    }
}
