//! Scripted job services.

use crate::jobs::{ClusterService, EtlRunState, EtlService, JobError, StepConfig, StepState};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Plays a list of states back one poll at a time, repeating the last.
#[derive(Debug, Clone)]
struct Playback<S> {
    pending: VecDeque<S>,
    last: S,
}

impl<S: Copy> Playback<S> {
    fn new(script: &[S], fallback: S) -> Self {
        let last = script.last().copied().unwrap_or(fallback);
        Self {
            pending: script.iter().copied().collect(),
            last,
        }
    }

    fn next(&mut self) -> S {
        match self.pending.pop_front() {
            Some(state) => {
                self.last = state;
                state
            }
            None => self.last,
        }
    }

    fn stop(&mut self, state: S) {
        self.pending.clear();
        self.last = state;
    }
}

fn take_transient(counter: &AtomicU32, operation: &str) -> Result<(), JobError> {
    let took = counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok();
    if took {
        Err(JobError::transient(operation, "simulated throttling"))
    } else {
        Ok(())
    }
}

/// An [`EtlService`] whose runs follow per-job scripts.
///
/// Every run of a job plays that job's script from the start; unscripted
/// jobs succeed on the first poll. Stopping a run makes it report STOPPED.
#[derive(Debug, Default)]
pub struct ScriptedEtlService {
    scripts: Mutex<HashMap<String, Vec<EtlRunState>>>,
    runs: Mutex<HashMap<String, Playback<EtlRunState>>>,
    transient: AtomicU32,
    reject_next: Mutex<Option<String>>,
    last_start: Mutex<Option<(String, BTreeMap<String, String>)>>,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    next_run: AtomicUsize,
}

impl ScriptedEtlService {
    /// Creates a service with no scripts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the states later runs of `job_name` report.
    pub fn script(&self, job_name: &str, states: Vec<EtlRunState>) {
        self.scripts.lock().insert(job_name.to_string(), states);
    }

    /// Makes the next `count` calls of any operation fail transiently.
    pub fn inject_transient_failures(&self, count: u32) {
        self.transient.store(count, Ordering::SeqCst);
    }

    /// Makes the next start fail with a non-transient rejection.
    pub fn reject_next_start(&self, message: &str) {
        *self.reject_next.lock() = Some(message.to_string());
    }

    /// Job name and arguments of the last accepted start.
    #[must_use]
    pub fn last_start(&self) -> Option<(String, BTreeMap<String, String>)> {
        self.last_start.lock().clone()
    }

    /// Number of start attempts, failed ones included.
    #[must_use]
    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    /// Number of stop requests.
    #[must_use]
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EtlService for ScriptedEtlService {
    async fn start_job_run(&self, job_name: &str, arguments: &BTreeMap<String, String>) -> Result<String, JobError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        take_transient(&self.transient, "start_job_run")?;
        if let Some(message) = self.reject_next.lock().take() {
            return Err(JobError::Rejected(message));
        }

        let run_id = format!("jr_{:04}", self.next_run.fetch_add(1, Ordering::SeqCst));
        let script = self.scripts.lock().get(job_name).cloned().unwrap_or_default();
        self.runs
            .lock()
            .insert(run_id.clone(), Playback::new(&script, EtlRunState::Succeeded));
        *self.last_start.lock() = Some((job_name.to_string(), arguments.clone()));
        Ok(run_id)
    }

    async fn get_job_run(&self, _job_name: &str, run_id: &str) -> Result<EtlRunState, JobError> {
        take_transient(&self.transient, "get_job_run")?;
        self.runs
            .lock()
            .get_mut(run_id)
            .map(Playback::next)
            .ok_or_else(|| JobError::UnknownHandle(run_id.to_string()))
    }

    async fn stop_job_run(&self, _job_name: &str, run_id: &str) -> Result<(), JobError> {
        take_transient(&self.transient, "stop_job_run")?;
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let mut runs = self.runs.lock();
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| JobError::UnknownHandle(run_id.to_string()))?;
        run.stop(EtlRunState::Stopped);
        Ok(())
    }
}

/// A [`ClusterService`] whose steps follow one shared script.
///
/// Steps added after [`script`](Self::script) play that script; without
/// one they complete on the first poll. Cancelling a step makes it report
/// CANCELLED.
#[derive(Debug, Default)]
pub struct ScriptedClusterService {
    script: Mutex<Vec<StepState>>,
    steps: Mutex<HashMap<String, Playback<StepState>>>,
    transient: AtomicU32,
    reject_next: Mutex<Option<String>>,
    last_step: Mutex<Option<StepConfig>>,
    add_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
    next_step: AtomicUsize,
}

impl ScriptedClusterService {
    /// Creates a service with no script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the states later steps report.
    pub fn script(&self, states: Vec<StepState>) {
        *self.script.lock() = states;
    }

    /// Makes the next `count` calls of any operation fail transiently.
    pub fn inject_transient_failures(&self, count: u32) {
        self.transient.store(count, Ordering::SeqCst);
    }

    /// Makes the next add fail with a non-transient rejection.
    pub fn reject_next_add(&self, message: &str) {
        *self.reject_next.lock() = Some(message.to_string());
    }

    /// The last accepted step.
    #[must_use]
    pub fn last_step(&self) -> Option<StepConfig> {
        self.last_step.lock().clone()
    }

    /// Number of add attempts, failed ones included.
    #[must_use]
    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    /// Number of cancel requests.
    #[must_use]
    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterService for ScriptedClusterService {
    async fn add_step(&self, _cluster_id: &str, step: &StepConfig) -> Result<String, JobError> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        take_transient(&self.transient, "add_step")?;
        if let Some(message) = self.reject_next.lock().take() {
            return Err(JobError::Rejected(message));
        }

        let step_id = format!("s-{:04}", self.next_step.fetch_add(1, Ordering::SeqCst));
        let script = self.script.lock().clone();
        self.steps
            .lock()
            .insert(step_id.clone(), Playback::new(&script, StepState::Completed));
        *self.last_step.lock() = Some(step.clone());
        Ok(step_id)
    }

    async fn describe_step(&self, _cluster_id: &str, step_id: &str) -> Result<StepState, JobError> {
        take_transient(&self.transient, "describe_step")?;
        self.steps
            .lock()
            .get_mut(step_id)
            .map(Playback::next)
            .ok_or_else(|| JobError::UnknownHandle(step_id.to_string()))
    }

    async fn cancel_steps(&self, _cluster_id: &str, step_ids: &[String]) -> Result<(), JobError> {
        take_transient(&self.transient, "cancel_steps")?;
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        let mut steps = self.steps.lock();
        for id in step_ids {
            if let Some(step) = steps.get_mut(id) {
                step.stop(StepState::Cancelled);
            }
        }
        Ok(())
    }
}
