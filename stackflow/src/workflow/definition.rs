//! Workflow definition documents.
//!
//! A definition is a JSON or YAML document with a `startAt` state and a map
//! of named task states linked by `next`. Loading validates that the states
//! form exactly one chain: every `next` resolves, nothing is revisited,
//! nothing is unreachable and no state has two predecessors.

use crate::core::{ExecutionMode, FailurePolicy};
use crate::errors::{codes, ConfigurationError, ErrorInfo};
use crate::jobs::{JobSpec, RunnerKind};
use crate::utils::validation::{detect_cycle, is_blank};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

/// Where a task goes when it finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Advance to the named state.
    Next(String),
    /// The execution succeeds.
    End,
}

/// A validated task state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskState {
    /// State name.
    pub name: String,
    /// Adapter that runs the job.
    pub runner_kind: RunnerKind,
    /// Job definition name; defaults to the state name.
    pub job_kind: String,
    /// Parameters; values of the form `$.Field` are bound from the
    /// execution input at submit time.
    pub parameters: BTreeMap<String, String>,
    /// Cluster or service to run on.
    pub target: Option<String>,
    /// Whether to wait for the job.
    pub mode: ExecutionMode,
    /// What a failed job does to the execution.
    pub failure_policy: FailurePolicy,
    /// Next state or end.
    pub transition: Transition,
    /// Bound on a SYNC wait; the engine default applies when unset.
    pub timeout: Option<Duration>,
}

impl TaskState {
    /// Builds the job spec for this task, binding `$.` references against
    /// `input`.
    ///
    /// # Errors
    ///
    /// Returns a message naming the parameter whose input path is missing.
    pub fn job_spec(&self, input: &serde_json::Value) -> Result<JobSpec, String> {
        let mut parameters = BTreeMap::new();
        for (key, value) in &self.parameters {
            let bound = match value.strip_prefix("$.") {
                Some(path) => lookup(input, path).ok_or_else(|| {
                    format!("parameter '{key}' references '{value}' which the execution input lacks")
                })?,
                None => value.clone(),
            };
            parameters.insert(key.clone(), bound);
        }

        Ok(JobSpec {
            job_kind: self.job_kind.clone(),
            parameters,
            target: self.target.clone(),
        })
    }
}

fn lookup(input: &serde_json::Value, path: &str) -> Option<String> {
    let found = path
        .split('.')
        .try_fold(input, |node, segment| node.get(segment))?;
    match found {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDefinition {
    #[serde(default)]
    name: Option<String>,
    start_at: String,
    #[serde(default)]
    timeout_seconds: Option<u64>,
    states: BTreeMap<String, RawState>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum RawState {
    Task(RawTask),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTask {
    runner_kind: RunnerKind,
    #[serde(default)]
    job_kind: Option<String>,
    #[serde(default)]
    parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    mode: ExecutionMode,
    #[serde(default)]
    failure_policy: FailurePolicy,
    #[serde(default)]
    timeout_seconds: Option<u64>,
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    end: bool,
}

/// A validated chain of task states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowDefinition {
    name: String,
    states: Vec<TaskState>,
    index: HashMap<String, usize>,
    timeout: Option<Duration>,
}

impl WorkflowDefinition {
    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if the document does not parse or
    /// fails validation.
    pub fn from_json(document: &str) -> Result<Self, ConfigurationError> {
        let raw: RawDefinition = serde_json::from_str(document).map_err(parse_error)?;
        Self::from_raw(raw)
    }

    /// Parses and validates a YAML document.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if the document does not parse or
    /// fails validation.
    pub fn from_yaml(document: &str) -> Result<Self, ConfigurationError> {
        let raw: RawDefinition = serde_yaml::from_str(document).map_err(parse_error)?;
        Self::from_raw(raw)
    }

    /// Loads a definition file, choosing the format by extension (`.json`,
    /// otherwise YAML).
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if the file cannot be read, parsed or
    /// validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::new(format!("Cannot read workflow definition {}: {e}", path.display()))
                .with_info(ErrorInfo::new(codes::PARSE, "Unreadable definition"))
        })?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json(&document)
        } else {
            Self::from_yaml(&document)
        }
    }

    fn from_raw(raw: RawDefinition) -> Result<Self, ConfigurationError> {
        if is_blank(&raw.start_at) {
            return Err(ConfigurationError::new("startAt cannot be empty")
                .with_info(ErrorInfo::new(codes::INVALID_STATE, "Missing start state")));
        }
        if !raw.states.contains_key(&raw.start_at) {
            return Err(ConfigurationError::new(format!(
                "startAt '{}' does not name a state",
                raw.start_at
            ))
            .with_subjects(vec![raw.start_at.clone()])
            .with_info(ErrorInfo::new(codes::MISSING_REF, "Unknown start state")));
        }

        let mut tasks: HashMap<String, TaskState> = HashMap::new();
        for (name, RawState::Task(task)) in raw.states {
            let state = task_state(name.clone(), task)?;
            tasks.insert(name, state);
        }

        let graph: HashMap<String, Vec<String>> = tasks
            .values()
            .map(|t| {
                let edges = match &t.transition {
                    Transition::Next(next) => vec![next.clone()],
                    Transition::End => Vec::new(),
                };
                (t.name.clone(), edges)
            })
            .collect();

        for task in tasks.values() {
            if let Transition::Next(next) = &task.transition {
                if !tasks.contains_key(next) {
                    return Err(ConfigurationError::new(format!(
                        "State '{}' transitions to unknown state '{}'",
                        task.name, next
                    ))
                    .with_subjects(vec![task.name.clone(), next.clone()])
                    .with_info(ErrorInfo::new(codes::MISSING_REF, "Unknown next state")));
                }
            }
        }

        let mut order = vec![raw.start_at.clone()];
        let mut rest: Vec<String> = tasks.keys().filter(|n| **n != raw.start_at).cloned().collect();
        rest.sort();
        order.extend(rest);
        detect_cycle(&graph, &order)?;

        let mut predecessors: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in tasks.values() {
            if let Transition::Next(next) = &task.transition {
                predecessors.entry(next.as_str()).or_default().push(task.name.as_str());
            }
        }
        if let Some((join, from)) = predecessors.iter().find(|(_, from)| from.len() > 1) {
            let mut subjects: Vec<String> = from.iter().map(|s| (*s).to_string()).collect();
            subjects.sort();
            return Err(ConfigurationError::new(format!(
                "State '{join}' is the next state of more than one state: {}",
                subjects.join(", ")
            ))
            .with_subjects(subjects)
            .with_info(
                ErrorInfo::new(codes::INVALID_STATE, "Join node")
                    .with_fix_hint("Workflows are a single chain; give each state one predecessor."),
            ));
        }

        let mut chain = Vec::with_capacity(tasks.len());
        let mut cursor = Some(raw.start_at.clone());
        while let Some(name) = cursor {
            let Some(task) = tasks.remove(&name) else {
                break;
            };
            cursor = match &task.transition {
                Transition::Next(next) => Some(next.clone()),
                Transition::End => None,
            };
            chain.push(task);
        }

        if !tasks.is_empty() {
            let mut unreachable: Vec<String> = tasks.into_keys().collect();
            unreachable.sort();
            return Err(ConfigurationError::new(format!(
                "States not reachable from '{}': {}",
                raw.start_at,
                unreachable.join(", ")
            ))
            .with_subjects(unreachable)
            .with_info(ErrorInfo::new(codes::INVALID_STATE, "Unreachable state")));
        }

        let index = chain
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();

        Ok(Self {
            name: raw.name.unwrap_or_else(|| raw.start_at.clone()),
            states: chain,
            index,
            timeout: raw.timeout_seconds.map(Duration::from_secs),
        })
    }

    /// Definition name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// States in execution order.
    #[must_use]
    pub fn states(&self) -> &[TaskState] {
        &self.states
    }

    /// The start state.
    #[must_use]
    pub fn start(&self) -> Option<&TaskState> {
        self.states.first()
    }

    /// Looks up a state by name.
    #[must_use]
    pub fn state(&self, name: &str) -> Option<&TaskState> {
        self.index.get(name).map(|&i| &self.states[i])
    }

    /// Execution-wide timeout declared by the document.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// State names in execution order.
    #[must_use]
    pub fn chain(&self) -> Vec<&str> {
        self.states.iter().map(|s| s.name.as_str()).collect()
    }
}

fn task_state(name: String, raw: RawTask) -> Result<TaskState, ConfigurationError> {
    let invalid = |message: String| {
        ConfigurationError::new(message)
            .with_subjects(vec![name.clone()])
            .with_info(ErrorInfo::new(codes::INVALID_STATE, "Malformed task state"))
    };

    if is_blank(&name) {
        return Err(invalid("State names cannot be empty".to_string()));
    }

    let transition = match (raw.next, raw.end) {
        (Some(next), false) => Transition::Next(next),
        (None, true) => Transition::End,
        (Some(_), true) => {
            return Err(invalid(format!("State '{name}' sets both next and end")));
        }
        (None, false) => {
            return Err(invalid(format!("State '{name}' sets neither next nor end")));
        }
    };

    let job_kind = raw.job_kind.unwrap_or_else(|| name.clone());
    if is_blank(&job_kind) {
        return Err(invalid(format!("State '{name}' has an empty jobKind")));
    }

    if raw.timeout_seconds == Some(0) {
        return Err(invalid(format!("State '{name}' has a zero timeout")));
    }

    let mut parameters = BTreeMap::new();
    for (key, value) in raw.parameters {
        let text = match value {
            serde_json::Value::String(s) => s,
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            other => {
                return Err(invalid(format!(
                    "State '{name}' parameter '{key}' must be a scalar, got {other}"
                )));
            }
        };
        parameters.insert(key, text);
    }

    Ok(TaskState {
        runner_kind: raw.runner_kind,
        job_kind,
        parameters,
        target: raw.target,
        mode: raw.mode,
        failure_policy: raw.failure_policy,
        transition,
        timeout: raw.timeout_seconds.map(Duration::from_secs),
        name,
    })
}

fn parse_error(err: impl std::fmt::Display) -> ConfigurationError {
    ConfigurationError::new(format!("Cannot parse workflow definition: {err}"))
        .with_info(ErrorInfo::new(codes::PARSE, "Invalid definition document"))
}
