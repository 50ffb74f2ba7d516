//! # Stackflow
//!
//! Provisioning and orchestration for event-driven data pipelines.
//!
//! Stackflow brings a layered set of resource groups to their declared state
//! and runs a sequential chain of long-running jobs whenever a new object
//! lands in the ingest bucket:
//!
//! - **Stack reconciliation**: dependency-ordered, idempotent provisioning
//!   that repairs partially failed groups
//! - **Secrets**: generated credentials resolved only for allow-listed callers
//! - **Event dispatch**: deduplicated object-created notifications start
//!   workflow executions
//! - **Workflow engine**: strictly serial task chains with SYNC waits,
//!   failure policies, timeouts and cancellation
//! - **Job runners**: ETL jobs and cluster steps behind one uniform contract
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stackflow::prelude::*;
//!
//! let config = StackflowConfig::load("stackflow.yaml")?;
//! let reconciler = Reconciler::new(
//!     Arc::new(LocalStackBackend::new(&config.state_file)),
//!     Arc::new(InMemoryResourceStore::with_specs(config.stacks.clone())),
//! );
//! let report = reconciler.reconcile_all(&config.plan()?).await;
//! assert!(report.success());
//!
//! let engine = Arc::new(WorkflowEngine::new(runners));
//! let definition = Arc::new(config.workflow_definition()?.expect("workflow configured"));
//! let dispatcher = EventDispatcher::new(config.dispatcher.clone(), engine, definition);
//! dispatcher.dispatch_notification(&notification).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod jobs;
pub mod logging;
pub mod polling;
pub mod secrets;
pub mod stacks;
pub mod store;
pub mod testing;
pub mod utils;
pub mod workflow;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::StackflowConfig;
    pub use crate::core::{
        ExecutionMode, ExecutionStatus, FailurePolicy, JobStatus, ResourceStatus, TerminalStatus,
    };
    pub use crate::dispatch::{Dispatched, DispatcherConfig, EventDispatcher, IngestEvent};
    pub use crate::errors::{ConfigurationError, ErrorKind, ErrorRecord, StackflowError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::jobs::{
        ClusterStepRunner, EtlJobRunner, JobHandle, JobRunner, JobSpec, RunnerKind, RunnerRegistry,
    };
    pub use crate::polling::{PollConfig, RetryConfig};
    pub use crate::secrets::{CallerKind, CredentialPairGenerator, SecretProvisioner, SecretRef};
    pub use crate::stacks::{
        LocalStackBackend, Reconciler, ResourceGroupSpec, StackBackend, StackPlan, StackTier,
    };
    pub use crate::store::{InMemoryResourceStore, ResourceGroupState, StateReader};
    pub use crate::workflow::{EngineConfig, WorkflowDefinition, WorkflowEngine, WorkflowExecution};
    pub use crate::utils::{execution_id, now_utc, Timestamp};
}
