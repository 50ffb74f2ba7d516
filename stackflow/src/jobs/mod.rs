//! Job runner adapters.
//!
//! Every native job service is reached through a [`JobRunner`] that turns a
//! [`JobSpec`] into a [`JobHandle`] and reports a uniform
//! [`JobStatus`](crate::core::JobStatus) until the job is terminal.

mod adapter;
mod cluster;
mod etl;
mod registry;

pub use adapter::{JobError, JobHandle, JobRunner, JobSpec, RunnerKind, SecretBinding};
pub use cluster::{ActionOnFailure, ClusterService, ClusterStepRunner, StepConfig, StepState, COMMAND_RUNNER_JAR};
pub use etl::{EtlJobRunner, EtlRunState, EtlService};
pub use registry::RunnerRegistry;
