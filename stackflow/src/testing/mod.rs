//! Test doubles for stackflow components.
//!
//! This module provides:
//! - An in-memory stack backend with scripted deploy outcomes
//! - Scripted ETL and cluster services for the job runners

mod jobs;
mod stacks;

pub use jobs::{ScriptedClusterService, ScriptedEtlService};
pub use stacks::SimulatedStackBackend;
