//! Generated credentials and controlled access to them.
//!
//! Consumers only ever hold a [`SecretRef`]. Raw values stay inside the
//! [`SecretProvisioner`] and are handed out as a [`ResolvedSecret`] to caller
//! kinds on its allow-list.

mod cache;
mod dynamic;
mod generator;
mod provisioner;
mod value;

pub use cache::SecretCache;
pub use dynamic::{resolve_dynamic_references, DynamicReference};
pub use generator::{CredentialPairGenerator, SecretGenerator};
pub use provisioner::SecretProvisioner;
pub use value::{DatabaseCredentials, ResolvedSecret, SecretRef, SecretValue};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Kind of component asking for a secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerKind {
    /// ETL job runner.
    EtlJob,
    /// Cluster step runner.
    ClusterStep,
    /// Database provisioning.
    Database,
    /// Stack reconciler.
    Reconciler,
    /// Human operator via the CLI.
    Operator,
}

impl fmt::Display for CallerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EtlJob => "etl_job",
            Self::ClusterStep => "cluster_step",
            Self::Database => "database",
            Self::Reconciler => "reconciler",
            Self::Operator => "operator",
        };
        f.write_str(name)
    }
}

/// Errors raised by the secrets module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretError {
    /// The caller kind is not on the allow-list.
    #[error("Access to secret '{secret}' denied for caller '{caller}'")]
    AccessDenied {
        /// Secret name.
        secret: String,
        /// Rejected caller.
        caller: CallerKind,
    },

    /// No secret with this name was provisioned.
    #[error("Secret '{0}' not found")]
    NotFound(String),

    /// The secret exists but lacks a field.
    #[error("Secret '{secret}' has no field '{field}'")]
    MissingField {
        /// Secret name.
        secret: String,
        /// Missing field.
        field: String,
    },

    /// A field holds a value of the wrong shape.
    #[error("Secret '{secret}' field '{field}' is invalid: {reason}")]
    InvalidField {
        /// Secret name.
        secret: String,
        /// Offending field.
        field: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A generator could not produce a value.
    #[error("Secret generation failed: {0}")]
    Generation(String),
}
