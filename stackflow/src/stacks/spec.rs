//! Resource group declarations.

use crate::errors::{codes, ConfigurationError, ErrorInfo};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Layer a resource group belongs to.
///
/// Dependencies may only point at the same or an earlier tier:
/// network, then compute/storage, then data-movement/orchestration, then
/// credentialed storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackTier {
    /// VPCs, subnets, routing.
    Network,
    /// Clusters and functions.
    Compute,
    /// Buckets and databases.
    Storage,
    /// ETL jobs and transfer services.
    DataMovement,
    /// Workflow engines and triggers.
    Orchestration,
    /// Stores that hold generated credentials.
    CredentialedStorage,
}

impl StackTier {
    /// Position of the tier in the provisioning order.
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            Self::Network => 0,
            Self::Compute | Self::Storage => 1,
            Self::DataMovement | Self::Orchestration => 2,
            Self::CredentialedStorage => 3,
        }
    }
}

impl fmt::Display for StackTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Compute => write!(f, "compute"),
            Self::Storage => write!(f, "storage"),
            Self::DataMovement => write!(f, "data_movement"),
            Self::Orchestration => write!(f, "orchestration"),
            Self::CredentialedStorage => write!(f, "credentialed_storage"),
        }
    }
}

/// One declared resource inside a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDeclaration {
    /// Identifier unique within the group.
    #[serde(rename = "logicalId")]
    pub logical_id: String,
    /// Backend resource type (e.g. `bucket`, `bucket_policy`, `etl_job`).
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Backend-specific properties.
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl ResourceDeclaration {
    /// Creates a declaration with no properties.
    #[must_use]
    pub fn new(logical_id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            logical_id: logical_id.into(),
            resource_type: resource_type.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Sets a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// The physical name the declaration claims, if it sets one.
    #[must_use]
    pub fn physical_name(&self) -> Option<&str> {
        self.properties.get("name").and_then(serde_json::Value::as_str)
    }
}

/// A value a group publishes for other groups to import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportDecl {
    /// Stable export name, unique across all groups.
    pub name: String,
    /// Logical id of the exporting resource.
    pub resource: String,
    /// Attribute of the resource to export.
    #[serde(default = "default_attribute")]
    pub attribute: String,
}

fn default_attribute() -> String {
    "id".to_string()
}

impl ExportDecl {
    /// The backend output key this export reads.
    #[must_use]
    pub fn output_key(&self) -> String {
        format!("{}.{}", self.resource, self.attribute)
    }
}

/// Declared desired state of a resource group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceGroupSpec {
    /// Group identifier.
    pub id: String,
    /// Provisioning tier.
    pub tier: StackTier,
    /// Ordered resource declarations.
    #[serde(default)]
    pub resources: Vec<ResourceDeclaration>,
    /// Groups that must be HEALTHY first.
    #[serde(default, rename = "dependsOn")]
    pub depends_on: Vec<String>,
    /// Values published to the export registry.
    #[serde(default)]
    pub exports: Vec<ExportDecl>,
    /// Export names consumed from other groups.
    #[serde(default)]
    pub imports: Vec<String>,
}

impl ResourceGroupSpec {
    /// Creates an empty spec.
    #[must_use]
    pub fn new(id: impl Into<String>, tier: StackTier) -> Self {
        Self {
            id: id.into(),
            tier,
            resources: Vec::new(),
            depends_on: Vec::new(),
            exports: Vec::new(),
            imports: Vec::new(),
        }
    }

    /// Adds a resource declaration.
    #[must_use]
    pub fn with_resource(mut self, resource: ResourceDeclaration) -> Self {
        self.resources.push(resource);
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn depends_on(mut self, group_id: impl Into<String>) -> Self {
        self.depends_on.push(group_id.into());
        self
    }

    /// Adds an export.
    #[must_use]
    pub fn with_export(
        mut self,
        name: impl Into<String>,
        resource: impl Into<String>,
        attribute: impl Into<String>,
    ) -> Self {
        self.exports.push(ExportDecl {
            name: name.into(),
            resource: resource.into(),
            attribute: attribute.into(),
        });
        self
    }

    /// Adds an import.
    #[must_use]
    pub fn with_import(mut self, export_name: impl Into<String>) -> Self {
        self.imports.push(export_name.into());
        self
    }

    /// Stable fingerprint of the declared state.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        crate::utils::fingerprint(&bytes)
    }

    /// Checks the group declaration on its own, without looking at other groups.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty id, a self dependency, duplicate logical
    /// ids or export names, an export of an undeclared resource, or an import
    /// of one of the group's own exports.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.id.trim().is_empty() {
            return Err(ConfigurationError::new("Resource group id cannot be empty"));
        }

        if self.depends_on.iter().any(|d| d == &self.id) {
            return Err(ConfigurationError::new(format!(
                "Resource group '{}' cannot depend on itself",
                self.id
            ))
            .with_subjects(vec![self.id.clone()])
            .with_info(ErrorInfo::new(codes::SELF_REFERENCE, "Self dependency")));
        }

        let mut logical_ids = HashSet::new();
        for resource in &self.resources {
            if !logical_ids.insert(resource.logical_id.as_str()) {
                return Err(duplicate(
                    &self.id,
                    format!(
                        "Resource group '{}' declares '{}' more than once",
                        self.id, resource.logical_id
                    ),
                ));
            }
        }

        let mut export_names = HashSet::new();
        for export in &self.exports {
            if !export_names.insert(export.name.as_str()) {
                return Err(duplicate(
                    &self.id,
                    format!("Resource group '{}' exports '{}' twice", self.id, export.name),
                ));
            }
            if !logical_ids.contains(export.resource.as_str()) {
                return Err(ConfigurationError::new(format!(
                    "Export '{}' of '{}' references undeclared resource '{}'",
                    export.name, self.id, export.resource
                ))
                .with_subjects(vec![self.id.clone(), export.resource.clone()])
                .with_info(ErrorInfo::new(codes::MISSING_REF, "Unknown export source")));
            }
        }

        if let Some(own) = self.imports.iter().find(|i| export_names.contains(i.as_str())) {
            return Err(ConfigurationError::new(format!(
                "Resource group '{}' imports its own export '{}' before it exists",
                self.id, own
            ))
            .with_subjects(vec![self.id.clone(), own.clone()])
            .with_info(
                ErrorInfo::new(codes::SELF_REFERENCE, "Self-referential import")
                    .with_fix_hint("Reference the resource directly inside the group."),
            ));
        }

        Ok(())
    }
}

fn duplicate(group_id: &str, message: String) -> ConfigurationError {
    ConfigurationError::new(message)
        .with_subjects(vec![group_id.to_string()])
        .with_info(ErrorInfo::new(codes::DUPLICATE, "Duplicate declaration"))
}
