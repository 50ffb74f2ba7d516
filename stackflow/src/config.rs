//! Stackflow configuration.
//!
//! One YAML or JSON document configures every component: the declared
//! resource groups, reconciler and engine bounds, the dispatcher's ingest
//! filters and the secret allow-list. Two environment variables override
//! file values:
//!
//! - `STACKFLOW_INGEST_BUCKET` replaces `dispatcher.ingest_bucket`
//! - `STACKFLOW_STATE_FILE` replaces `state_file`

use crate::dispatch::DispatcherConfig;
use crate::errors::{codes, ConfigurationError, ErrorInfo, StackflowError};
use crate::secrets::{CallerKind, SecretProvisioner};
use crate::stacks::{ReconcilerConfig, ResourceGroupSpec, StackPlan};
use crate::workflow::{EngineConfig, WorkflowDefinition};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the ingest bucket.
pub const ENV_INGEST_BUCKET: &str = "STACKFLOW_INGEST_BUCKET";
/// Environment variable overriding the state file path.
pub const ENV_STATE_FILE: &str = "STACKFLOW_STATE_FILE";

/// Secret provisioner settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Caller kinds allowed to resolve secrets.
    #[serde(default = "default_allowed_callers")]
    pub allowed_callers: Vec<CallerKind>,
    /// How long adapters cache resolved values.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_allowed_callers() -> Vec<CallerKind> {
    vec![CallerKind::EtlJob, CallerKind::ClusterStep, CallerKind::Database]
}

fn default_cache_ttl_secs() -> u64 {
    300
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            allowed_callers: default_allowed_callers(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl SecretsConfig {
    /// Cache lifetime for resolved secrets.
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Builds a provisioner with this allow-list.
    #[must_use]
    pub fn provisioner(&self) -> SecretProvisioner {
        SecretProvisioner::new(self.allowed_callers.iter().copied())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackflowConfig {
    /// Declared resource groups.
    #[serde(default)]
    pub stacks: Vec<ResourceGroupSpec>,
    /// Reconciler bounds.
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    /// Workflow engine bounds.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Ingest filters and dedup window.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Secret allow-list and caching.
    #[serde(default)]
    pub secrets: SecretsConfig,
    /// Workflow definition file, relative to the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<PathBuf>,
    /// Local stack backend state file.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

fn default_state_file() -> PathBuf {
    PathBuf::from(".stackflow/state.json")
}

impl Default for StackflowConfig {
    fn default() -> Self {
        Self {
            stacks: Vec::new(),
            reconciler: ReconcilerConfig::default(),
            engine: EngineConfig::default(),
            dispatcher: DispatcherConfig::default(),
            secrets: SecretsConfig::default(),
            workflow: None,
            state_file: default_state_file(),
        }
    }
}

impl StackflowConfig {
    /// Parses a YAML document.
    ///
    /// # Errors
    ///
    /// Returns a configuration error with code `PARSE` if the document is
    /// malformed.
    pub fn from_yaml(document: &str) -> Result<Self, ConfigurationError> {
        serde_yaml::from_str(document).map_err(parse_error)
    }

    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns a configuration error with code `PARSE` if the document is
    /// malformed.
    pub fn from_json(document: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(document).map_err(parse_error)
    }

    /// Loads a config file (`.json` as JSON, anything else as YAML) and
    /// applies environment overrides. A relative `workflow` path is resolved
    /// against the file's directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StackflowError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let mut config = if is_json {
            Self::from_json(&document)?
        } else {
            Self::from_yaml(&document)?
        };

        if let (Some(workflow), Some(dir)) = (config.workflow.as_mut(), path.parent()) {
            if workflow.is_relative() {
                *workflow = dir.join(&*workflow);
            }
        }
        config.apply_overrides(|key| std::env::var(key).ok());
        tracing::debug!(path = %path.display(), groups = config.stacks.len(), "Loaded configuration");
        Ok(config)
    }

    /// Applies `STACKFLOW_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(bucket) = lookup(ENV_INGEST_BUCKET).filter(|v| !v.trim().is_empty()) {
            self.dispatcher.ingest_bucket = bucket;
        }
        if let Some(state_file) = lookup(ENV_STATE_FILE).filter(|v| !v.trim().is_empty()) {
            self.state_file = PathBuf::from(state_file);
        }
    }

    /// Adds a resource group.
    #[must_use]
    pub fn with_stack(mut self, spec: ResourceGroupSpec) -> Self {
        self.stacks.push(spec);
        self
    }

    /// Sets the workflow definition file.
    #[must_use]
    pub fn with_workflow(mut self, path: impl Into<PathBuf>) -> Self {
        self.workflow = Some(path.into());
        self
    }

    /// Sets the state file.
    #[must_use]
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = path.into();
        self
    }

    /// Sets the dispatcher configuration.
    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Validates the declared groups into a plan.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure.
    pub fn plan(&self) -> Result<StackPlan, ConfigurationError> {
        StackPlan::new(self.stacks.clone())
    }

    /// Loads the configured workflow definition, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or validated.
    pub fn workflow_definition(&self) -> Result<Option<WorkflowDefinition>, ConfigurationError> {
        self.workflow.as_ref().map(WorkflowDefinition::load).transpose()
    }
}

fn parse_error(err: impl std::fmt::Display) -> ConfigurationError {
    ConfigurationError::new(format!("Cannot parse configuration: {err}"))
        .with_info(ErrorInfo::new(codes::PARSE, "Invalid configuration document"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stacks::StackTier;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    const CONFIG: &str = r"
stacks:
  - id: network
    tier: network
    resources:
      - logicalId: Vpc
        type: vpc
  - id: storage
    tier: storage
    dependsOn: [network]
    resources:
      - logicalId: IngestBucket
        type: bucket
        properties: {name: ingest-data}
    exports:
      - name: IngestBucketName
        resource: IngestBucket
reconciler:
  group_timeout_secs: 600
engine:
  default_task_timeout_secs: 120
dispatcher:
  ingest_bucket: ingest-data
  key_suffix: .csv
secrets:
  allowed_callers: [etl_job]
workflow: pipeline.yaml
";

    #[test]
    fn test_parse_yaml() {
        let config = StackflowConfig::from_yaml(CONFIG).unwrap();
        assert_eq!(config.stacks.len(), 2);
        assert_eq!(config.stacks[1].tier, StackTier::Storage);
        assert_eq!(config.reconciler.group_timeout_secs, 600);
        assert_eq!(config.engine.default_task_timeout_secs, 120);
        assert_eq!(config.dispatcher.key_suffix.as_deref(), Some(".csv"));
        assert_eq!(config.dispatcher.dedup_ttl_secs, 3600);
        assert_eq!(config.secrets.allowed_callers, vec![CallerKind::EtlJob]);
        assert_eq!(config.secrets.cache_ttl_secs, 300);
        assert_eq!(config.state_file, PathBuf::from(".stackflow/state.json"));
        assert_eq!(config.plan().unwrap().ids(), vec!["network", "storage"]);
    }

    #[test]
    fn test_defaults_from_empty_document() {
        let config = StackflowConfig::from_json("{}").unwrap();
        assert!(config.stacks.is_empty());
        assert_eq!(config.secrets, SecretsConfig::default());
        assert!(config.workflow_definition().unwrap().is_none());
    }

    #[test]
    fn test_parse_error_has_code() {
        let err = StackflowConfig::from_yaml("stacks: {not: a list}").unwrap_err();
        assert_eq!(err.code(), Some(codes::PARSE));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = StackflowConfig::from_yaml(CONFIG).unwrap();
        let env = HashMap::from([
            (ENV_INGEST_BUCKET, "other-bucket".to_string()),
            (ENV_STATE_FILE, "/tmp/state.json".to_string()),
        ]);
        config.apply_overrides(|key| env.get(key).cloned());
        assert_eq!(config.dispatcher.ingest_bucket, "other-bucket");
        assert_eq!(config.state_file, PathBuf::from("/tmp/state.json"));

        config.apply_overrides(|_| Some("  ".to_string()));
        assert_eq!(config.dispatcher.ingest_bucket, "other-bucket");
    }

    #[test]
    fn test_load_resolves_workflow_relative_to_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stackflow.yaml"), CONFIG).unwrap();
        std::fs::write(
            dir.path().join("pipeline.yaml"),
            "startAt: A\nstates:\n  A: {type: task, runnerKind: etl, end: true}\n",
        )
        .unwrap();

        let config = StackflowConfig::load(dir.path().join("stackflow.yaml")).unwrap();
        assert_eq!(config.workflow.as_deref(), Some(dir.path().join("pipeline.yaml").as_path()));
        let definition = config.workflow_definition().unwrap().unwrap();
        assert_eq!(definition.chain(), vec!["A"]);
    }

    #[test]
    fn test_builders() {
        let config = StackflowConfig::default()
            .with_stack(ResourceGroupSpec::new("network", StackTier::Network))
            .with_workflow("pipeline.yaml")
            .with_state_file("/var/lib/stackflow/state.json")
            .with_dispatcher(
                DispatcherConfig::new("ingest-data").with_dedup(Duration::from_secs(60), 10),
            );
        assert_eq!(config.stacks.len(), 1);
        assert_eq!(config.workflow, Some(PathBuf::from("pipeline.yaml")));
        assert_eq!(config.state_file, PathBuf::from("/var/lib/stackflow/state.json"));
        assert_eq!(config.dispatcher.dedup_ttl_secs, 60);
        assert_eq!(config.dispatcher.dedup_max_entries, 10);
        assert_eq!(config.secrets.cache_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn test_secrets_provisioner_uses_allow_list() {
        let provisioner = SecretsConfig {
            allowed_callers: vec![CallerKind::Database],
            cache_ttl_secs: 1,
        }
        .provisioner();
        let generator = || -> Result<crate::secrets::SecretValue, crate::secrets::SecretError> {
            Ok(crate::secrets::SecretValue::new().with_field("password", "x"))
        };
        let reference = provisioner.provision("db", &generator).unwrap();
        assert!(provisioner.resolve(&reference, CallerKind::Database).is_ok());
        assert!(provisioner.resolve(&reference, CallerKind::EtlJob).is_err());
    }
}
