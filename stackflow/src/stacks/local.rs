//! File-backed [`StackBackend`] for local runs.
//!
//! Deploys complete immediately. State survives between CLI invocations in a
//! JSON file that is rewritten atomically (write to a sibling, then rename).

use super::backend::StackBackend;
use super::spec::ResourceGroupSpec;
use crate::core::ResourceStatus;
use crate::errors::StackflowError;
use crate::utils::{now_utc, Timestamp};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Outputs a deployed group reports: `<logicalId>.id` is the physical name
/// (or `<group>-<logicalId>` when none is set) and `<logicalId>.arn` a
/// synthetic resource name.
#[must_use]
pub fn synthesize_outputs(spec: &ResourceGroupSpec) -> BTreeMap<String, String> {
    let mut outputs = BTreeMap::new();
    for resource in &spec.resources {
        let name = resource
            .physical_name()
            .map_or_else(|| format!("{}-{}", spec.id, resource.logical_id), str::to_string);
        outputs.insert(
            format!("{}.arn", resource.logical_id),
            format!("arn:stackflow:{}:::{}", resource.resource_type, name),
        );
        outputs.insert(format!("{}.id", resource.logical_id), name);
    }
    outputs
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupRecord {
    status: ResourceStatus,
    fingerprint: String,
    #[serde(default)]
    imports: BTreeMap<String, String>,
    #[serde(default)]
    outputs: BTreeMap<String, String>,
    updated_at: Timestamp,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    groups: BTreeMap<String, GroupRecord>,
}

/// Stack backend that keeps deployed groups in a local JSON file.
#[derive(Debug)]
pub struct LocalStackBackend {
    path: PathBuf,
    lock: Mutex<()>,
}

impl LocalStackBackend {
    /// Opens (or lazily creates) the state file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// The state file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrites a group's status, for operators repairing state by hand.
    ///
    /// # Errors
    ///
    /// Returns an IO or serialization error if the state file cannot be
    /// read or written.
    pub fn mark(&self, group_id: &str, status: ResourceStatus) -> Result<(), StackflowError> {
        self.update(|file| {
            if let Some(record) = file.groups.get_mut(group_id) {
                record.status = status;
                record.updated_at = now_utc();
            }
        })
    }

    fn load(&self) -> Result<StateFile, StackflowError> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(StateFile::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StateFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, file: &StateFile) -> Result<(), StackflowError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(file)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&StateFile) -> T) -> Result<T, StackflowError> {
        let _guard = self.lock.lock();
        Ok(f(&self.load()?))
    }

    fn update(&self, f: impl FnOnce(&mut StateFile)) -> Result<(), StackflowError> {
        let _guard = self.lock.lock();
        let mut file = self.load()?;
        f(&mut file);
        self.store(&file)
    }
}

#[async_trait]
impl StackBackend for LocalStackBackend {
    async fn describe_status(&self, group_id: &str) -> Result<ResourceStatus, StackflowError> {
        self.read(|file| {
            file.groups
                .get(group_id)
                .map_or(ResourceStatus::Absent, |record| record.status)
        })
    }

    async fn deploy(
        &self,
        spec: &ResourceGroupSpec,
        imports: &BTreeMap<String, String>,
    ) -> Result<(), StackflowError> {
        tracing::debug!(group = %spec.id, path = %self.path.display(), "Writing group to local state");
        let record = GroupRecord {
            status: ResourceStatus::Healthy,
            fingerprint: spec.fingerprint(),
            imports: imports.clone(),
            outputs: synthesize_outputs(spec),
            updated_at: now_utc(),
        };
        self.update(|file| {
            file.groups.insert(spec.id.clone(), record);
        })
    }

    async fn delete(&self, group_id: &str) -> Result<(), StackflowError> {
        self.update(|file| {
            file.groups.remove(group_id);
        })
    }

    async fn outputs(&self, group_id: &str) -> Result<BTreeMap<String, String>, StackflowError> {
        self.read(|file| {
            file.groups
                .get(group_id)
                .map(|record| record.outputs.clone())
                .unwrap_or_default()
        })
    }

    async fn deployed_fingerprint(&self, group_id: &str) -> Result<Option<String>, StackflowError> {
        self.read(|file| file.groups.get(group_id).map(|record| record.fingerprint.clone()))
    }
}
