//! Cross-group export registry.

use crate::utils::{now_utc, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A published export value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedValue {
    /// The value.
    pub value: String,
    /// The group that published it.
    pub producer: String,
    /// When it was published.
    pub published_at: Timestamp,
}

/// Name-to-value map of exports published by HEALTHY groups.
///
/// Export names are unique across groups; a group republishing replaces its
/// own previous values.
#[derive(Debug, Default)]
pub struct ExportRegistry {
    values: RwLock<HashMap<String, ExportedValue>>,
}

impl ExportRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes all of `producer`'s exports, replacing what it published
    /// before.
    pub fn publish(&self, producer: &str, values: BTreeMap<String, String>) {
        let now = now_utc();
        let mut map = self.values.write();
        map.retain(|_, v| v.producer != producer);
        for (name, value) in values {
            map.insert(
                name,
                ExportedValue {
                    value,
                    producer: producer.to_string(),
                    published_at: now,
                },
            );
        }
    }

    /// Removes everything `producer` published.
    pub fn withdraw(&self, producer: &str) {
        self.values.write().retain(|_, v| v.producer != producer);
    }

    /// Looks up one export.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<String> {
        self.values.read().get(name).map(|v| v.value.clone())
    }

    /// Looks up several exports, returning the names that are missing on
    /// failure.
    ///
    /// # Errors
    ///
    /// Returns the missing names if any lookup fails.
    pub fn resolve_all(&self, names: &[String]) -> Result<BTreeMap<String, String>, Vec<String>> {
        let map = self.values.read();
        let mut resolved = BTreeMap::new();
        let mut missing = Vec::new();
        for name in names {
            match map.get(name) {
                Some(v) => {
                    resolved.insert(name.clone(), v.value.clone());
                }
                None => missing.push(name.clone()),
            }
        }
        if missing.is_empty() {
            Ok(resolved)
        } else {
            Err(missing)
        }
    }

    /// Snapshot of all exports.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, ExportedValue> {
        self.values
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
