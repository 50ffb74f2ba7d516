//! Caller-side cache of resolved secrets.

use super::{CallerKind, ResolvedSecret, SecretError, SecretProvisioner, SecretRef};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Caches resolved secrets for one caller kind.
///
/// An entry is reused while it is younger than the TTL and the provisioner
/// still reports its version as current.
#[derive(Debug)]
pub struct SecretCache {
    provisioner: Arc<SecretProvisioner>,
    caller: CallerKind,
    ttl: Duration,
    entries: Mutex<HashMap<String, (ResolvedSecret, Instant)>>,
}

impl SecretCache {
    /// Creates a cache.
    #[must_use]
    pub fn new(provisioner: Arc<SecretProvisioner>, caller: CallerKind, ttl: Duration) -> Self {
        Self {
            provisioner,
            caller,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The caller kind this cache resolves as.
    #[must_use]
    pub fn caller(&self) -> CallerKind {
        self.caller
    }

    /// Returns a cached or freshly resolved value.
    ///
    /// # Errors
    ///
    /// Returns the provisioner's error on a miss.
    pub fn get(&self, reference: &SecretRef) -> Result<ResolvedSecret, SecretError> {
        if let Some((cached, at)) = self.entries.lock().get(reference.id()) {
            if at.elapsed() < self.ttl && self.provisioner.is_current(cached) {
                return Ok(cached.clone());
            }
        }

        let resolved = self.provisioner.resolve(reference, self.caller)?;
        self.entries
            .lock()
            .insert(reference.id().to_string(), (resolved.clone(), Instant::now()));
        Ok(resolved)
    }

    /// Drops every cached entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
