//! Write-once secret provisioning with caller allow-lists.

use super::{CallerKind, ResolvedSecret, SecretError, SecretGenerator, SecretRef, SecretValue};
use crate::utils::{now_utc, Timestamp};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;

#[derive(Debug)]
struct StoredSecret {
    reference: SecretRef,
    version: u64,
    value: SecretValue,
    rotated_at: Timestamp,
}

/// Generates, stores, rotates and hands out secrets.
#[derive(Debug)]
pub struct SecretProvisioner {
    secrets: DashMap<String, StoredSecret>,
    allowed: HashSet<CallerKind>,
}

impl Default for SecretProvisioner {
    fn default() -> Self {
        Self::new([CallerKind::EtlJob, CallerKind::ClusterStep, CallerKind::Database])
    }
}

impl SecretProvisioner {
    /// Creates a provisioner that resolves only for `allowed` caller kinds.
    #[must_use]
    pub fn new(allowed: impl IntoIterator<Item = CallerKind>) -> Self {
        Self {
            secrets: DashMap::new(),
            allowed: allowed.into_iter().collect(),
        }
    }

    /// Provisions `name` with a generated value.
    ///
    /// Provisioning is write-once: if `name` already exists its reference is
    /// returned and the generator is not called.
    ///
    /// # Errors
    ///
    /// Returns the generator's error.
    pub fn provision(&self, name: &str, generator: &dyn SecretGenerator) -> Result<SecretRef, SecretError> {
        match self.secrets.entry(name.to_string()) {
            Entry::Occupied(existing) => {
                tracing::debug!(secret = name, "Secret already provisioned");
                Ok(existing.get().reference.clone())
            }
            Entry::Vacant(slot) => {
                let value = generator.generate()?;
                let reference = SecretRef::new(name);
                tracing::info!(secret = %reference, "Provisioned secret");
                slot.insert(StoredSecret {
                    reference: reference.clone(),
                    version: 1,
                    value,
                    rotated_at: now_utc(),
                });
                Ok(reference)
            }
        }
    }

    /// Replaces the value behind `reference` and returns the new version.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::NotFound`] for an unknown reference, or the
    /// generator's error.
    pub fn rotate(&self, reference: &SecretRef, generator: &dyn SecretGenerator) -> Result<u64, SecretError> {
        let mut stored = self.stored_mut(reference)?;
        stored.value = generator.generate()?;
        stored.version += 1;
        stored.rotated_at = now_utc();
        tracing::info!(secret = %reference, version = stored.version, "Rotated secret");
        Ok(stored.version)
    }

    /// Hands the current value to `caller`.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::AccessDenied`] if `caller` is not allowed, or
    /// [`SecretError::NotFound`] for an unknown reference.
    pub fn resolve(&self, reference: &SecretRef, caller: CallerKind) -> Result<ResolvedSecret, SecretError> {
        if !self.allowed.contains(&caller) {
            tracing::warn!(secret = %reference, caller = %caller, "Secret access denied");
            return Err(SecretError::AccessDenied {
                secret: reference.name().to_string(),
                caller,
            });
        }

        let stored = self
            .secrets
            .get(reference.name())
            .filter(|s| s.reference == *reference)
            .ok_or_else(|| SecretError::NotFound(reference.name().to_string()))?;

        Ok(ResolvedSecret {
            reference: stored.reference.clone(),
            version: stored.version,
            value: stored.value.clone(),
        })
    }

    /// Returns true if no rotation happened since `resolved` was handed out.
    #[must_use]
    pub fn is_current(&self, resolved: &ResolvedSecret) -> bool {
        self.version(&resolved.reference) == Some(resolved.version)
    }

    /// Current version of `reference`.
    #[must_use]
    pub fn version(&self, reference: &SecretRef) -> Option<u64> {
        self.secrets
            .get(reference.name())
            .filter(|s| s.reference == *reference)
            .map(|s| s.version)
    }

    /// Looks up the reference for a secret name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<SecretRef> {
        self.secrets.get(name).map(|s| s.reference.clone())
    }

    /// When `reference` was last written.
    #[must_use]
    pub fn rotated_at(&self, reference: &SecretRef) -> Option<Timestamp> {
        self.secrets.get(reference.name()).map(|s| s.rotated_at)
    }

    fn stored_mut(
        &self,
        reference: &SecretRef,
    ) -> Result<dashmap::mapref::one::RefMut<'_, String, StoredSecret>, SecretError> {
        self.secrets
            .get_mut(reference.name())
            .filter(|s| s.reference == *reference)
            .ok_or_else(|| SecretError::NotFound(reference.name().to_string()))
    }
}
