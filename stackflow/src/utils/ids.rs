//! Identifier helpers.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generates a new UUID v4.
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Generates a fresh workflow execution id.
#[must_use]
pub fn execution_id() -> String {
    format!("exec-{}", Uuid::new_v4().simple())
}

/// Returns a short, stable hex fingerprint of `bytes`.
#[must_use]
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(&digest[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_ids_are_unique() {
        let a = execution_id();
        let b = execution_id();
        assert!(a.starts_with("exec-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(fingerprint(b"network"), fingerprint(b"network"));
        assert_ne!(fingerprint(b"network"), fingerprint(b"compute"));
        assert_eq!(fingerprint(b"x").len(), 24);
    }
}
