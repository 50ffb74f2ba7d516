//! `{{resolve:secret:<name>:<field>}}` references inside job parameters.

use super::{SecretCache, SecretError};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"\{\{resolve:secret:([A-Za-z0-9/_+=.@-]+):([A-Za-z0-9_.-]+)\}\}").ok()
});

fn captures(value: &str) -> impl Iterator<Item = regex::Captures<'_>> {
    PATTERN.iter().flat_map(move |re| re.captures_iter(value))
}

/// One reference found in a parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicReference {
    /// Secret name.
    pub secret: String,
    /// Field within the secret.
    pub field: String,
}

impl DynamicReference {
    /// Finds every reference in `value`.
    #[must_use]
    pub fn find_all(value: &str) -> Vec<Self> {
        captures(value)
            .map(|c| Self {
                secret: c[1].to_string(),
                field: c[2].to_string(),
            })
            .collect()
    }
}

/// Replaces every secret reference in `parameters` with its value, resolved
/// through `cache`.
///
/// # Errors
///
/// Returns [`SecretError::NotFound`] for an unprovisioned name, the cache's
/// access error, or [`SecretError::MissingField`].
pub fn resolve_dynamic_references(
    parameters: &BTreeMap<String, String>,
    cache: &SecretCache,
    lookup: impl Fn(&str) -> Option<super::SecretRef>,
) -> Result<BTreeMap<String, String>, SecretError> {
    let mut resolved = BTreeMap::new();

    for (key, value) in parameters {
        let mut out = String::with_capacity(value.len());
        let mut last = 0;
        for caps in captures(value) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let reference = lookup(&caps[1]).ok_or_else(|| SecretError::NotFound(caps[1].to_string()))?;
            let secret = cache.get(&reference)?;
            out.push_str(&value[last..whole.start()]);
            out.push_str(secret.field(&caps[2])?);
            last = whole.end();
        }
        out.push_str(&value[last..]);
        resolved.insert(key.clone(), out);
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::{CallerKind, SecretProvisioner, SecretValue};
    use std::sync::Arc;
    use std::time::Duration;

    fn setup(caller: CallerKind) -> (Arc<SecretProvisioner>, SecretCache) {
        let provisioner = Arc::new(SecretProvisioner::new([CallerKind::EtlJob]));
        let generator = || -> Result<SecretValue, SecretError> {
            Ok(SecretValue::new()
                .with_field("username", "etl")
                .with_field("password", "s3cret"))
        };
        provisioner.provision("rds/credentials", &generator).unwrap();
        let cache = SecretCache::new(provisioner.clone(), caller, Duration::from_secs(60));
        (provisioner, cache)
    }

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_find_all() {
        let refs = DynamicReference::find_all("{{resolve:secret:db:username}}/{{resolve:secret:db:password}}");
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[1].field, "password");
    }

    #[test]
    fn test_references_are_substituted() {
        let (provisioner, cache) = setup(CallerKind::EtlJob);
        let input = params(&[
            ("db_user", "{{resolve:secret:rds/credentials:username}}"),
            ("dsn", "postgres://{{resolve:secret:rds/credentials:username}}@host/db"),
            ("plain", "s3://bucket/key"),
        ]);

        let out = resolve_dynamic_references(&input, &cache, |name| provisioner.lookup(name)).unwrap();

        assert_eq!(out["db_user"], "etl");
        assert_eq!(out["dsn"], "postgres://etl@host/db");
        assert_eq!(out["plain"], "s3://bucket/key");
    }

    #[test]
    fn test_disallowed_caller_cannot_resolve() {
        let (provisioner, cache) = setup(CallerKind::Operator);
        let input = params(&[("p", "{{resolve:secret:rds/credentials:password}}")]);
        let err = resolve_dynamic_references(&input, &cache, |name| provisioner.lookup(name)).unwrap_err();
        assert!(matches!(err, SecretError::AccessDenied { .. }));
    }

    #[test]
    fn test_unknown_secret_and_field() {
        let (provisioner, cache) = setup(CallerKind::EtlJob);
        let missing = params(&[("p", "{{resolve:secret:other:password}}")]);
        assert!(matches!(
            resolve_dynamic_references(&missing, &cache, |n| provisioner.lookup(n)),
            Err(SecretError::NotFound(_))
        ));

        let bad_field = params(&[("p", "{{resolve:secret:rds/credentials:port}}")]);
        assert!(matches!(
            resolve_dynamic_references(&bad_field, &cache, |n| provisioner.lookup(n)),
            Err(SecretError::MissingField { .. })
        ));
    }
}
