//! Secret references and values.

use super::SecretError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque handle to a provisioned secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    name: String,
    id: String,
}

impl SecretRef {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut suffix = crate::utils::generate_uuid().simple().to_string();
        suffix.truncate(6);
        let id = format!("secret:{name}-{suffix}");
        Self { name, id }
    }

    /// The secret's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable identifier, safe to log.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Raw secret fields. `Debug` prints field names only.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SecretValue(BTreeMap<String, String>);

impl SecretValue {
    /// Creates an empty value.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Reads a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    /// Field names.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl From<BTreeMap<String, String>> for SecretValue {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretValue")
            .field("fields", &self.0.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// A secret value handed to an allowed caller, tagged with its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSecret {
    /// The reference that was resolved.
    pub reference: SecretRef,
    /// Version at resolve time. Starts at 1 and grows on rotation.
    pub version: u64,
    /// The value.
    pub value: SecretValue,
}

impl ResolvedSecret {
    /// Reads a required field.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::MissingField`] if the field is absent.
    pub fn field(&self, field: &str) -> Result<&str, SecretError> {
        self.value.get(field).ok_or_else(|| SecretError::MissingField {
            secret: self.reference.name().to_string(),
            field: field.to_string(),
        })
    }
}

/// Relational database credentials stored as a secret.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseCredentials {
    /// Login name.
    pub username: String,
    /// Password.
    pub password: String,
    /// Endpoint host.
    pub host: Option<String>,
    /// Database name.
    pub dbname: String,
    /// Port.
    pub port: u16,
}

impl DatabaseCredentials {
    /// Default database name when the secret omits it.
    pub const DEFAULT_DBNAME: &'static str = "MyDatabase";
    /// Default port when the secret omits it.
    pub const DEFAULT_PORT: u16 = 5432;

    /// Reads credentials from a resolved secret.
    ///
    /// # Errors
    ///
    /// Returns an error if `username` or `password` is missing or `port` is
    /// not a number.
    pub fn from_secret(secret: &ResolvedSecret) -> Result<Self, SecretError> {
        let port = match secret.value.get("port") {
            Some(raw) => raw.trim().parse().map_err(|_| SecretError::InvalidField {
                secret: secret.reference.name().to_string(),
                field: "port".to_string(),
                reason: format!("'{raw}' is not a port number"),
            })?,
            None => Self::DEFAULT_PORT,
        };

        Ok(Self {
            username: secret.field("username")?.to_string(),
            password: secret.field("password")?.to_string(),
            host: secret.value.get("host").map(str::to_string),
            dbname: secret
                .value
                .get("dbname")
                .unwrap_or(Self::DEFAULT_DBNAME)
                .to_string(),
            port,
        })
    }

    /// Replaces the host, e.g. with a cluster endpoint from configuration.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }
}

impl fmt::Debug for DatabaseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("dbname", &self.dbname)
            .field("port", &self.port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(value: SecretValue) -> ResolvedSecret {
        ResolvedSecret {
            reference: SecretRef::new("db"),
            version: 1,
            value,
        }
    }

    #[test]
    fn test_secret_value_debug_is_redacted() {
        let value = SecretValue::new().with_field("password", "hunter2");
        let debug = format!("{value:?}");
        assert!(debug.contains("password"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_database_credentials_defaults() {
        let secret = resolved(
            SecretValue::new()
                .with_field("username", "admin")
                .with_field("password", "pw"),
        );
        let creds = DatabaseCredentials::from_secret(&secret).unwrap();
        assert_eq!(creds.dbname, "MyDatabase");
        assert_eq!(creds.port, 5432);
        assert!(creds.host.is_none());
        assert!(!format!("{creds:?}").contains("pw\""));
    }

    #[test]
    fn test_database_credentials_explicit_fields() {
        let secret = resolved(
            SecretValue::new()
                .with_field("username", "admin")
                .with_field("password", "pw")
                .with_field("host", "db.internal")
                .with_field("dbname", "analytics")
                .with_field("port", "6432"),
        );
        let creds = DatabaseCredentials::from_secret(&secret)
            .unwrap()
            .with_host("cluster.endpoint");
        assert_eq!(creds.port, 6432);
        assert_eq!(creds.dbname, "analytics");
        assert_eq!(creds.host.as_deref(), Some("cluster.endpoint"));
    }

    #[test]
    fn test_database_credentials_missing_password() {
        let secret = resolved(SecretValue::new().with_field("username", "admin"));
        assert!(matches!(
            DatabaseCredentials::from_secret(&secret),
            Err(SecretError::MissingField { field, .. }) if field == "password"
        ));
    }

    #[test]
    fn test_database_credentials_bad_port() {
        let secret = resolved(
            SecretValue::new()
                .with_field("username", "a")
                .with_field("password", "b")
                .with_field("port", "postgres"),
        );
        assert!(matches!(
            DatabaseCredentials::from_secret(&secret),
            Err(SecretError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_secret_ref_display_is_id() {
        let reference = SecretRef::new("db");
        assert_eq!(reference.name(), "db");
        assert!(reference.to_string().starts_with("secret:db-"));
    }
}
