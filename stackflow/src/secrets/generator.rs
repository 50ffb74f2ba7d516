//! Secret value generators.

use super::{SecretError, SecretValue};
use rand::Rng;

/// Produces a fresh secret value.
pub trait SecretGenerator: Send + Sync {
    /// Generates a value.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::Generation`] if no value can be produced.
    fn generate(&self) -> Result<SecretValue, SecretError>;
}

impl<F> SecretGenerator for F
where
    F: Fn() -> Result<SecretValue, SecretError> + Send + Sync,
{
    fn generate(&self) -> Result<SecretValue, SecretError> {
        self()
    }
}

const EXCLUDED: &[char] = &['"', '@', '/', '\\'];

/// Generates a `username` plus a random `password`, with optional extra
/// fields such as `host` or `dbname`.
#[derive(Debug, Clone)]
pub struct CredentialPairGenerator {
    username: String,
    password_length: usize,
    extra: Vec<(String, String)>,
}

impl CredentialPairGenerator {
    /// Minimum accepted password length.
    pub const MIN_LENGTH: usize = 8;

    /// Creates a generator with 30-character passwords.
    #[must_use]
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password_length: 30,
            extra: Vec::new(),
        }
    }

    /// Sets the password length.
    #[must_use]
    pub fn with_password_length(mut self, length: usize) -> Self {
        self.password_length = length;
        self
    }

    /// Adds a fixed field to every generated value.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    fn password(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..self.password_length)
            .map(|_| loop {
                let c = char::from(rng.gen_range(0x21u8..0x7f));
                if !EXCLUDED.contains(&c) {
                    break c;
                }
            })
            .collect()
    }
}

impl SecretGenerator for CredentialPairGenerator {
    fn generate(&self) -> Result<SecretValue, SecretError> {
        if self.username.trim().is_empty() {
            return Err(SecretError::Generation("username cannot be empty".to_string()));
        }
        if self.password_length < Self::MIN_LENGTH {
            return Err(SecretError::Generation(format!(
                "password length {} is below the minimum of {}",
                self.password_length,
                Self::MIN_LENGTH
            )));
        }

        let mut value = SecretValue::new()
            .with_field("username", self.username.clone())
            .with_field("password", self.password());
        for (key, field) in &self.extra {
            value = value.with_field(key.clone(), field.clone());
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_excludes_reserved_characters() {
        let generator = CredentialPairGenerator::new("admin").with_password_length(200);
        for _ in 0..20 {
            let value = generator.generate().unwrap();
            let password = value.get("password").unwrap();
            assert_eq!(password.len(), 200);
            assert!(!password.contains(EXCLUDED));
            assert!(!password.contains(' '));
        }
    }

    #[test]
    fn test_passwords_differ() {
        let generator = CredentialPairGenerator::new("admin");
        let a = generator.generate().unwrap();
        let b = generator.generate().unwrap();
        assert_ne!(a.get("password"), b.get("password"));
        assert_eq!(a.get("username"), Some("admin"));
    }

    #[test]
    fn test_extra_fields_and_validation() {
        let value = CredentialPairGenerator::new("admin")
            .with_field("dbname", "MyDatabase")
            .generate()
            .unwrap();
        assert_eq!(value.get("dbname"), Some("MyDatabase"));

        assert!(CredentialPairGenerator::new("admin")
            .with_password_length(4)
            .generate()
            .is_err());
        assert!(CredentialPairGenerator::new(" ").generate().is_err());
    }

    #[test]
    fn test_closure_generator() {
        let generator =
            || -> Result<SecretValue, SecretError> { Ok(SecretValue::new().with_field("token", "abc")) };
        assert_eq!(generator.generate().unwrap().get("token"), Some("abc"));
    }
}
