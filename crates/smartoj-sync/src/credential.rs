//! Passwords for the replica connection and the search cluster.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};

const PLACEHOLDER: &str = "[REDACTED]";

/// A password read from the config file.
///
/// `Debug` and config dumps print a placeholder; connection code reads
/// the value through [`Credential::expose_secret`].
#[derive(Clone, Deserialize)]
#[serde(from = "String")]
pub struct Credential(SecretString);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::from(value.into()))
    }

    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }

    /// An empty password means "connect without one".
    pub fn is_set(&self) -> bool {
        !self.0.expose_secret().is_empty()
    }
}

impl Default for Credential {
    fn default() -> Self {
        Self::new("")
    }
}

impl From<String> for Credential {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(PLACEHOLDER)
    }
}

impl Serialize for Credential {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(PLACEHOLDER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_printed() {
        let password = Credential::new("hunter2");
        assert_eq!(format!("{:?}", password), PLACEHOLDER);
        assert_eq!(
            serde_json::to_string(&password).unwrap(),
            format!("\"{}\"", PLACEHOLDER)
        );
    }

    #[test]
    fn test_loaded_from_config_value() {
        let password: Credential = serde_yaml::from_str("hunter2").unwrap();
        assert_eq!(password.expose_secret(), "hunter2");
        assert!(password.is_set());
        assert!(!Credential::default().is_set());
    }
}
