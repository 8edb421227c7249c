//! Secret string wrapper that never appears in logs.

use serde::Deserialize;

/// Wrapper for secrets (client tokens, SMTP passwords) that never appears in logs.
///
/// The `Debug` and `Display` implementations always show `[REDACTED]`
/// instead of the actual value.
///
/// # Example
///
/// ```
/// use pushmail::config::SecretString;
///
/// let secret = SecretString::new("C8xq-client-token".to_string());
/// assert_eq!(format!("{:?}", secret), "[REDACTED]");
/// assert_eq!(secret.expose(), "C8xq-client-token");
/// ```
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    /// Creates a new `SecretString` from a regular `String`.
    pub fn new(s: String) -> Self {
        SecretString(s)
    }

    /// Exposes the underlying secret value.
    ///
    /// Never pass the result to logging functions.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns true when the secret holds no characters.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a copy with surrounding whitespace removed.
    pub fn trimmed(&self) -> Self {
        SecretString(self.0.trim().to_string())
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(SecretString::new(s))
    }
}
