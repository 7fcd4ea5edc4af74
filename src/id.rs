//! 12-byte identifiers for bags, scopes, and evaluations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Length of a binary identifier in bytes.
pub const UUID_LENGTH: usize = 12;

/// Error returned when a textual identifier cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid uuid '{input}': expected {expected} hex digits")]
pub struct ParseUuidError {
    input: String,
    expected: usize,
}

/// A 12-byte binary identifier.
///
/// The textual form is 24 lowercase hex digits.
///
/// # Examples
///
/// ```
/// use blockflow::Uuid;
///
/// let id = Uuid::generate();
/// let parsed = Uuid::parse(&id.to_string()).unwrap();
/// assert_eq!(id, parsed);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uuid([u8; UUID_LENGTH]);

impl Uuid {
    /// Generates a new random identifier.
    #[must_use]
    pub fn generate() -> Self {
        let wide = uuid::Uuid::new_v4();
        let mut bytes = [0u8; UUID_LENGTH];
        bytes.copy_from_slice(&wide.as_bytes()[..UUID_LENGTH]);
        Self(bytes)
    }

    /// Wraps raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; UUID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; UUID_LENGTH] {
        &self.0
    }

    /// Parses the textual form.
    pub fn parse(s: &str) -> Result<Self, ParseUuidError> {
        let err = || ParseUuidError {
            input: s.to_string(),
            expected: UUID_LENGTH * 2,
        };
        let trimmed = s.trim();
        if trimmed.len() != UUID_LENGTH * 2 {
            return Err(err());
        }
        let decoded = hex::decode(trimmed).map_err(|_| err())?;
        let mut bytes = [0u8; UUID_LENGTH];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uuid({self})")
    }
}

impl FromStr for Uuid {
    type Err = ParseUuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Uuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Uuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(Uuid::generate(), Uuid::generate());
    }

    #[test]
    fn textual_form_is_24_hex_digits() {
        let id = Uuid::from_bytes([0xab; UUID_LENGTH]);
        assert_eq!(id.to_string(), "abababababababababababab");
    }

    #[test]
    fn parse_rejects_wrong_length_and_non_hex() {
        assert!(Uuid::parse("abc").is_err());
        assert!(Uuid::parse("zzzzzzzzzzzzzzzzzzzzzzzz").is_err());
        let err = Uuid::parse("1234").unwrap_err();
        assert!(err.to_string().contains("24 hex digits"));
    }

    #[test]
    fn serde_uses_textual_form() {
        let id = Uuid::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: Uuid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
