//! Scalar values flowing through registers, tuples, and bags.
//!
//! Values are a closed sum over numbers, text, booleans and identifiers.
//! Equality is structural; numbers compare by normalized bit pattern so that
//! `Value` can be used as a hash key. `key_of` is a stable content hash that
//! does not depend on the process or platform.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::id::Uuid;

/// A scalar value.
///
/// # Examples
///
/// ```
/// use blockflow::Value;
///
/// let n = Value::from(2024);
/// let s = Value::from("alice");
///
/// assert!(n.is_number());
/// assert_eq!(s.as_text(), Some("alice"));
/// assert_eq!(Value::from(1.0), Value::from(1));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// 64-bit float; integers are stored here too.
    Number(f64),
    /// Shared UTF-8 text.
    Text(Arc<str>),
    /// `true` or `false`.
    Boolean(bool),
    /// A 96-bit identifier.
    Uuid(Uuid),
}

const TAG_NUMBER: u8 = 1;
const TAG_TEXT: u8 = 2;
const TAG_BOOLEAN: u8 = 3;
const TAG_UUID: u8 = 4;

fn normalized_bits(n: f64) -> u64 {
    if n.is_nan() {
        f64::NAN.to_bits()
    } else if n == 0.0 {
        0.0f64.to_bits()
    } else {
        n.to_bits()
    }
}

impl Value {
    /// Returns true for numbers.
    pub const fn is_number(&self) -> bool {
        matches!(self, Self::Number(_))
    }

    /// Returns true for text.
    pub const fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    /// Returns true for booleans.
    pub const fn is_boolean(&self) -> bool {
        matches!(self, Self::Boolean(_))
    }

    /// Returns true for identifiers.
    pub const fn is_uuid(&self) -> bool {
        matches!(self, Self::Uuid(_))
    }

    /// The number, if this is one.
    pub const fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            _ => None,
        }
    }

    /// The text, if this is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    /// The boolean, if this is one.
    pub const fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// The identifier, if this is one.
    pub const fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Number(_) => "number",
            Self::Text(_) => "text",
            Self::Boolean(_) => "boolean",
            Self::Uuid(_) => "uuid",
        }
    }

    /// Structural equality.
    #[must_use]
    pub fn equals(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => normalized_bits(*a) == normalized_bits(*b),
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Uuid(a), Self::Uuid(b)) => a == b,
            _ => false,
        }
    }

    /// Writes the canonical tagged encoding used for hashing and ordering.
    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Number(n) => {
                out.push(TAG_NUMBER);
                out.extend_from_slice(&normalized_bits(*n).to_le_bytes());
            }
            Self::Text(s) => {
                out.push(TAG_TEXT);
                out.extend_from_slice(&(s.len() as u64).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Self::Boolean(b) => {
                out.push(TAG_BOOLEAN);
                out.push(u8::from(*b));
            }
            Self::Uuid(id) => {
                out.push(TAG_UUID);
                out.extend_from_slice(id.as_bytes());
            }
        }
    }

    /// Stable 64-bit content hash.
    #[must_use]
    pub fn key_of(&self) -> u64 {
        let mut buf = Vec::with_capacity(16);
        self.encode_into(&mut buf);
        key_of_bytes(&buf)
    }

    /// Ordering used by comparison filters: numbers numerically, text
    /// lexicographically. Mixed or unordered types yield `None`.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.partial_cmp(b),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Boolean(a), Self::Boolean(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// Hashes an already-encoded byte string with blake3, truncated to 64 bits.
pub(crate) fn key_of_bytes(bytes: &[u8]) -> u64 {
    let digest = blake3::hash(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Number(n) => {
                TAG_NUMBER.hash(state);
                normalized_bits(*n).hash(state);
            }
            Self::Text(s) => {
                TAG_TEXT.hash(state);
                s.hash(state);
            }
            Self::Boolean(b) => {
                TAG_BOOLEAN.hash(state);
                b.hash(state);
            }
            Self::Uuid(id) => {
                TAG_UUID.hash(state);
                id.hash(state);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(v) if v.fract() == 0.0 && v.is_finite() && v.abs() < 1e15 => {
                write!(f, "{}", *v as i64)
            }
            Self::Number(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Uuid(v) => write!(f, "#{v}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Number(f64::from(v))
    }
}

impl From<i64> for Value {
    #[allow(clippy::cast_precision_loss)]
    fn from(v: i64) -> Self {
        Self::Number(v as f64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(Arc::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(Arc::from(v))
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_value_number() {
        let val = Value::from(42);
        assert!(val.is_number());
        assert_eq!(val.as_number(), Some(42.0));
        assert_eq!(val.type_name(), "number");
    }

    #[test]
    fn test_value_text() {
        let val = Value::from("hello");
        assert!(val.is_text());
        assert_eq!(val.as_text(), Some("hello"));
        assert_eq!(val.type_name(), "text");
    }

    #[test]
    fn test_zero_and_nan_normalize() {
        assert_eq!(Value::from(0.0), Value::from(-0.0));
        assert_eq!(Value::from(f64::NAN), Value::from(f64::NAN));
        assert_eq!(Value::from(0.0).key_of(), Value::from(-0.0).key_of());
    }

    #[test]
    fn test_key_of_distinguishes_types() {
        assert_ne!(Value::from(1).key_of(), Value::from(true).key_of());
        assert_ne!(Value::from("1").key_of(), Value::from(1).key_of());
    }

    #[test]
    fn test_key_of_is_stable() {
        let a = Value::from("alice");
        let b = Value::from(String::from("alice"));
        assert_eq!(a.key_of(), b.key_of());
    }

    #[test]
    fn test_hash_consistent_with_equals() {
        let mut set = HashSet::new();
        set.insert(Value::from(1990));
        set.insert(Value::from(1990.0));
        set.insert(Value::from(-0.0));
        set.insert(Value::from(0.0));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_compare() {
        assert_eq!(Value::from(1).compare(&Value::from(2)), Some(Ordering::Less));
        assert_eq!(Value::from("b").compare(&Value::from("a")), Some(Ordering::Greater));
        assert_eq!(Value::from(1).compare(&Value::from("a")), None);
    }

    #[test]
    fn test_value_display() {
        assert_eq!(format!("{}", Value::from(34)), "34");
        assert_eq!(format!("{}", Value::from(2.5)), "2.5");
        assert_eq!(format!("{}", Value::from("hi")), "\"hi\"");
        assert_eq!(format!("{}", Value::from(true)), "true");
    }

    #[test]
    fn test_value_serialization() {
        let val = Value::from("test");
        let json = serde_json::to_string(&val).unwrap();
        assert_eq!(json, r#"{"type":"text","value":"test"}"#);
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(val, back);
    }
}
