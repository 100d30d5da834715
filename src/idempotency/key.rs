use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{AppError, Result};

/// Client-supplied deduplication token, validated and normalized.
///
/// Keys are trimmed, non-empty, at most [`IdempotencyKey::MAX_LENGTH`]
/// characters, and made only of ASCII alphanumerics and hyphens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub const MAX_LENGTH: usize = 128;

    pub fn parse(raw: &str) -> Result<Self> {
        let key = raw.trim();
        if key.is_empty() {
            return Err(AppError::InvalidKey("key cannot be empty".to_string()));
        }
        if key.len() > Self::MAX_LENGTH {
            return Err(AppError::InvalidKey(format!(
                "key exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(AppError::InvalidKey(
                "key contains invalid characters (allowed: a-z, A-Z, 0-9, -)".to_string(),
            ));
        }
        Ok(Self(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.0
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 hex digest over the request parts that define "the same request".
///
/// Parts are length-prefixed so that `["ab", "c"]` and `["a", "bc"]` differ.
pub fn request_fingerprint<I, P>(parts: I) -> String
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let bytes = part.as_ref();
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_alphanumerics_and_hyphens() {
        let key = IdempotencyKey::parse("abc123").unwrap();
        assert_eq!(key.as_str(), "abc123");

        let key = IdempotencyKey::parse("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(key.as_str().len(), 36);
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let key = IdempotencyKey::parse("  abc-123 \n").unwrap();
        assert_eq!(key, IdempotencyKey::parse("abc-123").unwrap());
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(matches!(IdempotencyKey::parse(""), Err(AppError::InvalidKey(_))));
        assert!(matches!(IdempotencyKey::parse("   "), Err(AppError::InvalidKey(_))));
    }

    #[test]
    fn test_parse_enforces_length_bound() {
        assert!(IdempotencyKey::parse(&"a".repeat(128)).is_ok());
        assert!(matches!(
            IdempotencyKey::parse(&"a".repeat(129)),
            Err(AppError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_parse_rejects_foreign_characters() {
        for raw in ["abc_123", "abc 123", "abc/123", "ключ", "abc\u{0}"] {
            assert!(
                matches!(IdempotencyKey::parse(raw), Err(AppError::InvalidKey(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_serde_validates() {
        let key: IdempotencyKey = serde_json::from_str("\"abc-1\"").unwrap();
        assert_eq!(key.as_str(), "abc-1");
        assert!(serde_json::from_str::<IdempotencyKey>("\"a b\"").is_err());
    }

    #[test]
    fn test_fingerprint_is_stable_and_unambiguous() {
        let a = request_fingerprint(["ab", "c"]);
        let b = request_fingerprint(["ab", "c"]);
        let c = request_fingerprint(["a", "bc"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
