//! Cryptographic hash functions and content-addressed identifiers.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::{CryptoError, Result};

/// Compute SHA-256 hash.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute SHA-256 hash and return as hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// A SHA-256 digest used as a content address (transaction ids, component
/// hashes, draft references).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecureHash([u8; 32]);

impl SecureHash {
    /// Hash arbitrary bytes.
    pub fn of(data: &[u8]) -> Self {
        Self(sha256(data))
    }

    /// Hash the concatenation of several digests, in order.
    pub fn concat(parts: &[SecureHash]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.0);
        }
        Self(hasher.finalize().into())
    }

    /// Wrap raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a hex-encoded digest.
    pub fn parse(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str).map_err(|e| CryptoError::InvalidHash(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidHash("expected 32 bytes".to_string()))?;
        Ok(Self(bytes))
    }

    /// Get raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Get digest as hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for SecureHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for SecureHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureHash({})", self.short())
    }
}

impl Serialize for SecureHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SecureHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        SecureHash::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sha256() {
        let hash = sha256(b"hello");
        let hex = sha256_hex(b"hello");

        assert_eq!(hash.len(), 32);
        assert_eq!(
            hex,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_concat_is_order_sensitive() {
        let a = SecureHash::of(b"inputs");
        let b = SecureHash::of(b"outputs");

        assert_ne!(SecureHash::concat(&[a, b]), SecureHash::concat(&[b, a]));
        assert_eq!(SecureHash::concat(&[a, b]), SecureHash::concat(&[a, b]));
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        assert!(SecureHash::parse("abcd").is_err());
        assert!(SecureHash::parse("not-hex").is_err());
    }

    proptest! {
        #[test]
        fn single_bit_flip_changes_digest(
            data in proptest::collection::vec(any::<u8>(), 1..256),
            bit in 0usize..8,
            at in any::<prop::sample::Index>(),
        ) {
            let mut mutated = data.clone();
            let i = at.index(mutated.len());
            mutated[i] ^= 1 << bit;
            prop_assert_ne!(SecureHash::of(&data), SecureHash::of(&mutated));
        }
    }
}
