//! Multi-signer authorization policies.
//!
//! A holder of ledger states is a [`SignerPolicy`] rather than a bare key: a
//! plain party is a 1-of-1 policy, an escrow holder is a 2-of-2 policy over
//! the two counterparties.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{CryptoError, PublicKey, Result, SecureHash};

/// "Ownership requires signatures from at least `threshold` keys of `keys`".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignerPolicy {
    keys: BTreeSet<PublicKey>,
    threshold: usize,
}

impl SignerPolicy {
    /// Policy satisfied by a single key.
    pub fn single(key: PublicKey) -> Self {
        Self {
            keys: BTreeSet::from([key]),
            threshold: 1,
        }
    }

    /// Policy requiring every listed key (dual control for two keys).
    pub fn all_of(keys: impl IntoIterator<Item = PublicKey>) -> Result<Self> {
        let keys: BTreeSet<PublicKey> = keys.into_iter().collect();
        let threshold = keys.len();
        Self::with_threshold(keys, threshold)
    }

    /// Policy requiring `threshold` distinct keys out of `keys`.
    pub fn with_threshold(
        keys: impl IntoIterator<Item = PublicKey>,
        threshold: usize,
    ) -> Result<Self> {
        let keys: BTreeSet<PublicKey> = keys.into_iter().collect();

        if keys.is_empty() {
            return Err(CryptoError::InvalidPolicy("no keys".to_string()));
        }
        if threshold == 0 || threshold > keys.len() {
            return Err(CryptoError::InvalidPolicy(format!(
                "threshold {} out of range for {} keys",
                threshold,
                keys.len()
            )));
        }

        Ok(Self { keys, threshold })
    }

    /// Keys named by the policy.
    pub fn keys(&self) -> &BTreeSet<PublicKey> {
        &self.keys
    }

    /// Number of distinct signatures needed.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// The key, if this is a 1-of-1 policy.
    pub fn single_key(&self) -> Option<PublicKey> {
        match (self.keys.len(), self.keys.iter().next()) {
            (1, Some(key)) => Some(*key),
            _ => None,
        }
    }

    /// Whether `key` participates in this policy.
    pub fn contains(&self, key: &PublicKey) -> bool {
        self.keys.contains(key)
    }

    /// Whether the given signer set satisfies the policy.
    pub fn is_satisfied_by<'a>(&self, signers: impl IntoIterator<Item = &'a PublicKey>) -> bool {
        let distinct: BTreeSet<&PublicKey> = signers
            .into_iter()
            .filter(|key| self.keys.contains(*key))
            .collect();
        distinct.len() >= self.threshold
    }

    /// Stable digest of the policy.
    pub fn fingerprint(&self) -> SecureHash {
        let mut bytes = (self.threshold as u64).to_be_bytes().to_vec();
        for key in &self.keys {
            bytes.extend_from_slice(key.as_bytes());
        }
        SecureHash::of(&bytes)
    }
}

impl fmt::Display for SignerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self.keys.iter().map(|k| k.key_id()).collect();
        write!(f, "{}-of-[{}]", self.threshold, ids.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SigningKey;

    #[test]
    fn test_dual_control_needs_both() {
        let seller = SigningKey::generate().public_key();
        let buyer = SigningKey::generate().public_key();
        let policy = SignerPolicy::all_of([seller, buyer]).unwrap();

        assert_eq!(policy.threshold(), 2);
        assert!(!policy.is_satisfied_by([&seller]));
        assert!(!policy.is_satisfied_by([&buyer, &buyer]));
        assert!(policy.is_satisfied_by([&buyer, &seller]));
        assert_eq!(policy.single_key(), None);
    }

    #[test]
    fn test_outsiders_do_not_count() {
        let seller = SigningKey::generate().public_key();
        let buyer = SigningKey::generate().public_key();
        let outsider = SigningKey::generate().public_key();
        let policy = SignerPolicy::all_of([seller, buyer]).unwrap();

        assert!(!policy.is_satisfied_by([&seller, &outsider]));
    }

    #[test]
    fn test_single_policy() {
        let key = SigningKey::generate().public_key();
        let policy = SignerPolicy::single(key);

        assert_eq!(policy.single_key(), Some(key));
        assert!(policy.is_satisfied_by([&key]));
    }

    #[test]
    fn test_invalid_threshold() {
        let key = SigningKey::generate().public_key();
        assert!(SignerPolicy::with_threshold([key], 0).is_err());
        assert!(SignerPolicy::with_threshold([key], 2).is_err());
        assert!(SignerPolicy::all_of(Vec::new()).is_err());
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = SigningKey::generate().public_key();
        let b = SigningKey::generate().public_key();

        assert_eq!(
            SignerPolicy::all_of([a, b]).unwrap().fingerprint(),
            SignerPolicy::all_of([b, a]).unwrap().fingerprint()
        );
    }
}
