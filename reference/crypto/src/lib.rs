//! CrossNotary Cryptographic Primitives
//!
//! Ed25519 signing for parties and notaries, SHA-256 content addressing, and
//! multi-signer authorization policies used for dual-control holders.

pub mod hash;
pub mod policy;
pub mod signing;

pub use hash::{sha256, sha256_hex, SecureHash};
pub use policy::SignerPolicy;
pub use signing::{PublicKey, Signature, SigningKey};

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid hash: {0}")]
    InvalidHash(String),

    #[error("Invalid signer policy: {0}")]
    InvalidPolicy(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
