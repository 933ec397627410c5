//! Error types for the swap protocol.

use crate::RequestStatus;
use crossnotary_crypto::CryptoError;
use thiserror::Error;

/// Main error type for swap operations.
#[derive(Error, Debug)]
pub enum SwapError {
    /// A proposal, transaction or request failed a business rule.
    #[error("Validation failed: {0}")]
    ValidationFailure(String),

    /// Unknown request, state or transaction.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing or invalid signature, or caller not permitted.
    #[error("Authorization failed: {0}")]
    AuthorizationFailure(String),

    /// Operation attempted on the wrong side of a deadline.
    #[error("Deadline violation: {0}")]
    DeadlineViolation(String),

    /// Recomputed id or recorded value disagrees with what was claimed.
    #[error("Consistency fault: {0}")]
    ConsistencyFault(String),

    /// Holdings missing or insufficient for the requested asset.
    #[error("Asset unavailable: {0}")]
    AssetUnavailable(String),

    /// The escrow transaction could not be committed.
    #[error("Escrow commit failed: {0}")]
    EscrowCommitFailed(String),

    /// Invalid request status transition.
    #[error("Invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: RequestStatus,
        to: RequestStatus,
    },

    /// Counterparty went away.
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// Timeout.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Counterparty sent a message out of order.
    #[error("Unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage { expected: String, actual: String },

    /// Counterparty aborted the session.
    #[error("Counterparty aborted: {0}")]
    CounterpartyAborted(String),

    /// Request store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Ledger or notary failure.
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Encoding or decoding failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Crypto error.
    #[error("Cryptographic error: {0}")]
    Crypto(String),
}

impl SwapError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwapError::SessionClosed(_) | SwapError::Timeout(_) | SwapError::Store(_)
        )
    }

    /// Get suggested retry delay in milliseconds.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            SwapError::SessionClosed(_) => Some(1000),
            SwapError::Timeout(_) => Some(1000),
            SwapError::Store(_) => Some(500),
            _ => None,
        }
    }

    /// Whether the request must be aborted with a recorded reason.
    pub fn aborts_request(&self) -> bool {
        matches!(
            self,
            SwapError::ValidationFailure(_)
                | SwapError::ConsistencyFault(_)
                | SwapError::AuthorizationFailure(_)
                | SwapError::DeadlineViolation(_)
                | SwapError::AssetUnavailable(_)
                | SwapError::EscrowCommitFailed(_)
                | SwapError::CounterpartyAborted(_)
        )
    }

    /// Get error code for protocol messages.
    pub fn error_code(&self) -> &'static str {
        match self {
            SwapError::ValidationFailure(_) => "VALIDATION_FAILURE",
            SwapError::NotFound(_) => "NOT_FOUND",
            SwapError::AuthorizationFailure(_) => "AUTHORIZATION_FAILURE",
            SwapError::DeadlineViolation(_) => "DEADLINE_VIOLATION",
            SwapError::ConsistencyFault(_) => "CONSISTENCY_FAULT",
            SwapError::AssetUnavailable(_) => "ASSET_UNAVAILABLE",
            SwapError::EscrowCommitFailed(_) => "ESCROW_COMMIT_FAILED",
            SwapError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SwapError::SessionClosed(_) => "SESSION_CLOSED",
            SwapError::Timeout(_) => "TIMEOUT",
            SwapError::UnexpectedMessage { .. } => "UNEXPECTED_MESSAGE",
            SwapError::CounterpartyAborted(_) => "COUNTERPARTY_ABORTED",
            SwapError::Store(_) => "STORE_ERROR",
            SwapError::Ledger(_) => "LEDGER_ERROR",
            SwapError::Configuration(_) => "CONFIGURATION_ERROR",
            SwapError::Serialization(_) => "SERIALIZATION_ERROR",
            SwapError::Crypto(_) => "CRYPTO_ERROR",
        }
    }
}

impl From<CryptoError> for SwapError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidSignature => {
                SwapError::AuthorizationFailure("invalid signature".to_string())
            }
            other => SwapError::Crypto(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SwapError {
    fn from(err: serde_json::Error) -> Self {
        SwapError::Serialization(err.to_string())
    }
}

/// Result type alias for swap operations.
pub type Result<T> = std::result::Result<T, SwapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SwapError::Timeout("escrow signature".into()).is_retryable());
        assert!(SwapError::SessionClosed("peer gone".into()).is_retryable());
        assert!(!SwapError::ConsistencyFault("id".into()).is_retryable());
        assert!(!SwapError::EscrowCommitFailed("double spend".into()).is_retryable());
    }

    #[test]
    fn test_validation_errors_abort() {
        assert!(SwapError::ValidationFailure("x".into()).aborts_request());
        assert!(SwapError::ConsistencyFault("x".into()).aborts_request());
        assert!(!SwapError::Timeout("x".into()).aborts_request());
    }

    #[test]
    fn test_invalid_signature_is_authorization_failure() {
        let err: SwapError = CryptoError::InvalidSignature.into();
        assert_eq!(err.error_code(), "AUTHORIZATION_FAILURE");
    }
}
