//! Ledger and notary errors.

use crossnotary_common::{NotaryId, SwapError};
use crossnotary_crypto::{CryptoError, SecureHash};
use thiserror::Error;

use crate::{ContractViolation, StateRef};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Unknown state: {0}")]
    UnknownState(StateRef),

    #[error("Unknown transaction: {0}")]
    UnknownTransaction(SecureHash),

    #[error("State {state} already consumed by {consumed_by}")]
    DoubleSpend {
        state: StateRef,
        consumed_by: SecureHash,
    },

    #[error("Wrong notary: expected {expected}, got {actual:?}")]
    WrongNotary {
        expected: NotaryId,
        actual: Option<NotaryId>,
    },

    #[error("Unknown notary: {0}")]
    UnknownNotary(String),

    #[error("Time window violation: {0}")]
    TimeWindow(String),

    #[error("Missing signatures from: {0:?}")]
    MissingSignatures(Vec<String>),

    #[error("Invalid signature by {0}")]
    InvalidSignature(String),

    #[error("Encumbrance violation: {0}")]
    Encumbrance(String),

    #[error("Contract violation: {0}")]
    Contract(#[from] ContractViolation),

    #[error("No contract registered under {0}")]
    UnknownContract(String),

    #[error("Insufficient holdings: {0}")]
    InsufficientHoldings(String),

    #[error("Malformed transaction: {0}")]
    Malformed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    /// Whether the notary refused because an input was already consumed.
    pub fn is_double_spend(&self) -> bool {
        matches!(self, LedgerError::DoubleSpend { .. })
    }
}

impl From<CryptoError> for LedgerError {
    fn from(err: CryptoError) -> Self {
        LedgerError::InvalidSignature(err.to_string())
    }
}

impl From<LedgerError> for SwapError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::UnknownState(_) | LedgerError::UnknownTransaction(_) => {
                SwapError::NotFound(err.to_string())
            }
            LedgerError::TimeWindow(_) => SwapError::DeadlineViolation(err.to_string()),
            LedgerError::MissingSignatures(_) | LedgerError::InvalidSignature(_) => {
                SwapError::AuthorizationFailure(err.to_string())
            }
            LedgerError::Contract(_) | LedgerError::Encumbrance(_) | LedgerError::Malformed(_) => {
                SwapError::ValidationFailure(err.to_string())
            }
            LedgerError::InsufficientHoldings(_) => SwapError::AssetUnavailable(err.to_string()),
            other => SwapError::Ledger(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
