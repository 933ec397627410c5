//! Protocol message types.

use crossnotary_common::{ExchangeRequest, RequestId, SwapError, Timestamp};
use crossnotary_crypto::SecureHash;
use crossnotary_ledger::{SignedTransaction, TransactionSignature, WireTransaction};
use serde::{Deserialize, Serialize};

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: &str = "1.0";

/// The buyer's unsigned transfer, offered for validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftProposal {
    pub request_id: RequestId,
    /// The unsigned buyer-to-seller transfer.
    pub transfer: WireTransaction,
    /// Id the buyer claims for `transfer`. Never trusted; always recomputed.
    pub claimed_id: SecureHash,
    /// Committed transactions producing every input of `transfer`.
    pub dependencies: Vec<SignedTransaction>,
}

/// Seller's verdict after evaluating its own deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SellerDecision {
    /// Deadline not reached; buyer should settle.
    Proceed,
    /// Deadline passed; escrow is being reclaimed.
    Reverting,
}

/// A message on a swap session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwapMessage {
    /// Buyer shares new terms with the seller.
    ExchangeProposal { request: ExchangeRequest },
    /// Seller's approval decision on proposed terms.
    ExchangeDecision {
        approved: bool,
        reason: Option<String>,
    },
    /// Receipt for a proposal or decision.
    Acknowledged,

    DraftProposal(DraftProposal),
    DraftAccepted { draft_id: SecureHash },
    DraftRejected { reason: String },

    /// Seller-signed escrow transaction awaiting the buyer's co-signature.
    EscrowSignatureRequest { tx: SignedTransaction },
    EscrowSignature { signature: TransactionSignature },
    /// Escrow transaction as committed, with the seller notary's signature.
    EscrowCommitted { tx: SignedTransaction },

    Decision { decision: SellerDecision },

    /// Buyer-signed release, with the committed settlement as proof source.
    ReleaseProposal {
        tx: SignedTransaction,
        settlement: SignedTransaction,
    },
    ReleaseSignature { signature: TransactionSignature },
    ReleaseCommitted { tx: SignedTransaction },
    /// Buyer could not commit its leg.
    SettlementFailed { reason: String },

    RevertIntentSignatureRequest { tx: SignedTransaction },
    RevertSignatureRequest { tx: SignedTransaction },
    RevertSignature { signature: TransactionSignature },
    RevertCommitted { tx: SignedTransaction },

    Abort { code: String, reason: String },
}

impl SwapMessage {
    /// Stable name of the message kind, for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            SwapMessage::ExchangeProposal { .. } => "EXCHANGE_PROPOSAL",
            SwapMessage::ExchangeDecision { .. } => "EXCHANGE_DECISION",
            SwapMessage::Acknowledged => "ACKNOWLEDGED",
            SwapMessage::DraftProposal(_) => "DRAFT_PROPOSAL",
            SwapMessage::DraftAccepted { .. } => "DRAFT_ACCEPTED",
            SwapMessage::DraftRejected { .. } => "DRAFT_REJECTED",
            SwapMessage::EscrowSignatureRequest { .. } => "ESCROW_SIGNATURE_REQUEST",
            SwapMessage::EscrowSignature { .. } => "ESCROW_SIGNATURE",
            SwapMessage::EscrowCommitted { .. } => "ESCROW_COMMITTED",
            SwapMessage::Decision { .. } => "DECISION",
            SwapMessage::ReleaseProposal { .. } => "RELEASE_PROPOSAL",
            SwapMessage::ReleaseSignature { .. } => "RELEASE_SIGNATURE",
            SwapMessage::ReleaseCommitted { .. } => "RELEASE_COMMITTED",
            SwapMessage::SettlementFailed { .. } => "SETTLEMENT_FAILED",
            SwapMessage::RevertIntentSignatureRequest { .. } => "REVERT_INTENT_SIGNATURE_REQUEST",
            SwapMessage::RevertSignatureRequest { .. } => "REVERT_SIGNATURE_REQUEST",
            SwapMessage::RevertSignature { .. } => "REVERT_SIGNATURE",
            SwapMessage::RevertCommitted { .. } => "REVERT_COMMITTED",
            SwapMessage::Abort { .. } => "ABORT",
        }
    }

    /// Abort message carrying `err`'s code.
    pub fn abort(err: &SwapError) -> Self {
        SwapMessage::Abort {
            code: err.error_code().to_string(),
            reason: err.to_string(),
        }
    }
}

/// Versioned wire form of a [`SwapMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapEnvelope {
    pub version: String,
    pub request_id: RequestId,
    pub sent_at: Timestamp,
    pub message: SwapMessage,
}

impl SwapEnvelope {
    pub fn new(request_id: RequestId, message: SwapMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            request_id,
            sent_at: chrono::Utc::now(),
            message,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SwapError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and check the protocol version.
    pub fn decode(bytes: &[u8]) -> Result<Self, SwapError> {
        let envelope: SwapEnvelope = serde_json::from_slice(bytes)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(SwapError::ValidationFailure(format!(
                "protocol version mismatch: expected {}, got {}",
                PROTOCOL_VERSION, envelope.version
            )));
        }
        Ok(envelope)
    }
}
