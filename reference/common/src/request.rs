//! Exchange request record and its lifecycle state machine.

use crossnotary_crypto::SecureHash;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{now, AssetRequest, Party, RequestId, SwapError, Timestamp};

/// Lifecycle status of an exchange request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// Created by the buyer, awaiting the seller's decision.
    Requested,
    /// Seller agreed; the swap may be executed.
    Approved,
    /// Seller refused.
    Denied,
    /// Execution stopped after approval (validation failure or revert).
    Aborted,
}

impl RequestStatus {
    /// Check if this is a final state.
    pub fn is_final(&self) -> bool {
        matches!(self, RequestStatus::Denied | RequestStatus::Aborted)
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[RequestStatus] {
        match self {
            RequestStatus::Requested => &[RequestStatus::Approved, RequestStatus::Denied],
            RequestStatus::Approved => &[RequestStatus::Aborted],
            RequestStatus::Denied => &[],
            RequestStatus::Aborted => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Requested => "REQUESTED",
            RequestStatus::Approved => "APPROVED",
            RequestStatus::Denied => "DENIED",
            RequestStatus::Aborted => "ABORTED",
        }
    }

    /// Parse the persisted form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REQUESTED" => Some(RequestStatus::Requested),
            "APPROVED" => Some(RequestStatus::Approved),
            "DENIED" => Some(RequestStatus::Denied),
            "ABORTED" => Some(RequestStatus::Aborted),
            _ => None,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The terms of a swap and where it is in its lifecycle.
///
/// The buyer gives `buyer_asset` to the seller and receives `seller_asset`.
/// Records are never deleted; terminal records stay as an audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRequest {
    pub id: RequestId,
    pub buyer: Party,
    pub seller: Party,
    /// Asset the buyer pays with.
    pub buyer_asset: AssetRequest,
    /// Asset the seller delivers.
    pub seller_asset: AssetRequest,
    pub status: RequestStatus,
    /// Why the request was denied or aborted.
    pub reason: Option<String>,
    /// Id of the buyer's draft transfer, once negotiated.
    pub draft_transfer_id: Option<SecureHash>,
    /// Serialized unsigned draft transfer (buyer side only).
    pub unsigned_transfer: Option<Vec<u8>>,
    /// Id of the committed escrow transaction, which is also the lock id.
    pub escrow_tx_id: Option<SecureHash>,
    /// Id of the committed buyer-leg transaction.
    pub settlement_tx_id: Option<SecureHash>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ExchangeRequest {
    /// Create a new request in `REQUESTED`.
    pub fn new(
        buyer: Party,
        seller: Party,
        buyer_asset: AssetRequest,
        seller_asset: AssetRequest,
    ) -> Result<Self, SwapError> {
        if buyer.key == seller.key || buyer.name == seller.name {
            return Err(SwapError::ValidationFailure(
                "buyer and seller must be different parties".to_string(),
            ));
        }
        buyer_asset.validate()?;
        seller_asset.validate()?;

        let created_at = now();
        Ok(Self {
            id: RequestId::new(),
            buyer,
            seller,
            buyer_asset,
            seller_asset,
            status: RequestStatus::Requested,
            reason: None,
            draft_transfer_id: None,
            unsigned_transfer: None,
            escrow_tx_id: None,
            settlement_tx_id: None,
            created_at,
            updated_at: created_at,
        })
    }

    /// Transition to a new status.
    pub fn transition_to(&mut self, next: RequestStatus) -> Result<(), SwapError> {
        if !self.status.can_transition_to(next) {
            return Err(SwapError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Seller accepts the terms.
    pub fn approve(&mut self) -> Result<(), SwapError> {
        self.transition_to(RequestStatus::Approved)
    }

    /// Seller refuses the terms.
    pub fn deny(&mut self, reason: Option<String>) -> Result<(), SwapError> {
        self.transition_to(RequestStatus::Denied)?;
        self.reason = reason;
        Ok(())
    }

    /// Stop an approved request.
    pub fn abort(&mut self, reason: impl Into<String>) -> Result<(), SwapError> {
        self.transition_to(RequestStatus::Aborted)?;
        self.reason = Some(reason.into());
        Ok(())
    }

    /// Fail unless the request is in `expected`.
    pub fn require_status(&self, expected: RequestStatus) -> Result<(), SwapError> {
        if self.status != expected {
            return Err(SwapError::ValidationFailure(format!(
                "request {} is {}, expected {}",
                self.id, self.status, expected
            )));
        }
        Ok(())
    }

    /// Record the draft transfer id. A different id than one already
    /// recorded is a consistency fault; the same id is a no-op.
    pub fn record_draft_id(&mut self, draft_id: SecureHash) -> Result<(), SwapError> {
        match self.draft_transfer_id {
            Some(existing) if existing != draft_id => Err(SwapError::ConsistencyFault(format!(
                "request {} already bound to draft {}, got {}",
                self.id,
                existing.short(),
                draft_id.short()
            ))),
            Some(_) => Ok(()),
            None => {
                self.draft_transfer_id = Some(draft_id);
                self.touch();
                Ok(())
            }
        }
    }

    /// Record the draft id together with the serialized unsigned transfer.
    pub fn record_draft(&mut self, draft_id: SecureHash, bytes: Vec<u8>) -> Result<(), SwapError> {
        self.record_draft_id(draft_id)?;
        match &self.unsigned_transfer {
            Some(existing) if *existing != bytes => Err(SwapError::ConsistencyFault(format!(
                "request {} already holds a different draft body",
                self.id
            ))),
            Some(_) => Ok(()),
            None => {
                self.unsigned_transfer = Some(bytes);
                Ok(())
            }
        }
    }

    /// Record the committed escrow transaction id (write-once).
    pub fn record_escrow(&mut self, tx_id: SecureHash) -> Result<(), SwapError> {
        match self.escrow_tx_id {
            Some(existing) if existing == tx_id => Ok(()),
            Some(existing) => Err(SwapError::ConsistencyFault(format!(
                "request {} already escrowed by {}, got {}",
                self.id,
                existing.short(),
                tx_id.short()
            ))),
            None => {
                self.escrow_tx_id = Some(tx_id);
                self.touch();
                Ok(())
            }
        }
    }

    /// Record the committed buyer-leg transaction id (write-once).
    pub fn record_settlement(&mut self, tx_id: SecureHash) -> Result<(), SwapError> {
        match self.settlement_tx_id {
            Some(existing) if existing == tx_id => Ok(()),
            Some(existing) => Err(SwapError::ConsistencyFault(format!(
                "request {} already settled by {}, got {}",
                self.id,
                existing.short(),
                tx_id.short()
            ))),
            None => {
                self.settlement_tx_id = Some(tx_id);
                self.touch();
                Ok(())
            }
        }
    }

    /// Whether the buyer's leg has been committed.
    pub fn is_settled(&self) -> bool {
        self.settlement_tx_id.is_some()
    }

    fn touch(&mut self) {
        self.updated_at = now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossnotary_crypto::SigningKey;
    use rust_decimal::Decimal;

    fn create_test_request() -> ExchangeRequest {
        let buyer = Party::new("BUYER", SigningKey::generate().public_key());
        let seller = Party::new("SELLER", SigningKey::generate().public_key());
        ExchangeRequest::new(
            buyer,
            seller,
            AssetRequest::fungible("USD", Decimal::new(100, 0)),
            AssetRequest::non_fungible("ART", "sunflowers"),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_transitions() {
        assert!(RequestStatus::Requested.can_transition_to(RequestStatus::Approved));
        assert!(RequestStatus::Requested.can_transition_to(RequestStatus::Denied));
        assert!(RequestStatus::Approved.can_transition_to(RequestStatus::Aborted));

        assert!(!RequestStatus::Approved.can_transition_to(RequestStatus::Approved));
        assert!(!RequestStatus::Approved.can_transition_to(RequestStatus::Requested));
        assert!(!RequestStatus::Denied.can_transition_to(RequestStatus::Approved));
        assert!(!RequestStatus::Requested.can_transition_to(RequestStatus::Aborted));
    }

    #[test]
    fn test_reapproval_rejected() {
        let mut request = create_test_request();
        request.approve().unwrap();

        let err = request.approve().unwrap_err();
        assert!(matches!(err, SwapError::InvalidTransition { .. }));
        assert_eq!(request.status, RequestStatus::Approved);
    }

    #[test]
    fn test_abort_records_reason() {
        let mut request = create_test_request();
        request.approve().unwrap();
        request.abort("deadline passed").unwrap();

        assert_eq!(request.status, RequestStatus::Aborted);
        assert_eq!(request.reason.as_deref(), Some("deadline passed"));
        assert!(request.abort("again").is_err());
    }

    #[test]
    fn test_same_party_rejected() {
        let key = SigningKey::generate().public_key();
        let result = ExchangeRequest::new(
            Party::new("A", key),
            Party::new("B", key),
            AssetRequest::fungible("USD", Decimal::ONE),
            AssetRequest::fungible("EUR", Decimal::ONE),
        );
        assert!(matches!(result, Err(SwapError::ValidationFailure(_))));
    }

    #[test]
    fn test_settlement_id_write_once() {
        let mut request = create_test_request();
        let first = SecureHash::of(b"first");

        request.record_settlement(first).unwrap();
        request.record_settlement(first).unwrap();
        assert!(request.record_settlement(SecureHash::of(b"second")).is_err());
        assert_eq!(request.settlement_tx_id, Some(first));
    }

    #[test]
    fn test_escrow_id_write_once() {
        let mut request = create_test_request();
        let escrow = SecureHash::of(b"escrow");

        request.record_escrow(escrow).unwrap();
        request.record_escrow(escrow).unwrap();
        let err = request.record_escrow(SecureHash::of(b"another escrow")).unwrap_err();
        assert!(matches!(err, SwapError::ConsistencyFault(_)));
        assert_eq!(request.escrow_tx_id, Some(escrow));
    }

    #[test]
    fn test_draft_id_mismatch_is_consistency_fault() {
        let mut request = create_test_request();
        request
            .record_draft(SecureHash::of(b"draft"), b"body".to_vec())
            .unwrap();

        let err = request
            .record_draft_id(SecureHash::of(b"other"))
            .unwrap_err();
        assert!(matches!(err, SwapError::ConsistencyFault(_)));
        assert!(request.record_draft_id(SecureHash::of(b"draft")).is_ok());
    }

    #[test]
    fn test_status_persisted_form() {
        for status in [
            RequestStatus::Requested,
            RequestStatus::Approved,
            RequestStatus::Denied,
            RequestStatus::Aborted,
        ] {
            assert_eq!(RequestStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RequestStatus::parse("SETTLED"), None);
    }
}
