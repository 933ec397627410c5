//! Swap flow state definitions.

use std::fmt;

use crossnotary_crypto::SecureHash;
use serde::{Deserialize, Serialize};

/// Which side of a request a node is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Buyer,
    Seller,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Buyer => write!(f, "buyer"),
            Role::Seller => write!(f, "seller"),
        }
    }
}

/// Phase of a buyer or seller flow. Both roles move through the same phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowPhase {
    /// Nothing exchanged yet.
    Start,
    /// Draft transfer sent (buyer) or received and judged (seller).
    DraftSent,
    /// Escrow negotiated and committed.
    EscrowOffered,
    /// Buyer leg being committed and the escrow released.
    Settling,
    /// Escrow being reclaimed after the deadline.
    Reverting,
    /// Flow finished.
    Done,
}

impl FlowPhase {
    /// Get valid next phases.
    pub fn valid_transitions(&self) -> &[FlowPhase] {
        match self {
            FlowPhase::Start => &[FlowPhase::DraftSent, FlowPhase::Done],
            FlowPhase::DraftSent => &[FlowPhase::EscrowOffered, FlowPhase::Done],
            FlowPhase::EscrowOffered => &[FlowPhase::Settling, FlowPhase::Reverting],
            FlowPhase::Settling => &[FlowPhase::Reverting, FlowPhase::Done],
            FlowPhase::Reverting => &[FlowPhase::Done],
            FlowPhase::Done => &[],
        }
    }

    pub fn can_transition_to(&self, next: FlowPhase) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Whether value may be held in escrow in this phase.
    pub fn holds_escrow(&self) -> bool {
        matches!(
            self,
            FlowPhase::EscrowOffered | FlowPhase::Settling | FlowPhase::Reverting
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowPhase::Done)
    }
}

impl fmt::Display for FlowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowPhase::Start => "START",
            FlowPhase::DraftSent => "DRAFT_SENT",
            FlowPhase::EscrowOffered => "ESCROW_OFFERED",
            FlowPhase::Settling => "SETTLING",
            FlowPhase::Reverting => "REVERTING",
            FlowPhase::Done => "DONE",
        };
        write!(f, "{}", name)
    }
}

/// How a swap ended, from one node's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwapOutcome {
    /// Both legs moved. The buyer leg is `settlement_tx_id`.
    Settled {
        settlement_tx_id: SecureHash,
        release_tx_id: Option<SecureHash>,
    },
    /// Escrow went back to the seller after the deadline.
    Reverted {
        revert_tx_id: SecureHash,
        reason: String,
    },
    /// Stopped before any value moved.
    Aborted { reason: String },
}

impl SwapOutcome {
    pub fn is_settled(&self) -> bool {
        matches!(self, SwapOutcome::Settled { .. })
    }

    pub fn settlement_tx_id(&self) -> Option<SecureHash> {
        match self {
            SwapOutcome::Settled {
                settlement_tx_id, ..
            } => Some(*settlement_tx_id),
            _ => None,
        }
    }

    /// Failure reason, if the swap did not settle.
    pub fn reason(&self) -> Option<&str> {
        match self {
            SwapOutcome::Settled { .. } => None,
            SwapOutcome::Reverted { reason, .. } | SwapOutcome::Aborted { reason } => Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        assert!(FlowPhase::Start.can_transition_to(FlowPhase::DraftSent));
        assert!(FlowPhase::EscrowOffered.can_transition_to(FlowPhase::Reverting));
        assert!(FlowPhase::Settling.can_transition_to(FlowPhase::Reverting));
        assert!(!FlowPhase::Reverting.can_transition_to(FlowPhase::Settling));
        assert!(!FlowPhase::EscrowOffered.can_transition_to(FlowPhase::Done));
        assert!(FlowPhase::Done.valid_transitions().is_empty());
    }

    #[test]
    fn test_outcome_accessors() {
        let id = SecureHash::of(b"settlement");
        let settled = SwapOutcome::Settled {
            settlement_tx_id: id,
            release_tx_id: None,
        };
        assert!(settled.is_settled());
        assert_eq!(settled.settlement_tx_id(), Some(id));
        assert_eq!(settled.reason(), None);

        let aborted = SwapOutcome::Aborted {
            reason: "draft rejected".to_string(),
        };
        assert_eq!(aborted.reason(), Some("draft rejected"));
    }
}
