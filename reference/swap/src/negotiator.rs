//! Draft transfer negotiation.
//!
//! The buyer builds an unsigned transfer of its asset to the seller and
//! sends it with the transactions that produced its inputs. The seller
//! checks it before any value moves.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crossnotary_common::{
    ExchangeRequest, RequestId, RequestStatus, Result, SwapError, TimeWindow, Timestamp,
};
use crossnotary_crypto::{SecureHash, SignerPolicy};
use crossnotary_ledger::token::delivers;
use crossnotary_ledger::{
    AssetLedger, LedgerTransaction, SignedTransaction, StateEnvelope, StateRef, TokenState,
    TransactionBuilder, WireTransaction,
};
use crossnotary_protocol::DraftProposal;
use tracing::{info, instrument, warn};

use crate::node::SwapNode;
use crate::state::Role;

/// Upper bound of a draft's time window.
pub fn draft_deadline(draft: &WireTransaction) -> Result<Timestamp> {
    draft
        .time_window
        .and_then(|window| window.until)
        .ok_or_else(|| SwapError::ValidationFailure("draft has no validity deadline".to_string()))
}

/// The draft stored on `request`, checked against its recorded id.
pub fn stored_draft(request: &ExchangeRequest) -> Result<WireTransaction> {
    let (Some(draft_id), Some(bytes)) = (request.draft_transfer_id, &request.unsigned_transfer)
    else {
        return Err(SwapError::NotFound(format!(
            "request {} has no stored draft",
            request.id
        )));
    };
    let draft = WireTransaction::from_bytes(bytes)?;
    let recomputed = draft.id();
    if recomputed != draft_id {
        return Err(SwapError::ConsistencyFault(format!(
            "stored draft recomputes to {}, recorded {}",
            recomputed.short(),
            draft_id.short()
        )));
    }
    Ok(draft)
}

/// Builds drafts (buyer) and judges them (seller).
pub struct DraftNegotiator {
    node: Arc<SwapNode>,
}

impl DraftNegotiator {
    pub fn new(node: Arc<SwapNode>) -> Self {
        Self { node }
    }

    /// Build, persist and package the buyer's draft transfer.
    ///
    /// A draft already stored for the request is re-sent unchanged.
    #[instrument(skip(self), fields(request_id = %request_id))]
    pub async fn propose_draft_transfer(&self, request_id: RequestId) -> Result<DraftProposal> {
        let request = self.node.request(&request_id).await?;
        self.node.require_role(&request, Role::Buyer)?;
        request.require_status(RequestStatus::Approved)?;

        let ledger = self.node.ledger_for(request.buyer_asset.kind())?;
        let transfer = if request.unsigned_transfer.is_some() {
            stored_draft(&request)?
        } else {
            let fragment = ledger
                .construct_transfer(
                    &request.buyer_asset,
                    &self.node.public_key(),
                    &SignerPolicy::single(request.seller.key),
                )
                .await?;

            let mut builder = TransactionBuilder::new(fragment.notary.clone());
            fragment.apply(&mut builder, None)?;
            builder.set_time_window(TimeWindow::until_only(
                self.node.now() + self.node.config().draft_window,
            ));
            let transfer = builder.to_wire_transaction();

            let draft_id = transfer.id();
            let bytes = transfer.to_bytes()?;
            self.node
                .update_request(
                    &request_id,
                    Box::new(move |request| request.record_draft(draft_id, bytes)),
                )
                .await?;
            transfer
        };

        let producing: BTreeSet<SecureHash> =
            transfer.inputs.iter().map(|input| input.tx_id).collect();
        let mut dependencies = Vec::with_capacity(producing.len());
        for tx_id in &producing {
            dependencies.push(ledger.transaction(tx_id).await?);
        }

        info!(
            draft_id = %transfer.id().short(),
            inputs = transfer.inputs.len(),
            dependencies = dependencies.len(),
            "Draft transfer proposed"
        );

        Ok(DraftProposal {
            request_id,
            claimed_id: transfer.id(),
            transfer,
            dependencies,
        })
    }

    /// Check a received draft against `request`. Returns the recomputed id.
    #[instrument(skip(self, proposal, request), fields(request_id = %request.id))]
    pub fn validate_draft_transfer(
        &self,
        proposal: &DraftProposal,
        request: &ExchangeRequest,
    ) -> Result<SecureHash> {
        self.node.require_role(request, Role::Seller)?;
        request.require_status(RequestStatus::Approved)?;
        if proposal.request_id != request.id {
            return Err(SwapError::ConsistencyFault(format!(
                "draft names request {}, session is for {}",
                proposal.request_id, request.id
            )));
        }

        let transfer = &proposal.transfer;
        let ledgers = self.node.ledgers();

        let draft_id = transfer.id();
        if draft_id != proposal.claimed_id {
            return Err(SwapError::ConsistencyFault(format!(
                "draft recomputes to {}, claimed {}",
                draft_id.short(),
                proposal.claimed_id.short()
            )));
        }

        let resolved = self.resolve_dependencies(proposal)?;

        let buyer_notary = ledgers.notary_for_kind(request.buyer_asset.kind())?;
        match &transfer.notary {
            Some(notary) if notary == buyer_notary.id() => {}
            Some(other) => {
                return Err(SwapError::ValidationFailure(format!(
                    "draft names notary {}, {} is governed by {}",
                    other,
                    request.buyer_asset.kind(),
                    buyer_notary.id()
                )))
            }
            None => {
                return Err(SwapError::ValidationFailure(
                    "draft names no notary".to_string(),
                ))
            }
        }
        let until = draft_deadline(transfer)?;
        let now = self.node.now();
        if until <= now {
            return Err(SwapError::DeadlineViolation(format!(
                "draft expired at {}",
                until.to_rfc3339()
            )));
        }
        let config = self.node.config();
        let latest = now + config.draft_window + config.max_clock_skew;
        if until > latest {
            return Err(SwapError::DeadlineViolation(format!(
                "draft valid until {}, the agreed window ends by {}",
                until.to_rfc3339(),
                latest.to_rfc3339()
            )));
        }

        let ltx = LedgerTransaction::resolve(transfer, |state_ref| resolved.get(state_ref).cloned())?;
        ledgers.contracts().verify(&ltx)?;

        let signers = transfer.required_signers();
        if signers.iter().any(|key| *key != request.buyer.key) {
            return Err(SwapError::ValidationFailure(
                "draft requires signatures other than the buyer's".to_string(),
            ));
        }

        let to_seller = SignerPolicy::single(request.seller.key);
        let paid: Vec<TokenState> = transfer
            .outputs
            .iter()
            .filter(|output| output.encumbrance.is_none())
            .filter_map(|output| output.decode::<TokenState>().ok())
            .filter(|token| token.holder == to_seller)
            .collect();
        if !delivers(&request.buyer_asset, &paid) {
            return Err(SwapError::ValidationFailure(format!(
                "draft does not pay {} to {}",
                request.buyer_asset, request.seller
            )));
        }

        info!(draft_id = %draft_id.short(), "Draft transfer validated");
        Ok(draft_id)
    }

    /// Seller side: validate and bind the draft to the request.
    pub async fn accept_draft(&self, proposal: &DraftProposal) -> Result<SecureHash> {
        let request = self.node.request(&proposal.request_id).await?;
        let draft_id = match self.validate_draft_transfer(proposal, &request) {
            Ok(draft_id) => draft_id,
            Err(err) => {
                warn!(request_id = %request.id, error = %err, "Draft transfer rejected");
                return Err(err);
            }
        };
        self.node
            .update_request(
                &request.id,
                Box::new(move |request| request.record_draft_id(draft_id)),
            )
            .await?;
        Ok(draft_id)
    }

    /// States the draft consumes, taken from its dependencies. Each
    /// dependency must recompute, carry valid signatures and be notarised
    /// by its own notary.
    fn resolve_dependencies(
        &self,
        proposal: &DraftProposal,
    ) -> Result<HashMap<StateRef, StateEnvelope>> {
        let mut by_id: HashMap<SecureHash, &SignedTransaction> = HashMap::new();
        for dependency in &proposal.dependencies {
            dependency.verify_attached()?;
            let notary = dependency.tx.notary.as_ref().ok_or_else(|| {
                SwapError::ValidationFailure(format!(
                    "dependency {} names no notary",
                    dependency.id().short()
                ))
            })?;
            let notary_key = self.node.ledgers().notary_key(notary)?;
            if dependency.signature_by(&notary_key).is_none() {
                return Err(SwapError::AuthorizationFailure(format!(
                    "dependency {} is not signed by {}",
                    dependency.id().short(),
                    notary
                )));
            }
            by_id.insert(dependency.id(), dependency);
        }

        let mut resolved = HashMap::with_capacity(proposal.transfer.inputs.len());
        for input in &proposal.transfer.inputs {
            let producing = by_id.get(&input.tx_id).ok_or_else(|| {
                SwapError::ValidationFailure(format!("no dependency produces input {}", input))
            })?;
            let state = producing
                .tx
                .outputs
                .get(input.index as usize)
                .ok_or_else(|| {
                    SwapError::ConsistencyFault(format!(
                        "dependency {} has no output {}",
                        input.tx_id.short(),
                        input.index
                    ))
                })?;
            resolved.insert(*input, state.clone());
        }
        Ok(resolved)
    }
}
