//! Escrow of the seller's asset on the seller's domain.

use std::sync::Arc;

use crossnotary_common::{ExchangeRequest, Result, SwapError, TimeWindow, Timestamp};
use crossnotary_crypto::{SecureHash, SignerPolicy};
use crossnotary_ledger::token::delivers;
use crossnotary_ledger::{
    AssetLedger, SignedTransaction, TransactionBuilder, TransactionSignature, WireTransaction,
};
use tracing::{info, instrument, warn};

use crate::lock::{LockCommand, LockPhase, LockState};
use crate::lock_manager::EscrowedLock;
use crate::negotiator::{draft_deadline, stored_draft};
use crate::node::SwapNode;
use crate::state::Role;

/// Builds and commits escrows (seller) and checks them (buyer).
pub struct EscrowManager {
    node: Arc<SwapNode>,
}

impl EscrowManager {
    pub fn new(node: Arc<SwapNode>) -> Self {
        Self { node }
    }

    /// The lock the seller must create for `request` and draft `draft_id`.
    fn expected_lock(
        &self,
        request: &ExchangeRequest,
        draft_id: SecureHash,
        deadline: Timestamp,
    ) -> Result<LockState> {
        let buyer_notary = self
            .node
            .ledgers()
            .notary_for_kind(request.buyer_asset.kind())?;
        Ok(LockState {
            draft_transfer_ref: draft_id,
            creator: request.seller.clone(),
            receiver: request.buyer.clone(),
            controlling_notary: buyer_notary.public_key(),
            holder_policy: SignerPolicy::all_of([request.seller.key, request.buyer.key])?,
            deadline,
            proof_metadata: buyer_notary.metadata(),
            phase: LockPhase::Escrowed,
        })
    }

    /// Build the seller-signed escrow transaction for an accepted draft.
    ///
    /// The lock's deadline is the draft's deadline plus the grace period.
    #[instrument(skip(self, request, draft), fields(request_id = %request.id))]
    pub async fn offer_escrow(
        &self,
        request: &ExchangeRequest,
        draft_id: SecureHash,
        draft: &WireTransaction,
    ) -> Result<SignedTransaction> {
        self.node.require_role(request, Role::Seller)?;
        let until = draft_deadline(draft)?;
        let lock = self.expected_lock(
            request,
            draft_id,
            until + self.node.config().escrow_grace_period,
        )?;

        let ledger = self.node.ledger_for(request.seller_asset.kind())?;
        let fragment = ledger
            .construct_transfer(&request.seller_asset, &request.seller.key, &lock.holder_policy)
            .await?;

        let mut builder = TransactionBuilder::new(fragment.notary.clone());
        let lock_index = builder.add_output_state(&lock, None)?;
        fragment.apply(&mut builder, Some(lock_index))?;
        builder.add_command(&LockCommand::Encumber, [request.seller.key, request.buyer.key])?;
        builder.set_time_window(TimeWindow::until_only(until));

        let stx = self
            .node
            .sign_transaction(SignedTransaction::new(builder.to_wire_transaction()));
        info!(
            tx_id = %stx.id().short(),
            deadline = %lock.deadline.to_rfc3339(),
            "Escrow offered"
        );
        Ok(stx)
    }

    /// Buyer side: check a proposed escrow before co-signing it.
    #[instrument(skip(self, request, stx), fields(request_id = %request.id, tx_id = %stx.id().short()))]
    pub fn check_escrow_proposal(
        &self,
        request: &ExchangeRequest,
        stx: &SignedTransaction,
    ) -> Result<EscrowedLock> {
        self.node.require_role(request, Role::Buyer)?;
        let draft_id = request.draft_transfer_id.ok_or_else(|| {
            SwapError::ValidationFailure(format!("request {} has no draft", request.id))
        })?;
        let draft_until = draft_deadline(&stored_draft(request)?)?;

        stx.verify_attached()?;
        if stx.signature_by(&request.seller.key).is_none() {
            return Err(SwapError::AuthorizationFailure(
                "escrow is not signed by the seller".to_string(),
            ));
        }

        let seller_notary = self
            .node
            .ledgers()
            .notary_for_kind(request.seller_asset.kind())?;
        if stx.tx.notary.as_ref() != Some(seller_notary.id()) {
            return Err(SwapError::ValidationFailure(format!(
                "escrow must be notarised by {}",
                seller_notary.id()
            )));
        }

        let lock = EscrowedLock::from_escrow(request.id, stx)?;
        if lock.deadline() <= draft_until {
            return Err(SwapError::ValidationFailure(format!(
                "escrow deadline {} does not outlast the draft deadline {}",
                lock.deadline().to_rfc3339(),
                draft_until.to_rfc3339()
            )));
        }
        let expected = self.expected_lock(request, draft_id, lock.deadline())?;
        if *lock.lock() != expected {
            return Err(SwapError::ValidationFailure(
                "escrow lock does not match the agreed terms".to_string(),
            ));
        }

        let tokens = lock.escrowed_tokens()?;
        if tokens.iter().any(|token| token.holder != expected.holder_policy)
            || !delivers(&request.seller_asset, &tokens)
        {
            return Err(SwapError::ValidationFailure(format!(
                "escrow does not hold exactly {}",
                request.seller_asset
            )));
        }

        // The buyer's key may only back the Encumber command.
        for command in &stx.tx.commands {
            if command.is::<LockCommand>() {
                if command.decode::<LockCommand>()? != LockCommand::Encumber {
                    return Err(SwapError::ValidationFailure(
                        "escrow carries a lock command other than ENCUMBER".to_string(),
                    ));
                }
            } else if command.signers.contains(&request.buyer.key) {
                return Err(SwapError::ValidationFailure(format!(
                    "escrow asks the buyer to sign a {} command",
                    command.contract
                )));
            }
        }

        Ok(lock)
    }

    /// Buyer's co-signature on a checked escrow.
    pub fn sign_escrow(&self, stx: &SignedTransaction) -> TransactionSignature {
        self.node.sign(stx)
    }

    /// Seller side: attach the buyer's signature and commit on the seller's
    /// domain. Nothing is escrowed unless the commit succeeds.
    #[instrument(skip(self, request, stx, buyer_sig), fields(request_id = %request.id, tx_id = %stx.id().short()))]
    pub async fn commit_escrow(
        &self,
        request: &ExchangeRequest,
        mut stx: SignedTransaction,
        buyer_sig: TransactionSignature,
    ) -> Result<(SignedTransaction, EscrowedLock)> {
        if buyer_sig.by != request.buyer.key {
            return Err(SwapError::AuthorizationFailure(format!(
                "escrow co-signed by {}, expected the buyer",
                buyer_sig.by.key_id()
            )));
        }
        buyer_sig.verify(&stx.id())?;
        stx.add_signature(buyer_sig);

        let ledger = self.node.ledger_for(request.seller_asset.kind())?;
        let notary_sig = ledger.commit(&stx).await.map_err(|err| {
            warn!(error = %err, "Escrow commit refused");
            SwapError::EscrowCommitFailed(err.to_string())
        })?;
        stx.add_signature(notary_sig);

        let lock = EscrowedLock::from_escrow(request.id, &stx)?;
        self.node.locks().track_escrowed(&lock, self.node.now());
        self.record_escrow(&lock).await?;
        info!(lock = %lock.lock_id().short(), "Escrow committed");
        Ok((stx, lock))
    }

    /// Buyer side: check the committed escrow is the one co-signed and that
    /// the seller's notary signed it.
    pub async fn verify_committed_escrow(
        &self,
        proposed: EscrowedLock,
        committed: &SignedTransaction,
    ) -> Result<EscrowedLock> {
        if committed.id() != proposed.lock_id() {
            return Err(SwapError::ConsistencyFault(format!(
                "committed escrow {} is not the co-signed {}",
                committed.id().short(),
                proposed.lock_id().short()
            )));
        }
        self.node.check_notarised(committed, proposed.notary())?;

        self.node.locks().track_escrowed(&proposed, self.node.now());
        self.record_escrow(&proposed).await?;
        Ok(proposed)
    }

    async fn record_escrow(&self, lock: &EscrowedLock) -> Result<()> {
        let escrow_tx_id = lock.lock_id();
        self.node
            .update_request(
                &lock.request_id(),
                Box::new(move |request| request.record_escrow(escrow_tx_id)),
            )
            .await?;
        Ok(())
    }

    /// Handle on the escrow recorded for `request`, rebuilt from the
    /// seller's domain. `None` if no escrow was committed.
    pub async fn recorded_escrow(&self, request: &ExchangeRequest) -> Result<Option<EscrowedLock>> {
        let Some(escrow_tx_id) = request.escrow_tx_id else {
            return Ok(None);
        };
        let ledger = self.node.ledger_for(request.seller_asset.kind())?;
        let stx = ledger.transaction(&escrow_tx_id).await?;
        let lock = EscrowedLock::from_escrow(request.id, &stx)?;
        if Some(lock.lock().draft_transfer_ref) != request.draft_transfer_id {
            return Err(SwapError::ConsistencyFault(format!(
                "escrow {} locks for another draft than request {}",
                escrow_tx_id.short(),
                request.id
            )));
        }
        Ok(Some(lock))
    }
}

