//! Settlement relay: commit the buyer's leg and carry its notary signature
//! to the seller's domain to release the escrow.

use std::sync::Arc;

use crossnotary_common::{RequestId, RequestStatus, Result, SwapError};
use crossnotary_crypto::{SecureHash, SignerPolicy};
use crossnotary_ledger::{
    AssetLedger, SignedTransaction, TokenCommand, TransactionBuilder, TransactionSignature,
};
use tracing::{error, info, instrument};

use crate::lock::{LockCommand, LockState};
use crate::lock_manager::{EscrowedLock, LockedStates, ReleasedLock};
use crate::negotiator::stored_draft;
use crate::node::SwapNode;
use crate::state::Role;

/// The controlling notary's signature on `settlement`, checked against what
/// `lock` expects.
pub fn extract_settlement_proof(
    lock: &LockState,
    settlement: &SignedTransaction,
) -> Result<TransactionSignature> {
    let settlement_id = settlement.id();
    if settlement_id != lock.draft_transfer_ref {
        return Err(SwapError::ConsistencyFault(format!(
            "settlement {} is not the agreed draft {}",
            settlement_id.short(),
            lock.draft_transfer_ref.short()
        )));
    }
    let proof = settlement
        .signature_by(&lock.controlling_notary)
        .cloned()
        .ok_or_else(|| {
            SwapError::AuthorizationFailure(format!(
                "settlement {} carries no signature of the controlling notary",
                settlement_id.short()
            ))
        })?;
    proof.verify(&settlement_id)?;
    if proof.metadata != lock.proof_metadata {
        return Err(SwapError::ValidationFailure(format!(
            "proof metadata {} differs from expected {}",
            proof.metadata, lock.proof_metadata
        )));
    }
    Ok(proof)
}

/// The Release command a release transaction carries, if any.
fn release_command(stx: &SignedTransaction) -> Result<Option<(TransactionSignature, SecureHash)>> {
    Ok(stx
        .tx
        .commands_of::<LockCommand>()?
        .into_iter()
        .find_map(|(command, _)| match command {
            LockCommand::Release {
                proof,
                settlement_tx_id,
            } => Some((proof, settlement_tx_id)),
            _ => None,
        }))
}

/// Commits the buyer leg and moves escrowed tokens on to the buyer.
pub struct SettlementRelay {
    node: Arc<SwapNode>,
}

impl SettlementRelay {
    pub fn new(node: Arc<SwapNode>) -> Self {
        Self { node }
    }

    /// Sign and commit the stored draft on the buyer's domain.
    ///
    /// Returns the committed settlement. Once committed, later calls return
    /// the recorded transaction.
    #[instrument(skip(self), fields(request_id = %request_id))]
    pub async fn finalize_buyer_leg(&self, request_id: RequestId) -> Result<SignedTransaction> {
        let request = self.node.request(&request_id).await?;
        self.node.require_role(&request, Role::Buyer)?;
        let ledger = self.node.ledger_for(request.buyer_asset.kind())?;

        if let Some(settlement_tx_id) = request.settlement_tx_id {
            return Ok(ledger.transaction(&settlement_tx_id).await?);
        }
        request.require_status(RequestStatus::Approved)?;

        let draft = stored_draft(&request)?;
        let mut stx = self.node.sign_transaction(SignedTransaction::new(draft));
        let notary_sig = ledger.commit(&stx).await?;
        stx.add_signature(notary_sig);

        let settlement_tx_id = stx.id();
        self.node
            .update_request(
                &request_id,
                Box::new(move |request| request.record_settlement(settlement_tx_id)),
            )
            .await?;

        info!(tx_id = %settlement_tx_id.short(), "Buyer leg committed");
        Ok(stx)
    }

    /// Buyer side: build and sign the release of `lock` backed by `proof`.
    pub fn release_escrow(
        &self,
        lock: &EscrowedLock,
        proof: TransactionSignature,
        settlement_tx_id: SecureHash,
    ) -> Result<SignedTransaction> {
        let receiver = lock.lock().receiver.key;
        let to_receiver = SignerPolicy::single(receiver);

        let mut builder = TransactionBuilder::new(lock.notary().clone());
        builder.add_input(lock.lock_ref());
        for state in lock.escrowed() {
            builder.add_input(state);
        }
        for token in lock.escrowed_tokens()? {
            builder.add_output_state(&token.with_holder(to_receiver.clone()), None)?;
        }
        builder.add_command(
            &LockCommand::Release {
                proof,
                settlement_tx_id,
            },
            [receiver],
        )?;
        builder.add_command(&TokenCommand::Move, [receiver])?;

        Ok(self
            .node
            .sign_transaction(SignedTransaction::new(builder.to_wire_transaction())))
    }

    /// Seller side: check a proposed release and co-sign it.
    ///
    /// The seller signature is not required to commit; it records that the
    /// seller saw a valid proof.
    pub fn check_release_proposal(
        &self,
        lock: &EscrowedLock,
        release: &SignedTransaction,
        settlement: &SignedTransaction,
    ) -> Result<TransactionSignature> {
        let proof = extract_settlement_proof(lock.lock(), settlement)?;
        match release_command(release)? {
            Some((carried, settlement_tx_id))
                if carried == proof && settlement_tx_id == settlement.id() => {}
            _ => {
                return Err(SwapError::ValidationFailure(
                    "release does not carry the settlement proof".to_string(),
                ))
            }
        }
        lock.check_spends_escrow(release)?;
        Ok(self.node.sign(release))
    }

    /// Buyer side: commit the release on the seller's domain.
    #[instrument(skip(self, lock, release), fields(lock = %lock.lock_id().short()))]
    pub async fn commit_release(
        &self,
        lock: &EscrowedLock,
        mut release: SignedTransaction,
    ) -> Result<SignedTransaction> {
        let ledger = self.node.ledger_at(lock.notary())?;
        let notary_sig = ledger.commit(&release).await.map_err(|err| {
            error!(error = %err, "Release refused by the escrow notary");
            SwapError::from(err)
        })?;
        release.add_signature(notary_sig);
        info!(tx_id = %release.id().short(), "Escrow released");
        Ok(release)
    }

    /// Fail unless `release` is a notarised release of `lock`.
    pub fn verify_release(&self, lock: &EscrowedLock, release: &SignedTransaction) -> Result<()> {
        self.node.check_notarised(release, lock.notary())?;
        lock.check_spends_escrow(release)?;
        if release_command(release)?.is_none() {
            return Err(SwapError::ValidationFailure(format!(
                "{} is not a release",
                release.id().short()
            )));
        }
        Ok(())
    }

    /// Close `lock` after a release committed, on either side.
    pub async fn record_release(
        &self,
        lock: EscrowedLock,
        release: &SignedTransaction,
    ) -> Result<ReleasedLock> {
        self.verify_release(&lock, release)?;

        let settlement_tx_id = lock.lock().draft_transfer_ref;
        let released = lock.released(release)?;
        self.node.locks().track_released(&released, self.node.now());
        self.node
            .update_request(
                &released.request_id,
                Box::new(move |request| request.record_settlement(settlement_tx_id)),
            )
            .await?;
        Ok(released)
    }

    /// Transaction that consumed the lock output of `lock`, if any.
    pub async fn consumer_of(&self, lock: &LockedStates) -> Result<Option<SignedTransaction>> {
        let ledger = self.node.ledger_at(lock.notary())?;
        let Some(consumed_by) = ledger.notary().vault().consumed_by(&lock.lock_ref().state_ref)
        else {
            return Ok(None);
        };
        Ok(Some(ledger.transaction(&consumed_by).await?))
    }

    /// Release that consumed `lock`, if one was committed.
    pub async fn committed_release(&self, lock: &EscrowedLock) -> Result<Option<SignedTransaction>> {
        match self.consumer_of(lock).await? {
            Some(stx) => Ok(release_command(&stx)?.map(|_| stx)),
            None => Ok(None),
        }
    }
}
