//! Timeout path: after the deadline the seller registers a revert intent,
//! then reverts the escrow to itself with the buyer's authorization.

use std::sync::Arc;

use crossnotary_common::{RequestId, Result, SwapError, TimeWindow};
use crossnotary_crypto::SignerPolicy;
use crossnotary_ledger::{
    AssetLedger, SignedTransaction, TokenCommand, TransactionBuilder, TransactionSignature,
    WireTransaction,
};
use tracing::{info, instrument, warn};

use crate::lock::{LockCommand, LockPhase};
use crate::lock_manager::{EscrowedLock, IntentRegisteredLock, LockedStates, RevertedLock};
use crate::node::SwapNode;
use crate::state::Role;

/// Whether two transactions agree on everything but their salt.
fn same_content(a: &WireTransaction, b: &WireTransaction) -> bool {
    a.inputs == b.inputs
        && a.outputs == b.outputs
        && a.commands == b.commands
        && a.notary == b.notary
        && a.time_window == b.time_window
}

fn spend_escrow(lock: &LockedStates) -> TransactionBuilder {
    let mut builder = TransactionBuilder::new(lock.notary().clone());
    builder.add_input(lock.lock_ref());
    for state in lock.escrowed() {
        builder.add_input(state);
    }
    builder
}

/// Re-issue the lock in phase RevertIntentRegistered, tokens unchanged.
fn intent_template(lock: &EscrowedLock) -> Result<WireTransaction> {
    let mut builder = spend_escrow(lock);
    let index = builder.add_output_state(
        &lock.lock().with_phase(LockPhase::RevertIntentRegistered),
        None,
    )?;
    for token in lock.escrowed_tokens()? {
        builder.add_output_state(&token, Some(index))?;
    }
    let parties = [lock.lock().creator.key, lock.lock().receiver.key];
    builder.add_command(&LockCommand::RegisterRevertIntent, parties)?;
    builder.add_command(&TokenCommand::Move, parties)?;
    builder.set_time_window(TimeWindow::from_only(lock.lock().revert_opens_at()));
    Ok(builder.to_wire_transaction())
}

/// Every escrowed token back to the creator, unencumbered.
fn revert_template(lock: &IntentRegisteredLock) -> Result<WireTransaction> {
    let mut builder = spend_escrow(lock);
    let to_creator = SignerPolicy::single(lock.lock().creator.key);
    for token in lock.escrowed_tokens()? {
        builder.add_output_state(&token.with_holder(to_creator.clone()), None)?;
    }
    let receiver = lock.lock().receiver.key;
    builder.add_command(&LockCommand::Revert, [receiver])?;
    builder.add_command(&TokenCommand::Move, [receiver])?;
    Ok(builder.to_wire_transaction())
}

/// Drives a lock from ESCROWED through INTENT_REGISTERED to REVERTED.
pub struct RevertManager {
    node: Arc<SwapNode>,
}

impl RevertManager {
    pub fn new(node: Arc<SwapNode>) -> Self {
        Self { node }
    }

    /// Seller side: signed revert intent for an expired lock.
    #[instrument(skip(self, lock), fields(lock = %lock.lock_id().short()))]
    pub fn register_revert_intent(&self, lock: &EscrowedLock) -> Result<SignedTransaction> {
        let now = self.node.now();
        if now < lock.lock().revert_opens_at() {
            return Err(SwapError::DeadlineViolation(format!(
                "lock deadline {} has not passed at {}",
                lock.deadline().to_rfc3339(),
                now.to_rfc3339()
            )));
        }
        let stx = SignedTransaction::new(intent_template(lock)?);
        Ok(self.node.sign_transaction(stx))
    }

    /// Buyer side: co-sign a revert intent, unless the buyer leg committed.
    #[instrument(skip(self, lock, stx), fields(request_id = %request_id))]
    pub async fn authorize_revert_intent(
        &self,
        request_id: RequestId,
        lock: &EscrowedLock,
        stx: &SignedTransaction,
    ) -> Result<TransactionSignature> {
        self.refuse_if_settled(request_id).await?;
        let now = self.node.now();
        if !lock.lock().is_expired_at(now) {
            return Err(SwapError::DeadlineViolation(format!(
                "revert intent before the deadline {}",
                lock.deadline().to_rfc3339()
            )));
        }
        if !same_content(&stx.tx, &intent_template(lock)?) {
            return Err(SwapError::ValidationFailure(
                "revert intent does not only re-issue the lock".to_string(),
            ));
        }
        Ok(self.node.sign(stx))
    }

    /// Seller side: commit a co-signed revert intent.
    pub async fn commit_intent(
        &self,
        lock: &EscrowedLock,
        stx: SignedTransaction,
        buyer_sig: TransactionSignature,
    ) -> Result<SignedTransaction> {
        self.commit_with(lock, stx, buyer_sig).await
    }

    /// Close the ESCROWED handle once the intent committed.
    pub fn record_intent(
        &self,
        lock: EscrowedLock,
        intent: &SignedTransaction,
    ) -> Result<IntentRegisteredLock> {
        self.node.check_notarised(intent, lock.notary())?;
        lock.check_spends_escrow(intent)?;
        let registered = lock.intent_registered(intent)?;
        self.node.locks().track_intent(&registered, self.node.now());
        info!(lock = %registered.lock_id().short(), "Revert intent registered");
        Ok(registered)
    }

    /// Buyer side: fetch the committed intent a revert request spends.
    pub async fn resolve_intent(
        &self,
        lock: EscrowedLock,
        revert: &SignedTransaction,
    ) -> Result<IntentRegisteredLock> {
        let intent_id = revert
            .tx
            .inputs
            .first()
            .map(|input| input.tx_id)
            .ok_or_else(|| SwapError::ValidationFailure("revert spends nothing".to_string()))?;
        let intent = self
            .node
            .ledger_at(lock.notary())?
            .transaction(&intent_id)
            .await?;
        self.record_intent(lock, &intent)
    }

    /// Seller side: unsigned revert of a lock whose intent is registered.
    pub fn build_revert(&self, lock: &IntentRegisteredLock) -> Result<SignedTransaction> {
        Ok(SignedTransaction::new(revert_template(lock)?))
    }

    /// Buyer side: authorize the revert, unless the buyer leg committed.
    #[instrument(skip(self, lock, stx), fields(request_id = %request_id))]
    pub async fn authorize_revert(
        &self,
        request_id: RequestId,
        lock: &IntentRegisteredLock,
        stx: &SignedTransaction,
    ) -> Result<TransactionSignature> {
        self.refuse_if_settled(request_id).await?;
        if !same_content(&stx.tx, &revert_template(lock)?) {
            return Err(SwapError::ValidationFailure(
                "revert does not return exactly the escrow to the seller".to_string(),
            ));
        }
        Ok(self.node.sign(stx))
    }

    /// Seller side: commit the authorized revert.
    pub async fn commit_revert(
        &self,
        lock: &IntentRegisteredLock,
        stx: SignedTransaction,
        buyer_sig: TransactionSignature,
    ) -> Result<SignedTransaction> {
        self.commit_with(lock, stx, buyer_sig).await
    }

    /// Close the handle once the revert committed, on either side.
    pub fn record_revert(
        &self,
        lock: IntentRegisteredLock,
        revert: &SignedTransaction,
    ) -> Result<RevertedLock> {
        self.node.check_notarised(revert, lock.notary())?;
        lock.check_spends_escrow(revert)?;
        let reverted = lock.reverted(revert)?;
        self.node.locks().track_reverted(&reverted, self.node.now());
        info!(lock = %reverted.lock_id.short(), tx_id = %reverted.revert_tx_id.short(), "Escrow reverted");
        Ok(reverted)
    }

    async fn refuse_if_settled(&self, request_id: RequestId) -> Result<()> {
        let request = self.node.request(&request_id).await?;
        self.node.require_role(&request, Role::Buyer)?;
        if let Some(settlement_tx_id) = request.settlement_tx_id {
            warn!(settlement = %settlement_tx_id.short(), "Refusing to authorize revert");
            return Err(SwapError::AuthorizationFailure(format!(
                "buyer leg {} already committed",
                settlement_tx_id.short()
            )));
        }
        Ok(())
    }

    async fn commit_with(
        &self,
        lock: &LockedStates,
        mut stx: SignedTransaction,
        buyer_sig: TransactionSignature,
    ) -> Result<SignedTransaction> {
        let receiver = lock.lock().receiver.key;
        if buyer_sig.by != receiver {
            return Err(SwapError::AuthorizationFailure(format!(
                "signature by {}, expected the receiver",
                buyer_sig.by.key_id()
            )));
        }
        buyer_sig.verify(&stx.id())?;
        stx.add_signature(buyer_sig);

        let notary_sig = self.node.ledger_at(lock.notary())?.commit(&stx).await?;
        stx.add_signature(notary_sig);
        Ok(stx)
    }
}
