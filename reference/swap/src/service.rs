//! Request lifecycle API of one party.

use std::sync::Arc;
use std::time::Duration;

use crossnotary_common::{
    AssetRequest, DurationExt, ExchangeRequest, Party, PartyId, RequestId, RequestStatus, Result,
    SwapError,
};
use crossnotary_ledger::SignedTransaction;
use crossnotary_protocol::SwapMessage;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::escrow::EscrowManager;
use crate::lock_manager::EscrowedLock;
use crate::network::SwapNetwork;
use crate::node::SwapNode;
use crate::orchestrator::{BuyerFlow, ExecuteOptions, SellerFlow};
use crate::relay::{extract_settlement_proof, SettlementRelay};
use crate::session::{unexpected, Session};
use crate::state::{Role, SwapOutcome};

async fn expect_ack(session: &mut Session) -> Result<()> {
    match session.receive().await? {
        SwapMessage::Acknowledged => Ok(()),
        other => Err(unexpected("ACKNOWLEDGED", &other)),
    }
}

/// Entry point for a party: propose, approve and execute swaps.
#[derive(Clone)]
pub struct SwapService {
    node: Arc<SwapNode>,
    network: Arc<SwapNetwork>,
}

impl SwapService {
    pub fn new(node: Arc<SwapNode>, network: Arc<SwapNetwork>) -> Self {
        Self { node, network }
    }

    pub fn node(&self) -> &Arc<SwapNode> {
        &self.node
    }

    pub fn party(&self) -> &Party {
        self.node.party()
    }

    /// Propose to swap `buyer_asset` (ours) for `seller_asset` (theirs).
    ///
    /// The request is stored on both nodes in REQUESTED before this returns.
    #[instrument(skip(self), fields(party = %self.node.party().name))]
    pub async fn create_request(
        &self,
        seller: &PartyId,
        buyer_asset: AssetRequest,
        seller_asset: AssetRequest,
    ) -> Result<RequestId> {
        let seller = self.network.party(seller)?;
        let request = ExchangeRequest::new(
            self.node.party().clone(),
            seller.clone(),
            buyer_asset,
            seller_asset,
        )?;
        let request_id = request.id;
        self.node.store().insert(request.clone()).await?;

        let mut session = self.network.connect(&self.node, &seller, request_id)?;
        session
            .send(SwapMessage::ExchangeProposal { request })
            .await?;
        expect_ack(&mut session).await?;

        self.node.metrics().request_created();
        info!(request_id = %request_id, seller = %seller, "Exchange request created");
        Ok(request_id)
    }

    /// Seller's decision on a REQUESTED request. The buyer is told before
    /// this returns.
    #[instrument(skip(self, reason), fields(party = %self.node.party().name))]
    pub async fn approve(
        &self,
        request_id: RequestId,
        approved: bool,
        reason: Option<String>,
    ) -> Result<ExchangeRequest> {
        let request = self.node.request(&request_id).await?;
        self.node.require_role(&request, Role::Seller)?;

        let recorded_reason = reason.clone();
        let updated = self
            .node
            .update_request(
                &request_id,
                Box::new(move |request| {
                    if approved {
                        request.approve()
                    } else {
                        request.deny(recorded_reason)
                    }
                }),
            )
            .await?;
        self.node.metrics().request_decided(approved);

        let mut session = self
            .network
            .connect(&self.node, &request.buyer, request_id)?;
        session
            .send(SwapMessage::ExchangeDecision { approved, reason })
            .await?;
        expect_ack(&mut session).await?;

        info!(request_id = %request_id, approved, "Exchange request decided");
        Ok(updated)
    }

    /// Run the swap for an APPROVED request as its buyer.
    ///
    /// Executing again picks up from what is recorded: a settled swap
    /// reports its outcome, and a committed escrow is settled without
    /// negotiating a new draft.
    pub async fn execute(&self, request_id: RequestId) -> Result<SwapOutcome> {
        self.execute_with(request_id, ExecuteOptions::default())
            .await
    }

    #[instrument(skip(self, options), fields(party = %self.node.party().name))]
    pub async fn execute_with(
        &self,
        request_id: RequestId,
        options: ExecuteOptions,
    ) -> Result<SwapOutcome> {
        let request = self.node.request(&request_id).await?;
        self.node.require_role(&request, Role::Buyer)?;
        request.require_status(RequestStatus::Approved)?;
        if request.escrow_tx_id.is_some() {
            return self.resume(request).await;
        }

        let session = self
            .network
            .connect(&self.node, &request.seller, request_id)?;
        BuyerFlow::new(self.node.clone(), session, options)
            .run()
            .await
    }

    /// Buyer side: finish a swap whose escrow is committed.
    async fn resume(&self, request: ExchangeRequest) -> Result<SwapOutcome> {
        let lock = self.recorded_lock(&request).await?;
        let relay = SettlementRelay::new(self.node.clone());
        let settlement_tx_id = lock.lock().draft_transfer_ref;

        if let Some(release) = relay.committed_release(&lock).await? {
            let released = relay.record_release(lock, &release).await?;
            info!(request_id = %request.id, "Swap already settled");
            return Ok(SwapOutcome::Settled {
                settlement_tx_id,
                release_tx_id: Some(released.release_tx_id),
            });
        }
        if !request.is_settled() && lock.lock().is_expired_at(self.node.now()) {
            return Err(SwapError::DeadlineViolation(format!(
                "escrow {} expired before the buyer leg committed",
                lock.lock_id().short()
            )));
        }

        info!(request_id = %request.id, lock = %lock.lock_id().short(), "Resuming settlement");
        let settlement = relay.finalize_buyer_leg(request.id).await?;
        let proof = extract_settlement_proof(lock.lock(), &settlement)?;
        let release = relay.release_escrow(&lock, proof, settlement.id())?;
        let committed = relay.commit_release(&lock, release).await?;
        let released = relay.record_release(lock, &committed).await?;
        if let Err(err) = self.notify_release(&request, committed).await {
            warn!(request_id = %request.id, error = %err, "Seller not told of the release");
        }

        let outcome = SwapOutcome::Settled {
            settlement_tx_id,
            release_tx_id: Some(released.release_tx_id),
        };
        self.node.record_outcome(request.id, outcome.clone());
        Ok(outcome)
    }

    async fn notify_release(&self, request: &ExchangeRequest, release: SignedTransaction) -> Result<()> {
        let mut session = self
            .network
            .connect(&self.node, &request.seller, request.id)?;
        session
            .send(SwapMessage::ReleaseCommitted { tx: release })
            .await?;
        expect_ack(&mut session).await
    }

    async fn recorded_lock(&self, request: &ExchangeRequest) -> Result<EscrowedLock> {
        EscrowManager::new(self.node.clone())
            .recorded_escrow(request)
            .await?
            .ok_or_else(|| SwapError::NotFound(format!("request {} has no escrow", request.id)))
    }

    /// Seller side: re-drive the revert of every lock left open past its
    /// deadline by a flow that ended.
    #[instrument(skip(self), fields(party = %self.node.party().name))]
    pub async fn recover_overdue_locks(&self) -> Vec<(RequestId, Result<SwapOutcome>)> {
        let grace = self.node.config().sweep_after();
        let mut recovered = Vec::new();
        for record in self.node.locks().overdue(self.node.now(), grace) {
            let request = match self.node.request(&record.request_id).await {
                Ok(request) => request,
                Err(err) => {
                    warn!(request_id = %record.request_id, error = %err, "Overdue lock has no request");
                    continue;
                }
            };
            if self.node.role_in(&request).ok() != Some(Role::Seller) {
                continue;
            }

            let result = self.recover_lock(&request).await;
            match &result {
                Ok(outcome) => {
                    info!(request_id = %request.id, outcome = ?outcome, "Overdue lock recovered")
                }
                Err(err) if err.is_retryable() => {
                    warn!(request_id = %request.id, error = %err, "Overdue lock recovery will be retried")
                }
                Err(err) => {
                    error!(request_id = %request.id, error = %err, "Overdue lock recovery failed")
                }
            }
            recovered.push((request.id, result));
        }
        recovered
    }

    async fn recover_lock(&self, request: &ExchangeRequest) -> Result<SwapOutcome> {
        let lock = self.recorded_lock(request).await?;
        let session = self
            .network
            .connect(&self.node, &request.buyer, request.id)?;
        SellerFlow::new(self.node.clone(), session)
            .recover(lock)
            .await
    }

    /// Sweep for overdue locks every `revert_sweep_interval`, sooner after a
    /// failure worth retrying. Runs until the task is aborted.
    pub async fn run_revert_sweeper(self) {
        let interval = self.node.config().revert_sweep_interval.as_std();
        let mut wait = interval;
        loop {
            tokio::time::sleep(wait).await;
            wait = self
                .recover_overdue_locks()
                .await
                .iter()
                .filter_map(|(_, result)| result.as_ref().err())
                .filter_map(|err| err.retry_after_ms())
                .map(Duration::from_millis)
                .fold(interval, Duration::min);
        }
    }

    pub fn spawn_revert_sweeper(&self) -> JoinHandle<()> {
        tokio::spawn(self.clone().run_revert_sweeper())
    }

    pub async fn get_request(&self, request_id: &RequestId) -> Result<ExchangeRequest> {
        self.node.request(request_id).await
    }

    pub async fn list_requests(&self) -> Result<Vec<ExchangeRequest>> {
        self.node.store().list().await
    }

    /// How this party's last flow for `request_id` ended.
    pub fn outcome(&self, request_id: &RequestId) -> Option<SwapOutcome> {
        self.node.outcome(request_id)
    }
}
