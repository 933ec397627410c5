//! Buyer and seller flows for one request.
//!
//! Each flow is a state machine over a single session. Every wait is an
//! explicit receive: draft verdict, escrow signature, escrow commit,
//! decision, release signature, release commit, revert signatures and
//! revert commit. Once an escrow is committed a flow only ends by settling
//! or reverting; errors past that point move the seller onto the revert
//! path.

use std::sync::Arc;
use std::time::Duration;

use crossnotary_common::{ExchangeRequest, RequestId, RequestStatus, Result, SwapError};
use crossnotary_crypto::SecureHash;
use crossnotary_ledger::{SignedTransaction, WireTransaction};
use crossnotary_protocol::{DraftProposal, SellerDecision, SwapMessage};
use tracing::{debug, error, info, instrument, warn};

use crate::escrow::EscrowManager;
use crate::lock_manager::{EscrowedLock, IntentRegisteredLock};
use crate::negotiator::DraftNegotiator;
use crate::node::SwapNode;
use crate::relay::{extract_settlement_proof, SettlementRelay};
use crate::revert::RevertManager;
use crate::session::{unexpected, Session};
use crate::state::{FlowPhase, Role, SwapOutcome};

/// Options for one buyer execution.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Pause after the seller's go-ahead before committing the buyer leg.
    pub settle_delay: Option<Duration>,
}

/// Serve a session a peer opened. The first message says what it is for.
pub async fn respond(node: Arc<SwapNode>, mut session: Session) {
    let request_id = session.request_id();
    let first = match session.receive().await {
        Ok(message) => message,
        Err(err) => {
            debug!(request_id = %request_id, error = %err, "Session ended before its first message");
            return;
        }
    };

    let result = match first {
        SwapMessage::ExchangeProposal { request } => {
            accept_proposal(&node, &session, request).await
        }
        SwapMessage::ExchangeDecision { approved, reason } => {
            record_decision(&node, &session, approved, reason).await
        }
        SwapMessage::DraftProposal(proposal) => match require_unescrowed(&node, &session).await {
            Ok(()) => {
                if let Err(err) = SellerFlow::new(node, session).run(proposal).await {
                    error!(request_id = %request_id, error = %err, "Seller flow interrupted");
                }
                return;
            }
            Err(err) => Err(err),
        },
        SwapMessage::ReleaseCommitted { tx } => accept_late_release(&node, &session, tx).await,
        first @ (SwapMessage::RevertIntentSignatureRequest { .. }
        | SwapMessage::RevertSignatureRequest { .. }) => {
            let flow = BuyerFlow::new(node, session, ExecuteOptions::default());
            if let Err(err) = flow.recover(first).await {
                error!(request_id = %request_id, error = %err, "Revert recovery interrupted");
            }
            return;
        }
        other => Err(unexpected(
            "EXCHANGE_PROPOSAL, EXCHANGE_DECISION, DRAFT_PROPOSAL or a recovery message",
            &other,
        )),
    };

    if let Err(err) = result {
        warn!(request_id = %request_id, error = %err, "Session refused");
        session.abort(&err).await;
    }
}

/// Seller side: store a request the buyer proposed.
async fn accept_proposal(
    node: &SwapNode,
    session: &Session,
    request: ExchangeRequest,
) -> Result<()> {
    if request.id != session.request_id() {
        return Err(SwapError::ConsistencyFault(format!(
            "proposal for {} arrived on the session for {}",
            request.id,
            session.request_id()
        )));
    }
    node.require_role(&request, Role::Seller)?;
    if request.buyer != *session.peer() {
        return Err(SwapError::AuthorizationFailure(format!(
            "proposal names buyer {} but came from {}",
            request.buyer,
            session.peer()
        )));
    }
    request.require_status(RequestStatus::Requested)?;

    node.store().insert(request).await?;
    session.send(SwapMessage::Acknowledged).await?;
    info!(request_id = %session.request_id(), buyer = %session.peer(), "Exchange request received");
    Ok(())
}

/// Buyer side: apply the seller's approval decision.
async fn record_decision(
    node: &SwapNode,
    session: &Session,
    approved: bool,
    reason: Option<String>,
) -> Result<()> {
    let request = node.request(&session.request_id()).await?;
    node.require_role(&request, Role::Buyer)?;
    if request.seller != *session.peer() {
        return Err(SwapError::AuthorizationFailure(format!(
            "decision on request {} came from {}, not the seller",
            request.id,
            session.peer()
        )));
    }

    node.update_request(
        &request.id,
        Box::new(move |request| {
            if approved {
                request.approve()
            } else {
                request.deny(reason)
            }
        }),
    )
    .await?;
    session.send(SwapMessage::Acknowledged).await?;
    info!(request_id = %request.id, approved, "Seller decision recorded");
    Ok(())
}

/// Seller side: a request negotiates one draft. Once its escrow is committed
/// another draft is refused and the record is left as it is.
async fn require_unescrowed(node: &SwapNode, session: &Session) -> Result<()> {
    let request = node.request(&session.request_id()).await?;
    match request.escrow_tx_id {
        Some(escrow_tx_id) => Err(SwapError::ValidationFailure(format!(
            "request {} is already bound to escrow {}",
            request.id,
            escrow_tx_id.short()
        ))),
        None => Ok(()),
    }
}

/// Seller side: the buyer resumed its swap and released the escrow after
/// the flow that created it ended.
async fn accept_late_release(
    node: &Arc<SwapNode>,
    session: &Session,
    release: SignedTransaction,
) -> Result<()> {
    let request = node.request(&session.request_id()).await?;
    node.require_role(&request, Role::Seller)?;
    if request.buyer != *session.peer() {
        return Err(SwapError::AuthorizationFailure(format!(
            "release for request {} came from {}, not the buyer",
            request.id,
            session.peer()
        )));
    }
    let lock = EscrowManager::new(node.clone())
        .recorded_escrow(&request)
        .await?
        .ok_or_else(|| SwapError::NotFound(format!("request {} has no escrow", request.id)))?;

    let settlement_tx_id = lock.lock().draft_transfer_ref;
    let released = SettlementRelay::new(node.clone())
        .record_release(lock, &release)
        .await?;
    node.record_outcome(
        request.id,
        SwapOutcome::Settled {
            settlement_tx_id,
            release_tx_id: Some(released.release_tx_id),
        },
    );
    session.send(SwapMessage::Acknowledged).await?;
    info!(request_id = %request.id, tx_id = %released.release_tx_id.short(), "Late release recorded");
    Ok(())
}

/// What both flows share: the node, the session and the components.
struct FlowContext {
    node: Arc<SwapNode>,
    session: Session,
    request_id: RequestId,
    role: Role,
    phase: FlowPhase,
    negotiator: DraftNegotiator,
    escrow: EscrowManager,
    relay: SettlementRelay,
    revert: RevertManager,
}

impl FlowContext {
    fn new(node: Arc<SwapNode>, session: Session, role: Role) -> Self {
        Self {
            request_id: session.request_id(),
            session,
            role,
            phase: FlowPhase::Start,
            negotiator: DraftNegotiator::new(node.clone()),
            escrow: EscrowManager::new(node.clone()),
            relay: SettlementRelay::new(node.clone()),
            revert: RevertManager::new(node.clone()),
            node,
        }
    }

    fn enter(&mut self, next: FlowPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(SwapError::ConsistencyFault(format!(
                "{} flow cannot move from {} to {}",
                self.role, self.phase, next
            )));
        }
        debug!(request_id = %self.request_id, role = %self.role, from = %self.phase, to = %next, "Flow phase changed");
        self.phase = next;
        Ok(())
    }

    /// Pick up a flow whose earlier run stopped in `phase`.
    fn resume_at(&mut self, phase: FlowPhase) {
        debug!(request_id = %self.request_id, role = %self.role, phase = %phase, "Flow resumed");
        self.phase = phase;
    }

    async fn send(&self, message: SwapMessage) -> Result<()> {
        self.session.send(message).await
    }

    /// Send that must not stop the flow.
    async fn notify(&self, message: SwapMessage) {
        let kind = message.kind();
        if let Err(err) = self.session.send(message).await {
            warn!(request_id = %self.request_id, kind, error = %err, "Peer not notified");
        }
    }

    async fn receive(&mut self) -> Result<SwapMessage> {
        self.session.receive().await
    }

    /// Move an approved request to ABORTED with `reason`.
    async fn abort_request(&self, reason: &str) {
        let reason = reason.to_string();
        let result = self
            .node
            .update_request(
                &self.request_id,
                Box::new(move |request| {
                    if request.status == RequestStatus::Approved {
                        request.abort(reason)
                    } else {
                        Ok(())
                    }
                }),
            )
            .await;
        if let Err(err) = result {
            warn!(request_id = %self.request_id, error = %err, "Request not marked aborted");
        }
    }

    /// Stop a flow that holds no escrow.
    async fn abandon(&mut self, err: &SwapError) -> SwapOutcome {
        warn!(request_id = %self.request_id, role = %self.role, error = %err, "Swap abandoned");
        if !matches!(
            err,
            SwapError::CounterpartyAborted(_) | SwapError::SessionClosed(_)
        ) {
            self.session.abort(err).await;
        }
        let reason = err.to_string();
        self.abort_request(&reason).await;
        SwapOutcome::Aborted { reason }
    }

    /// A flow that holds escrow could not finish.
    async fn interrupt(&self, err: SwapError) -> SwapError {
        error!(
            request_id = %self.request_id,
            role = %self.role,
            phase = %self.phase,
            error = %err,
            "Swap interrupted"
        );
        self.session.abort(&err).await;
        self.node.metrics().swap_interrupted();
        err
    }

    fn finish(&self, outcome: SwapOutcome) -> SwapOutcome {
        let metrics = self.node.metrics();
        match &outcome {
            SwapOutcome::Settled { .. } => metrics.swap_settled(),
            SwapOutcome::Reverted { .. } => metrics.swap_reverted(),
            SwapOutcome::Aborted { .. } => metrics.swap_aborted(),
        }
        info!(request_id = %self.request_id, role = %self.role, outcome = ?outcome, "Swap finished");
        self.node.record_outcome(self.request_id, outcome.clone());
        outcome
    }
}

enum BuyerState {
    Start,
    DraftSent,
    EscrowOffered(EscrowedLock),
    Settling(EscrowedLock),
    Reverting { lock: EscrowedLock, reason: String },
    Done(SwapOutcome),
}

impl BuyerState {
    fn phase(&self) -> FlowPhase {
        match self {
            BuyerState::Start => FlowPhase::Start,
            BuyerState::DraftSent => FlowPhase::DraftSent,
            BuyerState::EscrowOffered(_) => FlowPhase::EscrowOffered,
            BuyerState::Settling(_) => FlowPhase::Settling,
            BuyerState::Reverting { .. } => FlowPhase::Reverting,
            BuyerState::Done(_) => FlowPhase::Done,
        }
    }
}

/// The initiating side: pays with the buyer asset, receives the seller's.
pub struct BuyerFlow {
    ctx: FlowContext,
    options: ExecuteOptions,
}

impl BuyerFlow {
    pub fn new(node: Arc<SwapNode>, session: Session, options: ExecuteOptions) -> Self {
        Self {
            ctx: FlowContext::new(node, session, Role::Buyer),
            options,
        }
    }

    #[instrument(skip(self), fields(request_id = %self.ctx.request_id))]
    pub async fn run(mut self) -> Result<SwapOutcome> {
        self.ctx.node.metrics().swap_started();
        let mut state = BuyerState::Start;
        loop {
            if let BuyerState::Done(outcome) = state {
                return Ok(self.ctx.finish(outcome));
            }
            let holds_escrow = state.phase().holds_escrow();
            let next = match self.step(state).await {
                Ok(next) => next,
                Err(err) if !holds_escrow => BuyerState::Done(self.ctx.abandon(&err).await),
                Err(err) => return Err(self.ctx.interrupt(err).await),
            };
            if let Err(err) = self.ctx.enter(next.phase()) {
                return Err(self.ctx.interrupt(err).await);
            }
            state = next;
        }
    }

    async fn step(&mut self, state: BuyerState) -> Result<BuyerState> {
        match state {
            BuyerState::Start => self.send_draft().await,
            BuyerState::DraftSent => self.co_sign_escrow().await,
            BuyerState::EscrowOffered(lock) => self.await_decision(lock).await,
            BuyerState::Settling(lock) => self.settle(lock).await,
            BuyerState::Reverting { lock, reason } => self.authorize_revert(lock, reason).await,
            BuyerState::Done(outcome) => Ok(BuyerState::Done(outcome)),
        }
    }

    async fn send_draft(&mut self) -> Result<BuyerState> {
        let proposal = self
            .ctx
            .negotiator
            .propose_draft_transfer(self.ctx.request_id)
            .await?;
        self.ctx.send(SwapMessage::DraftProposal(proposal)).await?;
        Ok(BuyerState::DraftSent)
    }

    async fn co_sign_escrow(&mut self) -> Result<BuyerState> {
        let request = self.ctx.node.request(&self.ctx.request_id).await?;
        match self.ctx.receive().await? {
            SwapMessage::DraftAccepted { draft_id } if Some(draft_id) == request.draft_transfer_id => {
                info!(draft_id = %draft_id.short(), "Draft accepted by the seller");
            }
            SwapMessage::DraftAccepted { draft_id } => {
                return Err(SwapError::ConsistencyFault(format!(
                    "seller accepted draft {}, not the proposed one",
                    draft_id.short()
                )))
            }
            SwapMessage::DraftRejected { reason } => {
                let reason = format!("draft rejected: {}", reason);
                warn!(reason = %reason, "Seller rejected the draft");
                self.ctx.abort_request(&reason).await;
                return Ok(BuyerState::Done(SwapOutcome::Aborted { reason }));
            }
            other => return Err(unexpected("DRAFT_ACCEPTED or DRAFT_REJECTED", &other)),
        }

        let proposed = match self.ctx.receive().await? {
            SwapMessage::EscrowSignatureRequest { tx } => {
                let lock = self.ctx.escrow.check_escrow_proposal(&request, &tx)?;
                let signature = self.ctx.escrow.sign_escrow(&tx);
                self.ctx
                    .send(SwapMessage::EscrowSignature { signature })
                    .await?;
                lock
            }
            other => return Err(unexpected("ESCROW_SIGNATURE_REQUEST", &other)),
        };

        let lock = match self.ctx.receive().await? {
            SwapMessage::EscrowCommitted { tx } => {
                self.ctx.escrow.verify_committed_escrow(proposed, &tx).await?
            }
            other => return Err(unexpected("ESCROW_COMMITTED", &other)),
        };
        Ok(BuyerState::EscrowOffered(lock))
    }

    async fn await_decision(&mut self, lock: EscrowedLock) -> Result<BuyerState> {
        match self.ctx.receive().await {
            Ok(SwapMessage::Decision {
                decision: SellerDecision::Proceed,
            }) => Ok(BuyerState::Settling(lock)),
            Ok(SwapMessage::Decision {
                decision: SellerDecision::Reverting,
            }) => Ok(BuyerState::Reverting {
                lock,
                reason: "seller found the escrow deadline passed".to_string(),
            }),
            Ok(other) => Ok(BuyerState::Reverting {
                lock,
                reason: unexpected("DECISION", &other).to_string(),
            }),
            Err(err) => Ok(BuyerState::Reverting {
                lock,
                reason: err.to_string(),
            }),
        }
    }

    async fn settle(&mut self, lock: EscrowedLock) -> Result<BuyerState> {
        if let Some(delay) = self.options.settle_delay {
            debug!(delay_ms = delay.as_millis() as u64, "Delaying the buyer leg");
            tokio::time::sleep(delay).await;
        }

        let settlement = match self.ctx.relay.finalize_buyer_leg(self.ctx.request_id).await {
            Ok(settlement) => settlement,
            Err(err) => {
                warn!(error = %err, "Buyer leg not committed");
                let reason = err.to_string();
                self.ctx
                    .notify(SwapMessage::SettlementFailed {
                        reason: reason.clone(),
                    })
                    .await;
                return Ok(BuyerState::Reverting { lock, reason });
            }
        };
        let settlement_tx_id = settlement.id();

        let proof = extract_settlement_proof(lock.lock(), &settlement)?;
        let mut release = self
            .ctx
            .relay
            .release_escrow(&lock, proof, settlement_tx_id)?;
        self.ctx
            .notify(SwapMessage::ReleaseProposal {
                tx: release.clone(),
                settlement,
            })
            .await;

        let seller = self.ctx.session.peer().key;
        match self.ctx.receive().await {
            Ok(SwapMessage::ReleaseSignature { signature })
                if signature.by == seller && signature.verify(&release.id()).is_ok() =>
            {
                release.add_signature(signature);
            }
            Ok(other) => {
                debug!(kind = other.kind(), "Releasing without the seller's co-signature");
            }
            Err(err) => {
                warn!(error = %err, "Releasing without the seller's co-signature");
            }
        }

        let committed = self.ctx.relay.commit_release(&lock, release).await?;
        let released = self.ctx.relay.record_release(lock, &committed).await?;
        self.ctx
            .notify(SwapMessage::ReleaseCommitted { tx: committed })
            .await;

        Ok(BuyerState::Done(SwapOutcome::Settled {
            settlement_tx_id,
            release_tx_id: Some(released.release_tx_id),
        }))
    }

    async fn authorize_revert(&mut self, lock: EscrowedLock, reason: String) -> Result<BuyerState> {
        info!(reason = %reason, "Waiting for the seller to revert the escrow");
        let node = self.ctx.node.clone();
        let config = node.config();
        let give_up = node.instant_at(lock.deadline() + config.revert_margin + config.session_timeout);
        let intent = loop {
            match self.ctx.session.receive_until(give_up).await? {
                Some(SwapMessage::RevertIntentSignatureRequest { tx }) => break tx,
                Some(other) => debug!(kind = other.kind(), "Ignored while reverting"),
                None => {
                    return Err(SwapError::Timeout(format!(
                        "no revert intent for lock {} after its deadline {}",
                        lock.lock_id().short(),
                        lock.deadline().to_rfc3339()
                    )))
                }
            }
        };
        let outcome = self.co_sign_intent(lock, reason, intent).await?;
        Ok(BuyerState::Done(outcome))
    }

    /// Serve a seller that re-drives the revert of an escrow after the flows
    /// that created it ended. `first` is the seller's opening request.
    #[instrument(skip(self, first), fields(request_id = %self.ctx.request_id))]
    pub async fn recover(mut self, first: SwapMessage) -> Result<SwapOutcome> {
        self.ctx.node.metrics().swap_started();
        match self.recover_revert(first).await {
            Ok(outcome) => Ok(self.ctx.finish(outcome)),
            Err(err) => Err(self.ctx.interrupt(err).await),
        }
    }

    async fn recover_revert(&mut self, first: SwapMessage) -> Result<SwapOutcome> {
        let request = self.ctx.node.request(&self.ctx.request_id).await?;
        self.ctx.node.require_role(&request, Role::Buyer)?;
        if request.seller != *self.ctx.session.peer() {
            return Err(SwapError::AuthorizationFailure(format!(
                "revert of request {} requested by {}, not the seller",
                request.id,
                self.ctx.session.peer()
            )));
        }
        let lock = self
            .ctx
            .escrow
            .recorded_escrow(&request)
            .await?
            .ok_or_else(|| SwapError::NotFound(format!("request {} has no escrow", request.id)))?;

        self.ctx.resume_at(FlowPhase::Reverting);
        let reason = "escrow reverted after its flow ended".to_string();
        match first {
            SwapMessage::RevertIntentSignatureRequest { tx } => {
                self.co_sign_intent(lock, reason, tx).await
            }
            SwapMessage::RevertSignatureRequest { tx } => self.co_sign_revert(lock, reason, tx).await,
            other => Err(unexpected(
                "REVERT_INTENT_SIGNATURE_REQUEST or REVERT_SIGNATURE_REQUEST",
                &other,
            )),
        }
    }

    async fn co_sign_intent(
        &mut self,
        lock: EscrowedLock,
        reason: String,
        intent: SignedTransaction,
    ) -> Result<SwapOutcome> {
        let signature = self
            .ctx
            .revert
            .authorize_revert_intent(self.ctx.request_id, &lock, &intent)
            .await?;
        self.ctx
            .send(SwapMessage::RevertSignature { signature })
            .await?;

        let revert_tx = match self.ctx.receive().await? {
            SwapMessage::RevertSignatureRequest { tx } => tx,
            other => return Err(unexpected("REVERT_SIGNATURE_REQUEST", &other)),
        };
        self.co_sign_revert(lock, reason, revert_tx).await
    }

    async fn co_sign_revert(
        &mut self,
        lock: EscrowedLock,
        reason: String,
        revert_tx: SignedTransaction,
    ) -> Result<SwapOutcome> {
        let registered = self.ctx.revert.resolve_intent(lock, &revert_tx).await?;
        let signature = self
            .ctx
            .revert
            .authorize_revert(self.ctx.request_id, &registered, &revert_tx)
            .await?;
        self.ctx
            .send(SwapMessage::RevertSignature { signature })
            .await?;

        let committed = match self.ctx.receive().await? {
            SwapMessage::RevertCommitted { tx } => tx,
            other => return Err(unexpected("REVERT_COMMITTED", &other)),
        };
        let reverted = self.ctx.revert.record_revert(registered, &committed)?;
        self.ctx.abort_request(&reason).await;

        Ok(SwapOutcome::Reverted {
            revert_tx_id: reverted.revert_tx_id,
            reason,
        })
    }
}

enum SellerState {
    Start(DraftProposal),
    DraftSent {
        draft_id: SecureHash,
        draft: WireTransaction,
    },
    EscrowOffered {
        lock: EscrowedLock,
        escrow: SignedTransaction,
    },
    Settling(EscrowedLock),
    Reverting { lock: EscrowedLock, reason: String },
    Done(SwapOutcome),
}

impl SellerState {
    fn phase(&self) -> FlowPhase {
        match self {
            SellerState::Start(_) => FlowPhase::Start,
            SellerState::DraftSent { .. } => FlowPhase::DraftSent,
            SellerState::EscrowOffered { .. } => FlowPhase::EscrowOffered,
            SellerState::Settling(_) => FlowPhase::Settling,
            SellerState::Reverting { .. } => FlowPhase::Reverting,
            SellerState::Done(_) => FlowPhase::Done,
        }
    }
}

/// The responding side: escrows the seller asset and either releases it to
/// the buyer against proof or reverts it after the deadline.
pub struct SellerFlow {
    ctx: FlowContext,
}

impl SellerFlow {
    pub fn new(node: Arc<SwapNode>, session: Session) -> Self {
        Self {
            ctx: FlowContext::new(node, session, Role::Seller),
        }
    }

    #[instrument(skip(self, proposal), fields(request_id = %self.ctx.request_id))]
    pub async fn run(mut self, proposal: DraftProposal) -> Result<SwapOutcome> {
        self.ctx.node.metrics().swap_started();
        self.drive(SellerState::Start(proposal)).await
    }

    /// Re-drive the revert of `lock` after the flow that escrowed it ended.
    /// A release or intent already on the ledger is picked up as it is.
    #[instrument(skip(self, lock), fields(request_id = %self.ctx.request_id))]
    pub async fn recover(mut self, lock: EscrowedLock) -> Result<SwapOutcome> {
        self.ctx.node.metrics().swap_started();
        self.ctx.resume_at(FlowPhase::Reverting);
        let reason = format!(
            "escrow left open past its deadline {}",
            lock.deadline().to_rfc3339()
        );
        match self.recovered_state(lock, reason).await {
            Ok(state) => self.drive(state).await,
            Err(err) => Err(self.ctx.interrupt(err).await),
        }
    }

    async fn recovered_state(&mut self, lock: EscrowedLock, reason: String) -> Result<SellerState> {
        match self.ctx.relay.consumer_of(&lock).await? {
            None => Ok(SellerState::Reverting { lock, reason }),
            Some(release) if self.ctx.relay.verify_release(&lock, &release).is_ok() => {
                self.settled(lock, &release).await
            }
            Some(intent) => {
                let registered = self.ctx.revert.record_intent(lock, &intent)?;
                self.complete_revert(registered, reason).await
            }
        }
    }

    async fn drive(&mut self, mut state: SellerState) -> Result<SwapOutcome> {
        loop {
            if let SellerState::Done(outcome) = state {
                return Ok(self.ctx.finish(outcome));
            }
            let holds_escrow = state.phase().holds_escrow();
            let next = match self.step(state).await {
                Ok(next) => next,
                Err(err) if !holds_escrow => SellerState::Done(self.ctx.abandon(&err).await),
                Err(err) => return Err(self.ctx.interrupt(err).await),
            };
            if let Err(err) = self.ctx.enter(next.phase()) {
                return Err(self.ctx.interrupt(err).await);
            }
            state = next;
        }
    }

    async fn step(&mut self, state: SellerState) -> Result<SellerState> {
        match state {
            SellerState::Start(proposal) => self.judge_draft(proposal).await,
            SellerState::DraftSent { draft_id, draft } => self.escrow(draft_id, draft).await,
            SellerState::EscrowOffered { lock, escrow } => self.decide(lock, escrow).await,
            SellerState::Settling(lock) => self.await_release(lock).await,
            SellerState::Reverting { lock, reason } => self.revert(lock, reason).await,
            SellerState::Done(outcome) => Ok(SellerState::Done(outcome)),
        }
    }

    async fn judge_draft(&mut self, proposal: DraftProposal) -> Result<SellerState> {
        let request = self.ctx.node.request(&self.ctx.request_id).await?;
        if request.buyer != *self.ctx.session.peer() {
            return Err(SwapError::AuthorizationFailure(format!(
                "draft for request {} came from {}, not the buyer",
                request.id,
                self.ctx.session.peer()
            )));
        }

        match self.ctx.negotiator.accept_draft(&proposal).await {
            Ok(draft_id) => {
                self.ctx
                    .send(SwapMessage::DraftAccepted { draft_id })
                    .await?;
                Ok(SellerState::DraftSent {
                    draft_id,
                    draft: proposal.transfer,
                })
            }
            Err(err) if err.aborts_request() => {
                self.ctx
                    .notify(SwapMessage::DraftRejected {
                        reason: err.to_string(),
                    })
                    .await;
                let reason = format!("draft rejected: {}", err);
                self.ctx.abort_request(&reason).await;
                Ok(SellerState::Done(SwapOutcome::Aborted { reason }))
            }
            Err(err) => Err(err),
        }
    }

    async fn escrow(&mut self, draft_id: SecureHash, draft: WireTransaction) -> Result<SellerState> {
        let request = self.ctx.node.request(&self.ctx.request_id).await?;
        let offer = self.ctx.escrow.offer_escrow(&request, draft_id, &draft).await?;
        self.ctx
            .send(SwapMessage::EscrowSignatureRequest { tx: offer.clone() })
            .await?;

        let signature = match self.ctx.receive().await? {
            SwapMessage::EscrowSignature { signature } => signature,
            other => return Err(unexpected("ESCROW_SIGNATURE", &other)),
        };
        let (escrow, lock) = self
            .ctx
            .escrow
            .commit_escrow(&request, offer, signature)
            .await?;
        Ok(SellerState::EscrowOffered { lock, escrow })
    }

    async fn decide(&mut self, lock: EscrowedLock, escrow: SignedTransaction) -> Result<SellerState> {
        if let Err(err) = self.ctx.send(SwapMessage::EscrowCommitted { tx: escrow }).await {
            return Ok(SellerState::Reverting {
                lock,
                reason: err.to_string(),
            });
        }

        let now = self.ctx.node.now();
        if now < lock.deadline() {
            let sent = self
                .ctx
                .send(SwapMessage::Decision {
                    decision: SellerDecision::Proceed,
                })
                .await;
            match sent {
                Ok(()) => Ok(SellerState::Settling(lock)),
                Err(err) => Ok(SellerState::Reverting {
                    lock,
                    reason: err.to_string(),
                }),
            }
        } else {
            self.ctx
                .notify(SwapMessage::Decision {
                    decision: SellerDecision::Reverting,
                })
                .await;
            Ok(SellerState::Reverting {
                lock,
                reason: "escrow deadline passed before settlement started".to_string(),
            })
        }
    }

    async fn await_release(&mut self, lock: EscrowedLock) -> Result<SellerState> {
        let node = self.ctx.node.clone();
        let give_up = node.instant_at(lock.deadline() + node.config().revert_margin);
        loop {
            let message = match self.ctx.session.receive_until(give_up).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    return Ok(SellerState::Reverting {
                        lock,
                        reason: "no release before the escrow deadline".to_string(),
                    })
                }
                Err(err) => {
                    warn!(error = %err, "Settlement wait ended");
                    return Ok(SellerState::Reverting {
                        lock,
                        reason: err.to_string(),
                    });
                }
            };

            match message {
                SwapMessage::ReleaseProposal { tx, settlement } => {
                    match self.ctx.relay.check_release_proposal(&lock, &tx, &settlement) {
                        Ok(signature) => {
                            self.ctx
                                .notify(SwapMessage::ReleaseSignature { signature })
                                .await
                        }
                        Err(err) => warn!(error = %err, "Release proposal refused"),
                    }
                }
                SwapMessage::ReleaseCommitted { tx } => {
                    match self.ctx.relay.verify_release(&lock, &tx) {
                        Ok(()) => return self.settled(lock, &tx).await,
                        Err(err) => warn!(error = %err, "Release claim refused"),
                    }
                }
                SwapMessage::SettlementFailed { reason } => {
                    return Ok(SellerState::Reverting {
                        lock,
                        reason: format!("buyer leg failed: {}", reason),
                    })
                }
                other => debug!(kind = other.kind(), "Ignored while settling"),
            }
        }
    }

    async fn settled(&self, lock: EscrowedLock, release: &SignedTransaction) -> Result<SellerState> {
        let settlement_tx_id = lock.lock().draft_transfer_ref;
        let released = self.ctx.relay.record_release(lock, release).await?;
        Ok(SellerState::Done(SwapOutcome::Settled {
            settlement_tx_id,
            release_tx_id: Some(released.release_tx_id),
        }))
    }

    async fn revert(&mut self, lock: EscrowedLock, reason: String) -> Result<SellerState> {
        let node = self.ctx.node.clone();
        info!(reason = %reason, deadline = %lock.deadline().to_rfc3339(), "Reverting escrow");
        tokio::time::sleep_until(node.instant_at(lock.lock().revert_opens_at())).await;

        let intent = self.ctx.revert.register_revert_intent(&lock)?;
        self.ctx
            .send(SwapMessage::RevertIntentSignatureRequest { tx: intent.clone() })
            .await?;

        let signature = loop {
            match self.ctx.receive().await {
                Ok(SwapMessage::RevertSignature { signature }) => break signature,
                Ok(SwapMessage::ReleaseCommitted { tx }) => {
                    match self.ctx.relay.verify_release(&lock, &tx) {
                        Ok(()) => return self.settled(lock, &tx).await,
                        Err(err) => warn!(error = %err, "Release claim refused"),
                    }
                }
                Ok(other) => debug!(kind = other.kind(), "Ignored while reverting"),
                Err(err) => return self.released_instead(lock, err).await,
            }
        };

        let committed = match self.ctx.revert.commit_intent(&lock, intent, signature).await {
            Ok(committed) => committed,
            Err(err) => return self.released_instead(lock, err).await,
        };
        let registered = self.ctx.revert.record_intent(lock, &committed)?;
        self.complete_revert(registered, reason).await
    }

    async fn complete_revert(
        &mut self,
        registered: IntentRegisteredLock,
        reason: String,
    ) -> Result<SellerState> {
        let revert_tx = self.ctx.revert.build_revert(&registered)?;
        self.ctx
            .send(SwapMessage::RevertSignatureRequest {
                tx: revert_tx.clone(),
            })
            .await?;
        let signature = match self.ctx.receive().await? {
            SwapMessage::RevertSignature { signature } => signature,
            other => return Err(unexpected("REVERT_SIGNATURE", &other)),
        };
        let committed = self
            .ctx
            .revert
            .commit_revert(&registered, revert_tx, signature)
            .await?;
        let reverted = self.ctx.revert.record_revert(registered, &committed)?;

        self.ctx
            .notify(SwapMessage::RevertCommitted { tx: committed })
            .await;
        self.ctx.abort_request(&reason).await;
        Ok(SellerState::Done(SwapOutcome::Reverted {
            revert_tx_id: reverted.revert_tx_id,
            reason,
        }))
    }

    /// The revert could not proceed. Settled if a release already consumed
    /// the lock, otherwise `err`.
    async fn released_instead(&self, lock: EscrowedLock, err: SwapError) -> Result<SellerState> {
        match self.ctx.relay.committed_release(&lock).await? {
            Some(release) => {
                info!(tx_id = %release.id().short(), "Escrow was released first");
                self.settled(lock, &release).await
            }
            None => Err(err),
        }
    }
}
