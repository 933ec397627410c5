//! A party's swap node: identity, request store, ledger access and clock.

use std::sync::Arc;

use crossnotary_common::{
    DurationExt, ExchangeRequest, NotaryId, Party, PartyId, RequestId, Result, SharedClock,
    SwapError, Timestamp, TokenKind,
};
use crossnotary_crypto::{PublicKey, SigningKey};
use crossnotary_ledger::{
    LedgerNetwork, SignedTransaction, TransactionSignature, VaultAssetLedger,
};
use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::SwapConfig;
use crate::lock_manager::LockManager;
use crate::metrics::SharedMetrics;
use crate::session::SessionEndpoint;
use crate::state::{Role, SwapOutcome};
use crate::store::{RequestMutation, SharedStore};

/// Everything one party's flows share.
pub struct SwapNode {
    party: Party,
    key: SigningKey,
    config: SwapConfig,
    store: SharedStore,
    ledgers: Arc<LedgerNetwork>,
    locks: LockManager,
    clock: SharedClock,
    metrics: SharedMetrics,
    outcomes: DashMap<RequestId, SwapOutcome>,
}

impl SwapNode {
    pub fn new(
        name: impl Into<PartyId>,
        key: SigningKey,
        config: SwapConfig,
        store: SharedStore,
        ledgers: Arc<LedgerNetwork>,
        clock: SharedClock,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            party: Party::new(name, key.public_key()),
            key,
            config,
            store,
            ledgers,
            locks: LockManager::new(metrics.clone()),
            clock,
            metrics,
            outcomes: DashMap::new(),
        }
    }

    pub fn party(&self) -> &Party {
        &self.party
    }

    pub fn public_key(&self) -> PublicKey {
        self.party.key
    }

    pub fn config(&self) -> &SwapConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn ledgers(&self) -> &Arc<LedgerNetwork> {
        &self.ledgers
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    /// The node's view of the current time.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Runtime instant at which the node clock reads `at`.
    pub fn instant_at(&self, at: Timestamp) -> Instant {
        Instant::now() + (at - self.now()).as_std()
    }

    /// Ledger of the domain governing `kind`.
    pub fn ledger_for(&self, kind: &TokenKind) -> Result<VaultAssetLedger> {
        Ok(self.ledgers.ledger_for(kind)?)
    }

    /// Ledger of the domain run by notary `id`.
    pub fn ledger_at(&self, id: &NotaryId) -> Result<VaultAssetLedger> {
        Ok(VaultAssetLedger::new(self.ledgers.notary(id)?))
    }

    /// Fail unless every signature on `stx` is valid and notary `id`
    /// signed it.
    pub fn check_notarised(&self, stx: &SignedTransaction, id: &NotaryId) -> Result<()> {
        stx.verify_attached()?;
        let notary_key = self.ledgers.notary_key(id)?;
        if stx.signature_by(&notary_key).is_none() {
            return Err(SwapError::AuthorizationFailure(format!(
                "{} carries no signature of {}",
                stx.id().short(),
                id
            )));
        }
        Ok(())
    }

    /// This node's signature over `stx`.
    pub fn sign(&self, stx: &SignedTransaction) -> TransactionSignature {
        TransactionSignature::sign(&self.key, &stx.id(), self.config.signature_metadata)
    }

    /// `stx` with this node's signature attached.
    pub fn sign_transaction(&self, mut stx: SignedTransaction) -> SignedTransaction {
        let sig = self.sign(&stx);
        stx.add_signature(sig);
        stx
    }

    /// This node's side of a session.
    pub fn endpoint(&self) -> SessionEndpoint {
        SessionEndpoint {
            party: self.party.clone(),
            timeout: self.config.session_timeout,
            metrics: self.metrics.clone(),
        }
    }

    pub async fn request(&self, id: &RequestId) -> Result<ExchangeRequest> {
        self.store.get(id).await
    }

    pub async fn update_request(
        &self,
        id: &RequestId,
        mutation: RequestMutation,
    ) -> Result<ExchangeRequest> {
        self.store.update(id, mutation).await
    }

    /// Remember how a flow for `request_id` ended.
    pub fn record_outcome(&self, request_id: RequestId, outcome: SwapOutcome) {
        self.outcomes.insert(request_id, outcome);
    }

    /// How the last flow for `request_id` ended, if one finished.
    pub fn outcome(&self, request_id: &RequestId) -> Option<SwapOutcome> {
        self.outcomes.get(request_id).map(|entry| entry.value().clone())
    }

    /// This node's role in `request`.
    pub fn role_in(&self, request: &ExchangeRequest) -> Result<Role> {
        if request.buyer.key == self.party.key {
            Ok(Role::Buyer)
        } else if request.seller.key == self.party.key {
            Ok(Role::Seller)
        } else {
            Err(SwapError::AuthorizationFailure(format!(
                "{} is not a party to request {}",
                self.party, request.id
            )))
        }
    }

    /// Fail unless this node plays `role` in `request`.
    pub fn require_role(&self, request: &ExchangeRequest, role: Role) -> Result<()> {
        let actual = self.role_in(request)?;
        if actual != role {
            return Err(SwapError::AuthorizationFailure(format!(
                "{} is the {} of request {}, not the {}",
                self.party, actual, request.id, role
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for SwapNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapNode")
            .field("party", &self.party)
            .field("config", &self.config)
            .finish()
    }
}
