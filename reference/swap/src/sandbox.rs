//! A two-notary deployment in one process.
//!
//! `NotaryA` governs USD and `NotaryB` governs ART and GBP unless the
//! builder is told otherwise. One issuer key mints tokens on every domain.

use std::sync::Arc;

use crossnotary_common::{
    AssetId, MonotonicClock, NotaryId, Party, Result, SharedClock, SwapError, TokenKind,
};
use crossnotary_crypto::{SignerPolicy, SigningKey};
use crossnotary_ledger::{
    AssetLedger, ContractRegistry, LedgerNetwork, SignedTransaction, TokenContract,
};
use rust_decimal::Decimal;
use tracing::info;

use crate::config::SwapConfig;
use crate::lock::LockContract;
use crate::metrics::SwapMetrics;
use crate::network::SwapNetwork;
use crate::node::SwapNode;
use crate::service::SwapService;
use crate::store::{InMemoryRequestStore, SharedStore};

pub const NOTARY_A: &str = "NotaryA";
pub const NOTARY_B: &str = "NotaryB";

/// Builder for [`Sandbox`].
pub struct SandboxBuilder {
    config: SwapConfig,
    clock: Option<SharedClock>,
    domains: Vec<(TokenKind, NotaryId)>,
}

impl Default for SandboxBuilder {
    fn default() -> Self {
        Self {
            config: SwapConfig::default(),
            clock: None,
            domains: vec![
                (TokenKind::new("USD"), NotaryId::new(NOTARY_A)),
                (TokenKind::new("ART"), NotaryId::new(NOTARY_B)),
                (TokenKind::new("GBP"), NotaryId::new(NOTARY_B)),
            ],
        }
    }
}

impl SandboxBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: SwapConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock shared by notaries and nodes. Defaults to a [`MonotonicClock`].
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Route `kind` to `notary`, which must be [`NOTARY_A`] or [`NOTARY_B`].
    pub fn domain(mut self, kind: &str, notary: &str) -> Self {
        let kind = TokenKind::new(kind);
        self.domains.retain(|(existing, _)| *existing != kind);
        self.domains.push((kind, NotaryId::new(notary)));
        self
    }

    pub fn build(self) -> Result<Sandbox> {
        self.config.validate().map_err(SwapError::Configuration)?;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()) as SharedClock);

        let contracts = ContractRegistry::new()
            .with(Arc::new(TokenContract))
            .with(Arc::new(LockContract));
        let mut builder = LedgerNetwork::builder(contracts)
            .notary(NOTARY_A, SigningKey::generate(), clock.clone())
            .notary(NOTARY_B, SigningKey::generate(), clock.clone());
        for (kind, notary) in self.domains {
            builder = builder.domain(kind, notary);
        }
        let ledgers = builder.build()?;

        info!(notaries = ?ledgers.notary_ids(), "Sandbox ledgers ready");
        Ok(Sandbox {
            config: self.config,
            clock,
            ledgers,
            network: Arc::new(SwapNetwork::new()),
            issuer: SigningKey::generate(),
        })
    }
}

/// Ledgers, a swap network and a token issuer.
pub struct Sandbox {
    config: SwapConfig,
    clock: SharedClock,
    ledgers: Arc<LedgerNetwork>,
    network: Arc<SwapNetwork>,
    issuer: SigningKey,
}

impl Sandbox {
    pub fn builder() -> SandboxBuilder {
        SandboxBuilder::new()
    }

    /// Join a new party with an in-memory request store.
    pub fn add_party(&self, name: &str) -> Result<SwapService> {
        self.add_party_with_store(name, Arc::new(InMemoryRequestStore::new()))
    }

    pub fn add_party_with_store(&self, name: &str, store: SharedStore) -> Result<SwapService> {
        let node = Arc::new(SwapNode::new(
            name,
            SigningKey::generate(),
            self.config.clone(),
            store,
            self.ledgers.clone(),
            self.clock.clone(),
            Arc::new(SwapMetrics::new()),
        ));
        self.network.register(node.clone())?;
        Ok(SwapService::new(node, self.network.clone()))
    }

    /// Mint `quantity` of `kind` to `holder`.
    pub async fn issue_fungible(
        &self,
        kind: &str,
        quantity: Decimal,
        holder: &Party,
    ) -> Result<SignedTransaction> {
        let kind = TokenKind::new(kind);
        let ledger = self.ledgers.ledger_for(&kind)?;
        Ok(ledger
            .issue_fungible(&self.issuer, kind, quantity, holder.key)
            .await?)
    }

    /// Mint the unique asset `asset_id` of `kind` to `holder`.
    pub async fn issue_unique(
        &self,
        kind: &str,
        asset_id: &str,
        holder: &Party,
    ) -> Result<SignedTransaction> {
        let kind = TokenKind::new(kind);
        let ledger = self.ledgers.ledger_for(&kind)?;
        Ok(ledger
            .issue_unique(&self.issuer, kind, AssetId::new(asset_id), holder.key)
            .await?)
    }

    /// Unencumbered `kind` held by `party` alone.
    pub async fn balance(&self, party: &Party, kind: &str) -> Result<Decimal> {
        let kind = TokenKind::new(kind);
        Ok(self.ledgers.ledger_for(&kind)?.balance(&party.key, &kind).await?)
    }

    /// Current holder policy of a unique asset.
    pub async fn holder_of(&self, kind: &str, asset_id: &str) -> Result<Option<SignerPolicy>> {
        let kind = TokenKind::new(kind);
        Ok(self
            .ledgers
            .ledger_for(&kind)?
            .holder_of(&kind, &AssetId::new(asset_id))
            .await?)
    }

    pub fn config(&self) -> &SwapConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn ledgers(&self) -> &Arc<LedgerNetwork> {
        &self.ledgers
    }

    pub fn network(&self) -> &Arc<SwapNetwork> {
        &self.network
    }
}
