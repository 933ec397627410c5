//! Directory of notaries and the token kinds each one governs.

use std::collections::HashMap;
use std::sync::Arc;

use crossnotary_common::{NotaryId, SharedClock, TokenKind};
use crossnotary_crypto::{PublicKey, SigningKey};

use crate::{ContractRegistry, LedgerError, Notary, Result, SignatureMetadata, VaultAssetLedger};

/// Every ledger domain in a deployment.
#[derive(Debug)]
pub struct LedgerNetwork {
    notaries: HashMap<NotaryId, Arc<Notary>>,
    domains: HashMap<TokenKind, NotaryId>,
    contracts: Arc<ContractRegistry>,
}

impl LedgerNetwork {
    pub fn builder(contracts: ContractRegistry) -> LedgerNetworkBuilder {
        LedgerNetworkBuilder {
            notaries: HashMap::new(),
            domains: HashMap::new(),
            contracts: Arc::new(contracts),
        }
    }

    pub fn contracts(&self) -> &Arc<ContractRegistry> {
        &self.contracts
    }

    pub fn notary(&self, id: &NotaryId) -> Result<Arc<Notary>> {
        self.notaries
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownNotary(id.to_string()))
    }

    /// Public key of notary `id`.
    pub fn notary_key(&self, id: &NotaryId) -> Result<PublicKey> {
        Ok(self.notary(id)?.public_key())
    }

    /// The notary that governs `kind`.
    pub fn notary_for_kind(&self, kind: &TokenKind) -> Result<Arc<Notary>> {
        let id = self
            .domains
            .get(kind)
            .ok_or_else(|| LedgerError::UnknownNotary(format!("no domain for {}", kind)))?;
        self.notary(id)
    }

    /// Asset ledger for the domain governing `kind`.
    pub fn ledger_for(&self, kind: &TokenKind) -> Result<VaultAssetLedger> {
        Ok(VaultAssetLedger::new(self.notary_for_kind(kind)?))
    }

    pub fn notary_ids(&self) -> Vec<NotaryId> {
        let mut ids: Vec<_> = self.notaries.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Builder for [`LedgerNetwork`].
pub struct LedgerNetworkBuilder {
    notaries: HashMap<NotaryId, Arc<Notary>>,
    domains: HashMap<TokenKind, NotaryId>,
    contracts: Arc<ContractRegistry>,
}

impl LedgerNetworkBuilder {
    /// Add a notary with default signature metadata.
    pub fn notary(self, id: impl Into<NotaryId>, key: SigningKey, clock: SharedClock) -> Self {
        self.notary_with_metadata(id, key, clock, SignatureMetadata::default())
    }

    pub fn notary_with_metadata(
        mut self,
        id: impl Into<NotaryId>,
        key: SigningKey,
        clock: SharedClock,
        metadata: SignatureMetadata,
    ) -> Self {
        let id = id.into();
        let notary = Notary::new(id.clone(), key, clock, self.contracts.clone()).with_metadata(metadata);
        self.notaries.insert(id, Arc::new(notary));
        self
    }

    /// Route `kind` to notary `id`.
    pub fn domain(mut self, kind: impl Into<TokenKind>, id: impl Into<NotaryId>) -> Self {
        self.domains.insert(kind.into(), id.into());
        self
    }

    pub fn build(self) -> Result<Arc<LedgerNetwork>> {
        if let Some(missing) = self
            .domains
            .values()
            .find(|id| !self.notaries.contains_key(*id))
        {
            return Err(LedgerError::UnknownNotary(missing.to_string()));
        }
        Ok(Arc::new(LedgerNetwork {
            notaries: self.notaries,
            domains: self.domains,
            contracts: self.contracts,
        }))
    }
}
