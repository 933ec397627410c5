//! Per-domain notary: the single point where a domain's transactions
//! are checked and committed.

use std::sync::Arc;

use crossnotary_common::{NotaryId, SharedClock, Timestamp};
use crossnotary_crypto::{PublicKey, SigningKey};
use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use crate::{
    ContractRegistry, LedgerError, LedgerTransaction, Result, SignatureMetadata,
    SignedTransaction, TransactionSignature, Vault,
};

/// Commits transactions for one ledger domain.
///
/// A commit either applies completely (inputs spent, outputs recorded, notary
/// signature returned) or not at all. Commits are serialized by a guard, so
/// two transactions spending the same state cannot both succeed.
pub struct Notary {
    id: NotaryId,
    key: SigningKey,
    metadata: SignatureMetadata,
    clock: SharedClock,
    contracts: Arc<ContractRegistry>,
    vault: Arc<Vault>,
    commit_guard: Mutex<()>,
}

impl Notary {
    pub fn new(
        id: NotaryId,
        key: SigningKey,
        clock: SharedClock,
        contracts: Arc<ContractRegistry>,
    ) -> Self {
        Self {
            id,
            key,
            metadata: SignatureMetadata::default(),
            clock,
            contracts,
            vault: Arc::new(Vault::new()),
            commit_guard: Mutex::new(()),
        }
    }

    /// Override the metadata stamped on notary signatures.
    pub fn with_metadata(mut self, metadata: SignatureMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn id(&self) -> &NotaryId {
        &self.id
    }

    pub fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }

    pub fn metadata(&self) -> SignatureMetadata {
        self.metadata
    }

    pub fn vault(&self) -> &Arc<Vault> {
        &self.vault
    }

    pub fn contracts(&self) -> &Arc<ContractRegistry> {
        &self.contracts
    }

    /// The notary's view of the current time.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Check and commit `stx`, returning the notary's signature.
    ///
    /// Re-submitting an already committed transaction returns the original
    /// signature.
    #[instrument(skip(self, stx), fields(notary = %self.id, tx_id = %stx.id().short()))]
    pub fn commit(&self, stx: &SignedTransaction) -> Result<TransactionSignature> {
        let id = stx.id();
        let _guard = self.commit_guard.lock();

        if let Some(sig) = self
            .vault
            .transaction(&id)
            .and_then(|committed| committed.signature_by(&self.public_key()).cloned())
        {
            info!("Transaction already committed");
            return Ok(sig);
        }

        match &stx.tx.notary {
            Some(notary) if *notary == self.id => {}
            other => {
                return Err(LedgerError::WrongNotary {
                    expected: self.id.clone(),
                    actual: other.clone(),
                })
            }
        }

        for input in &stx.tx.inputs {
            if let Some(consumed_by) = self.vault.consumed_by(input) {
                warn!(state = %input, consumed_by = %consumed_by.short(), "Double spend rejected");
                return Err(LedgerError::DoubleSpend {
                    state: *input,
                    consumed_by,
                });
            }
        }

        let ltx = LedgerTransaction::resolve(&stx.tx, |state_ref| self.vault.unspent(state_ref))?;
        ltx.check_encumbrances()?;

        if let Some(window) = &stx.tx.time_window {
            let now = self.clock.now();
            if !window.contains(now) {
                warn!(now = %now, window = %window, "Time window rejected");
                return Err(LedgerError::TimeWindow(format!(
                    "{} is outside {}",
                    now.to_rfc3339(),
                    window
                )));
            }
        }

        stx.verify_required_signatures()?;
        self.contracts.verify(&ltx)?;

        let sig = TransactionSignature::sign(&self.key, &id, self.metadata);
        let mut committed = stx.clone();
        committed.add_signature(sig.clone());
        self.vault.record(committed);

        info!(
            inputs = stx.tx.inputs.len(),
            outputs = stx.tx.outputs.len(),
            "Transaction notarised"
        );

        Ok(sig)
    }
}

impl std::fmt::Debug for Notary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notary")
            .field("id", &self.id)
            .field("key", &self.key.key_id())
            .field("metadata", &self.metadata)
            .finish()
    }
}
