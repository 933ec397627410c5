//! Record of committed transactions and unspent states for one domain.

use dashmap::DashMap;
use crossnotary_crypto::SecureHash;
use tracing::debug;

use crate::{ContractState, SignedTransaction, StateAndRef, StateEnvelope, StateRef};

/// Committed state of a ledger domain.
///
/// Mutated only by the domain's notary while it holds its commit guard.
#[derive(Debug, Default)]
pub struct Vault {
    unspent: DashMap<StateRef, StateEnvelope>,
    spent: DashMap<StateRef, SecureHash>,
    transactions: DashMap<SecureHash, SignedTransaction>,
}

impl Vault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unspent state at `state_ref`.
    pub fn unspent(&self, state_ref: &StateRef) -> Option<StateEnvelope> {
        self.unspent.get(state_ref).map(|entry| entry.value().clone())
    }

    /// Transaction that consumed `state_ref`, if any.
    pub fn consumed_by(&self, state_ref: &StateRef) -> Option<SecureHash> {
        self.spent.get(state_ref).map(|entry| *entry.value())
    }

    pub fn transaction(&self, id: &SecureHash) -> Option<SignedTransaction> {
        self.transactions.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains_transaction(&self, id: &SecureHash) -> bool {
        self.transactions.contains_key(id)
    }

    /// Mark inputs spent, add outputs, store the transaction.
    pub(crate) fn record(&self, stx: SignedTransaction) {
        let id = stx.id();
        for input in &stx.tx.inputs {
            self.unspent.remove(input);
            self.spent.insert(*input, id);
        }
        for state in stx.tx.out_refs() {
            self.unspent.insert(state.state_ref, state.state);
        }
        debug!(tx_id = %id.short(), "Transaction recorded");
        self.transactions.insert(id, stx);
    }

    /// Unspent states of type `S` matching `filter`, ordered by reference.
    pub fn query<S, F>(&self, filter: F) -> Vec<(StateAndRef, S)>
    where
        S: ContractState,
        F: Fn(&StateEnvelope, &S) -> bool,
    {
        let mut found: Vec<(StateAndRef, S)> = self
            .unspent
            .iter()
            .filter(|entry| entry.value().is::<S>())
            .filter_map(|entry| {
                let state = entry.value().decode::<S>().ok()?;
                filter(entry.value(), &state)
                    .then(|| (StateAndRef::new(entry.value().clone(), *entry.key()), state))
            })
            .collect();
        found.sort_by(|a, b| a.0.state_ref.cmp(&b.0.state_ref));
        found
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }
}
