//! Ledger states and references to them.

use std::fmt;

use crossnotary_common::NotaryId;
use crossnotary_crypto::SecureHash;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{LedgerError, Result};

/// A typed state payload governed by a named contract.
pub trait ContractState: Serialize + DeserializeOwned {
    /// Name of the contract that verifies transactions touching this state.
    const CONTRACT: &'static str;
}

/// Pointer to an output of a committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateRef {
    pub tx_id: SecureHash,
    pub index: u32,
}

impl StateRef {
    pub fn new(tx_id: SecureHash, index: u32) -> Self {
        Self { tx_id, index }
    }
}

impl fmt::Display for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.tx_id.short(), self.index)
    }
}

/// A state as it sits on the ledger.
///
/// `encumbrance` is the output index, within the same transaction, of a
/// state that must be consumed together with this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEnvelope {
    pub contract: String,
    pub data: serde_json::Value,
    pub notary: NotaryId,
    pub encumbrance: Option<u32>,
}

impl StateEnvelope {
    /// Wrap a typed state for `notary`.
    pub fn new<S: ContractState>(state: &S, notary: NotaryId) -> Result<Self> {
        Ok(Self {
            contract: S::CONTRACT.to_string(),
            data: serde_json::to_value(state)?,
            notary,
            encumbrance: None,
        })
    }

    /// Encumber this state by the output at `index`.
    pub fn encumbered_by(mut self, index: u32) -> Self {
        self.encumbrance = Some(index);
        self
    }

    /// Drop any encumbrance.
    pub fn unencumbered(mut self) -> Self {
        self.encumbrance = None;
        self
    }

    /// Whether the payload belongs to `S`'s contract.
    pub fn is<S: ContractState>(&self) -> bool {
        self.contract == S::CONTRACT
    }

    /// Decode the payload as `S`.
    pub fn decode<S: ContractState>(&self) -> Result<S> {
        if !self.is::<S>() {
            return Err(LedgerError::Malformed(format!(
                "state belongs to {}, not {}",
                self.contract,
                S::CONTRACT
            )));
        }
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// A resolved state together with its reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateAndRef {
    pub state: StateEnvelope,
    pub state_ref: StateRef,
}

impl StateAndRef {
    pub fn new(state: StateEnvelope, state_ref: StateRef) -> Self {
        Self { state, state_ref }
    }

    pub fn decode<S: ContractState>(&self) -> Result<S> {
        self.state.decode()
    }
}
