//! Contract verification over resolved transactions.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crossnotary_common::{NotaryId, TimeWindow};
use crossnotary_crypto::{PublicKey, SecureHash};
use thiserror::Error;

use crate::{
    CommandEnvelope, ContractCommand, ContractState, LedgerError, Result, StateAndRef,
    StateEnvelope, StateRef, WireTransaction,
};

/// A contract rule that a transaction broke.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{contract}: {reason}")]
pub struct ContractViolation {
    pub contract: String,
    pub reason: String,
}

impl ContractViolation {
    pub fn new(contract: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            contract: contract.into(),
            reason: reason.into(),
        }
    }
}

/// A wire transaction with its inputs resolved to the states they point at.
#[derive(Debug, Clone)]
pub struct LedgerTransaction {
    pub id: SecureHash,
    pub inputs: Vec<StateAndRef>,
    pub outputs: Vec<StateEnvelope>,
    pub commands: Vec<CommandEnvelope>,
    pub notary: Option<NotaryId>,
    pub time_window: Option<TimeWindow>,
}

impl LedgerTransaction {
    /// Resolve `tx`'s inputs through `lookup`.
    pub fn resolve<F>(tx: &WireTransaction, lookup: F) -> Result<Self>
    where
        F: Fn(&StateRef) -> Option<StateEnvelope>,
    {
        let inputs = tx
            .inputs
            .iter()
            .map(|state_ref| {
                lookup(state_ref)
                    .map(|state| StateAndRef::new(state, *state_ref))
                    .ok_or(LedgerError::UnknownState(*state_ref))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id: tx.id(),
            inputs,
            outputs: tx.outputs.clone(),
            commands: tx.commands.clone(),
            notary: tx.notary.clone(),
            time_window: tx.time_window,
        })
    }

    /// Inputs of type `S`, with their position among the inputs.
    pub fn inputs_of<S: ContractState>(&self) -> Result<Vec<(usize, S)>> {
        self.inputs
            .iter()
            .enumerate()
            .filter(|(_, input)| input.state.is::<S>())
            .map(|(i, input)| Ok((i, input.decode::<S>()?)))
            .collect()
    }

    /// Outputs of type `S`, with their output index.
    pub fn outputs_of<S: ContractState>(&self) -> Result<Vec<(usize, S)>> {
        self.outputs
            .iter()
            .enumerate()
            .filter(|(_, output)| output.is::<S>())
            .map(|(i, output)| Ok((i, output.decode::<S>()?)))
            .collect()
    }

    pub fn commands_of<C: ContractCommand>(&self) -> Result<Vec<(C, Vec<PublicKey>)>> {
        self.commands
            .iter()
            .filter(|command| command.is::<C>())
            .map(|command| Ok((command.decode::<C>()?, command.signers.clone())))
            .collect()
    }

    /// Union of every command's signers.
    pub fn signers(&self) -> BTreeSet<PublicKey> {
        self.commands
            .iter()
            .flat_map(|command| command.signers.iter().copied())
            .collect()
    }

    /// Contract names touched by the transaction.
    pub fn contracts(&self) -> BTreeSet<String> {
        self.inputs
            .iter()
            .map(|input| input.state.contract.clone())
            .chain(self.outputs.iter().map(|output| output.contract.clone()))
            .chain(self.commands.iter().map(|command| command.contract.clone()))
            .collect()
    }

    /// States stay with the transaction's notary.
    pub fn check_notary(&self) -> Result<()> {
        let notary = match &self.notary {
            Some(notary) => notary,
            None if self.inputs.is_empty() && self.outputs.is_empty() => return Ok(()),
            None => {
                return Err(LedgerError::Malformed(
                    "transaction with states has no notary".to_string(),
                ))
            }
        };

        let foreign = self
            .inputs
            .iter()
            .map(|input| &input.state.notary)
            .chain(self.outputs.iter().map(|output| &output.notary))
            .find(|state_notary| *state_notary != notary);

        match foreign {
            Some(other) => Err(LedgerError::WrongNotary {
                expected: notary.clone(),
                actual: Some(other.clone()),
            }),
            None => Ok(()),
        }
    }

    /// An encumbered input may only be consumed together with its
    /// encumbrance; output encumbrances must point at another output.
    pub fn check_encumbrances(&self) -> Result<()> {
        let consumed: BTreeSet<StateRef> = self.inputs.iter().map(|input| input.state_ref).collect();

        for input in &self.inputs {
            if let Some(index) = input.state.encumbrance {
                let encumbrance = StateRef::new(input.state_ref.tx_id, index);
                if !consumed.contains(&encumbrance) {
                    return Err(LedgerError::Encumbrance(format!(
                        "input {} is encumbered by {} which is not consumed",
                        input.state_ref, encumbrance
                    )));
                }
            }
        }

        for (i, output) in self.outputs.iter().enumerate() {
            if let Some(index) = output.encumbrance {
                if index as usize >= self.outputs.len() || index as usize == i {
                    return Err(LedgerError::Encumbrance(format!(
                        "output {} has invalid encumbrance index {}",
                        i, index
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Rules governing states of one contract.
pub trait Contract: Send + Sync {
    fn name(&self) -> &'static str;

    fn verify(&self, tx: &LedgerTransaction) -> std::result::Result<(), ContractViolation>;
}

/// Contracts known to a deployment, looked up by name.
#[derive(Clone, Default)]
pub struct ContractRegistry {
    contracts: HashMap<&'static str, Arc<dyn Contract>>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, contract: Arc<dyn Contract>) -> Self {
        self.register(contract);
        self
    }

    pub fn register(&mut self, contract: Arc<dyn Contract>) {
        self.contracts.insert(contract.name(), contract);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.contracts.contains_key(name)
    }

    /// Platform checks, then every contract the transaction touches.
    pub fn verify(&self, tx: &LedgerTransaction) -> Result<()> {
        tx.check_notary()?;
        tx.check_encumbrances()?;

        for name in tx.contracts() {
            let contract = self
                .contracts
                .get(name.as_str())
                .ok_or_else(|| LedgerError::UnknownContract(name.clone()))?;
            contract.verify(tx)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ContractRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.contracts.keys().collect();
        names.sort();
        f.debug_struct("ContractRegistry").field("contracts", &names).finish()
    }
}
