//! Wire transactions, their content-addressed ids, and signatures.

use std::collections::BTreeSet;
use std::fmt;

use crossnotary_common::{NotaryId, TimeWindow};
use crossnotary_crypto::{PublicKey, SecureHash, Signature, SigningKey};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{ContractState, LedgerError, Result, StateAndRef, StateEnvelope, StateRef};

/// Platform version stamped into signature metadata.
pub const PLATFORM_VERSION: u32 = 4;

/// A typed command payload governed by a named contract.
pub trait ContractCommand: Serialize + DeserializeOwned {
    const CONTRACT: &'static str;
}

/// A command with the keys that must sign for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub contract: String,
    pub data: serde_json::Value,
    pub signers: Vec<PublicKey>,
}

impl CommandEnvelope {
    pub fn new<C: ContractCommand>(
        command: &C,
        signers: impl IntoIterator<Item = PublicKey>,
    ) -> Result<Self> {
        Ok(Self {
            contract: C::CONTRACT.to_string(),
            data: serde_json::to_value(command)?,
            signers: signers.into_iter().collect(),
        })
    }

    pub fn is<C: ContractCommand>(&self) -> bool {
        self.contract == C::CONTRACT
    }

    pub fn decode<C: ContractCommand>(&self) -> Result<C> {
        if !self.is::<C>() {
            return Err(LedgerError::Malformed(format!(
                "command belongs to {}, not {}",
                self.contract,
                C::CONTRACT
            )));
        }
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// An unsigned transaction.
///
/// The id is SHA-256 over the hashes of the component groups (inputs,
/// outputs, commands, notary, time window, salt), so any change to any
/// component changes the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireTransaction {
    pub inputs: Vec<StateRef>,
    pub outputs: Vec<StateEnvelope>,
    pub commands: Vec<CommandEnvelope>,
    pub notary: Option<NotaryId>,
    pub time_window: Option<TimeWindow>,
    pub salt: SecureHash,
}

fn group_hash<T: Serialize>(group: &T) -> SecureHash {
    SecureHash::of(&serde_json::to_vec(group).unwrap_or_default())
}

impl WireTransaction {
    /// Recompute the content-addressed id.
    pub fn id(&self) -> SecureHash {
        SecureHash::concat(&[
            group_hash(&self.inputs),
            group_hash(&self.outputs),
            group_hash(&self.commands),
            group_hash(&self.notary),
            group_hash(&self.time_window),
            self.salt,
        ])
    }

    /// Union of the signers of every command.
    pub fn required_signers(&self) -> BTreeSet<PublicKey> {
        self.commands
            .iter()
            .flat_map(|command| command.signers.iter().copied())
            .collect()
    }

    /// Reference to output `index` once committed.
    pub fn out_ref(&self, index: u32) -> StateRef {
        StateRef::new(self.id(), index)
    }

    /// Outputs paired with their future references.
    pub fn out_refs(&self) -> Vec<StateAndRef> {
        let id = self.id();
        self.outputs
            .iter()
            .enumerate()
            .map(|(index, state)| StateAndRef::new(state.clone(), StateRef::new(id, index as u32)))
            .collect()
    }

    /// Outputs of type `S` with their positions.
    pub fn outputs_of<S: ContractState>(&self) -> Result<Vec<(u32, S)>> {
        self.outputs
            .iter()
            .enumerate()
            .filter(|(_, state)| state.is::<S>())
            .map(|(index, state)| Ok((index as u32, state.decode::<S>()?)))
            .collect()
    }

    /// Commands of type `C` with their signers.
    pub fn commands_of<C: ContractCommand>(&self) -> Result<Vec<(C, Vec<PublicKey>)>> {
        self.commands
            .iter()
            .filter(|command| command.is::<C>())
            .map(|command| Ok((command.decode::<C>()?, command.signers.clone())))
            .collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Assembles a [`WireTransaction`].
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    inputs: Vec<StateRef>,
    outputs: Vec<StateEnvelope>,
    commands: Vec<CommandEnvelope>,
    notary: Option<NotaryId>,
    time_window: Option<TimeWindow>,
}

impl TransactionBuilder {
    pub fn new(notary: NotaryId) -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            commands: Vec::new(),
            notary: Some(notary),
            time_window: None,
        }
    }

    pub fn notary(&self) -> Option<&NotaryId> {
        self.notary.as_ref()
    }

    pub fn add_input(&mut self, state: &StateAndRef) -> &mut Self {
        self.inputs.push(state.state_ref);
        self
    }

    /// Add an output, returning its index.
    pub fn add_output(&mut self, state: StateEnvelope) -> u32 {
        self.outputs.push(state);
        (self.outputs.len() - 1) as u32
    }

    /// Add a typed output under this builder's notary, returning its index.
    pub fn add_output_state<S: ContractState>(
        &mut self,
        state: &S,
        encumbrance: Option<u32>,
    ) -> Result<u32> {
        let notary = self
            .notary
            .clone()
            .ok_or_else(|| LedgerError::Malformed("builder has no notary".to_string()))?;
        let mut envelope = StateEnvelope::new(state, notary)?;
        envelope.encumbrance = encumbrance;
        Ok(self.add_output(envelope))
    }

    pub fn add_command<C: ContractCommand>(
        &mut self,
        command: &C,
        signers: impl IntoIterator<Item = PublicKey>,
    ) -> Result<&mut Self> {
        self.commands.push(CommandEnvelope::new(command, signers)?);
        Ok(self)
    }

    pub fn set_time_window(&mut self, window: TimeWindow) -> &mut Self {
        self.time_window = Some(window);
        self
    }

    pub fn output_count(&self) -> u32 {
        self.outputs.len() as u32
    }

    /// Freeze into a wire transaction with a fresh salt.
    pub fn to_wire_transaction(&self) -> WireTransaction {
        let mut salt = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);
        WireTransaction {
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            commands: self.commands.clone(),
            notary: self.notary.clone(),
            time_window: self.time_window,
            salt: SecureHash::from_bytes(salt),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignatureScheme {
    Ed25519,
}

/// What a signature claims about how it was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignatureMetadata {
    pub platform_version: u32,
    pub scheme: SignatureScheme,
}

impl Default for SignatureMetadata {
    fn default() -> Self {
        Self {
            platform_version: PLATFORM_VERSION,
            scheme: SignatureScheme::Ed25519,
        }
    }
}

impl fmt::Display for SignatureMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/v{}", self.scheme, self.platform_version)
    }
}

/// A signature over `tx_id || metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSignature {
    pub by: PublicKey,
    pub bytes: Signature,
    pub metadata: SignatureMetadata,
}

impl TransactionSignature {
    fn signable(tx_id: &SecureHash, metadata: &SignatureMetadata) -> Vec<u8> {
        let mut data = tx_id.as_bytes().to_vec();
        data.extend_from_slice(&serde_json::to_vec(metadata).unwrap_or_default());
        data
    }

    pub fn sign(key: &SigningKey, tx_id: &SecureHash, metadata: SignatureMetadata) -> Self {
        Self {
            by: key.public_key(),
            bytes: key.sign(&Self::signable(tx_id, &metadata)),
            metadata,
        }
    }

    /// Check this signature covers `tx_id`.
    pub fn verify(&self, tx_id: &SecureHash) -> Result<()> {
        self.by
            .verify(&Self::signable(tx_id, &self.metadata), &self.bytes)
            .map_err(|_| LedgerError::InvalidSignature(self.by.key_id()))
    }
}

/// A wire transaction with the signatures collected so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub tx: WireTransaction,
    pub sigs: Vec<TransactionSignature>,
}

impl SignedTransaction {
    pub fn new(tx: WireTransaction) -> Self {
        Self {
            tx,
            sigs: Vec::new(),
        }
    }

    pub fn id(&self) -> SecureHash {
        self.tx.id()
    }

    /// Sign with `key` and attach the signature.
    pub fn sign(mut self, key: &SigningKey, metadata: SignatureMetadata) -> Self {
        let sig = TransactionSignature::sign(key, &self.id(), metadata);
        self.add_signature(sig);
        self
    }

    /// Attach a signature, replacing any previous one by the same key.
    pub fn add_signature(&mut self, sig: TransactionSignature) {
        self.sigs.retain(|existing| existing.by != sig.by);
        self.sigs.push(sig);
    }

    pub fn signature_by(&self, key: &PublicKey) -> Option<&TransactionSignature> {
        self.sigs.iter().find(|sig| sig.by == *key)
    }

    /// Keys that have signed.
    pub fn signers(&self) -> BTreeSet<PublicKey> {
        self.sigs.iter().map(|sig| sig.by).collect()
    }

    /// Every attached signature must cover the recomputed id.
    pub fn verify_attached(&self) -> Result<()> {
        let id = self.id();
        for sig in &self.sigs {
            sig.verify(&id)?;
        }
        Ok(())
    }

    /// Required signers without a signature, ignoring `allowed`.
    pub fn missing_signers(&self, allowed: &[PublicKey]) -> BTreeSet<PublicKey> {
        let present = self.signers();
        self.tx
            .required_signers()
            .into_iter()
            .filter(|key| !present.contains(key) && !allowed.contains(key))
            .collect()
    }

    /// Verify attached signatures and that all required signers, except
    /// `allowed`, have signed.
    pub fn verify_signatures_except(&self, allowed: &[PublicKey]) -> Result<()> {
        self.verify_attached()?;
        let missing = self.missing_signers(allowed);
        if !missing.is_empty() {
            return Err(LedgerError::MissingSignatures(
                missing.iter().map(|key| key.key_id()).collect(),
            ));
        }
        Ok(())
    }

    pub fn verify_required_signatures(&self) -> Result<()> {
        self.verify_signatures_except(&[])
    }
}
