//! On-ledger escrow lock and the contract that governs it.
//!
//! The seller's escrowed tokens are held by a 2-of-2 policy over seller and
//! buyer and encumbered by a [`LockState`] output of the same transaction.
//! The platform only lets an encumbered state be spent together with its
//! encumbrance, and token moves of encumbered inputs defer to the lock
//! contract, so every path out of escrow is one of the [`LockCommand`]s below:
//!
//! - `Release`: tokens go to the receiver, backed by the controlling
//!   notary's signature over the receiver's settlement transaction.
//! - `RegisterRevertIntent`: strictly after the deadline, the lock is re-issued
//!   in phase `RevertIntentRegistered`; the tokens stay escrowed.
//! - `Revert`: after the intent, tokens go back to the creator.

use std::collections::BTreeSet;

use crossnotary_common::{Party, Timestamp};
use crossnotary_crypto::{PublicKey, SecureHash, SignerPolicy};
use crossnotary_ledger::{
    Contract, ContractCommand, ContractState, ContractViolation, LedgerTransaction,
    SignatureMetadata, StateAndRef, StateEnvelope, StateRef, TokenState, TransactionSignature,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockPhase {
    /// Releasable with a settlement proof.
    Escrowed,
    /// Deadline passed and the seller announced the revert.
    RevertIntentRegistered,
}

/// Escrow lock: who may unlock the encumbered tokens, how, and until when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    /// Id of the buyer's draft transfer; the settlement must carry this id.
    pub draft_transfer_ref: SecureHash,
    /// Seller, who escrowed the tokens.
    pub creator: Party,
    /// Buyer, who receives the tokens on release.
    pub receiver: Party,
    /// Key of the buyer-domain notary whose signature proves settlement.
    pub controlling_notary: PublicKey,
    /// 2-of-2 policy over creator and receiver holding the tokens.
    pub holder_policy: SignerPolicy,
    /// Release window closes and revert becomes possible after this.
    pub deadline: Timestamp,
    /// Metadata the settlement proof must carry.
    pub proof_metadata: SignatureMetadata,
    pub phase: LockPhase,
}

impl ContractState for LockState {
    const CONTRACT: &'static str = "crossnotary.lock";
}

impl LockState {
    /// Same lock in another phase.
    pub fn with_phase(&self, phase: LockPhase) -> Self {
        Self {
            phase,
            ..self.clone()
        }
    }

    /// Whether the deadline has passed at `now`.
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now > self.deadline
    }

    /// Start of the time window a revert intent carries.
    pub fn revert_opens_at(&self) -> Timestamp {
        self.deadline + chrono::Duration::milliseconds(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockCommand {
    /// Create a lock and escrow tokens under it.
    Encumber,
    /// Unlock to the receiver with the controlling notary's proof.
    Release {
        proof: TransactionSignature,
        settlement_tx_id: SecureHash,
    },
    /// Announce the revert once the deadline has passed.
    RegisterRevertIntent,
    /// Return the tokens to the creator.
    Revert,
}

impl ContractCommand for LockCommand {
    const CONTRACT: &'static str = "crossnotary.lock";
}

impl LockCommand {
    pub fn name(&self) -> &'static str {
        match self {
            LockCommand::Encumber => "ENCUMBER",
            LockCommand::Release { .. } => "RELEASE",
            LockCommand::RegisterRevertIntent => "REGISTER_REVERT_INTENT",
            LockCommand::Revert => "REVERT",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LockContract;

type Verdict = std::result::Result<(), ContractViolation>;

fn violation(reason: impl Into<String>) -> ContractViolation {
    ContractViolation::new(LockState::CONTRACT, reason)
}

fn require(condition: bool, reason: impl FnOnce() -> String) -> Verdict {
    if condition {
        Ok(())
    } else {
        Err(violation(reason()))
    }
}

impl LockContract {
    fn single_lock_input(
        tx: &LedgerTransaction,
    ) -> std::result::Result<(StateRef, LockState), ContractViolation> {
        let locks: Vec<&StateAndRef> = tx
            .inputs
            .iter()
            .filter(|input| input.state.is::<LockState>())
            .collect();
        match locks.as_slice() {
            [only] => {
                let lock = only
                    .decode::<LockState>()
                    .map_err(|e| violation(e.to_string()))?;
                Ok((only.state_ref, lock))
            }
            [] => Err(violation("no lock consumed")),
            _ => Err(violation("more than one lock consumed")),
        }
    }

    /// Tokens encumbered by the consumed lock, in input order. Any other
    /// input is rejected.
    fn escrowed_inputs(
        tx: &LedgerTransaction,
        lock_ref: &StateRef,
    ) -> std::result::Result<Vec<TokenState>, ContractViolation> {
        let mut escrowed = Vec::new();
        for input in tx.inputs.iter().filter(|input| input.state_ref != *lock_ref) {
            let held = input.state_ref.tx_id == lock_ref.tx_id
                && input.state.encumbrance == Some(lock_ref.index);
            require(held, || {
                format!("input {} is not held by lock {}", input.state_ref, lock_ref)
            })?;
            escrowed.push(
                input
                    .decode::<TokenState>()
                    .map_err(|e| violation(e.to_string()))?,
            );
        }
        require(!escrowed.is_empty(), || "lock holds no tokens".to_string())?;
        Ok(escrowed)
    }

    /// The non-lock outputs are exactly `expected`, each with `encumbrance`.
    fn check_redirect(
        tx: &LedgerTransaction,
        expected: Vec<TokenState>,
        encumbrance: Option<u32>,
    ) -> Verdict {
        let outputs: Vec<&StateEnvelope> = tx
            .outputs
            .iter()
            .filter(|output| !output.is::<LockState>())
            .collect();
        require(outputs.len() == expected.len(), || {
            format!(
                "expected {} token outputs, found {}",
                expected.len(),
                outputs.len()
            )
        })?;

        for (i, (output, want)) in outputs.into_iter().zip(expected).enumerate() {
            let token = output
                .decode::<TokenState>()
                .map_err(|e| violation(e.to_string()))?;
            require(token == want, || {
                format!("token output {} does not match the escrowed token", i)
            })?;
            require(output.encumbrance == encumbrance, || {
                format!("token output {} has the wrong encumbrance", i)
            })?;
        }
        Ok(())
    }

    fn verify_encumber(tx: &LedgerTransaction, signers: &[PublicKey]) -> Verdict {
        require(
            !tx.inputs.iter().any(|input| input.state.is::<LockState>()),
            || "encumber must not consume a lock".to_string(),
        )?;
        let created = tx
            .outputs_of::<LockState>()
            .map_err(|e| violation(e.to_string()))?;
        let (index, lock) = match created.as_slice() {
            [(index, lock)] => (*index, lock),
            _ => return Err(violation("encumber must create exactly one lock")),
        };

        require(tx.outputs[index].encumbrance.is_none(), || {
            "lock must not itself be encumbered".to_string()
        })?;
        require(lock.phase == LockPhase::Escrowed, || {
            "new lock must be in phase ESCROWED".to_string()
        })?;
        require(lock.creator.key != lock.receiver.key, || {
            "creator and receiver must differ".to_string()
        })?;

        let policy = SignerPolicy::all_of([lock.creator.key, lock.receiver.key])
            .map_err(|e| violation(e.to_string()))?;
        require(lock.holder_policy == policy, || {
            "holder policy must be 2-of-2 over creator and receiver".to_string()
        })?;
        require(
            signers.contains(&lock.creator.key) && signers.contains(&lock.receiver.key),
            || "encumber must be signed by creator and receiver".to_string(),
        )?;

        let mut escrowed = 0;
        for (i, output) in tx.outputs.iter().enumerate() {
            if i == index {
                continue;
            }
            if output.encumbrance == Some(index as u32) {
                let token = output
                    .decode::<TokenState>()
                    .map_err(|_| violation(format!("output {} is encumbered but not a token", i)))?;
                require(token.holder == policy, || {
                    format!("escrowed output {} is not held by the escrow policy", i)
                })?;
                escrowed += 1;
            } else if let Ok(token) = output.decode::<TokenState>() {
                require(token.holder != policy, || {
                    format!("output {} is held by the escrow policy without the lock", i)
                })?;
            }
        }
        require(escrowed > 0, || "encumber must escrow at least one token".to_string())
    }

    fn verify_release(
        tx: &LedgerTransaction,
        signers: &[PublicKey],
        proof: &TransactionSignature,
        settlement_tx_id: &SecureHash,
    ) -> Verdict {
        let (lock_ref, lock) = Self::single_lock_input(tx)?;
        require(tx.outputs_of::<LockState>().map_or(false, |o| o.is_empty()), || {
            "release must not create a lock".to_string()
        })?;
        require(lock.phase == LockPhase::Escrowed, || {
            "release requires phase ESCROWED".to_string()
        })?;
        require(proof.by == lock.controlling_notary, || {
            format!(
                "proof signed by {}, expected controlling notary {}",
                proof.by.key_id(),
                lock.controlling_notary.key_id()
            )
        })?;
        require(proof.metadata == lock.proof_metadata, || {
            format!(
                "proof metadata {} differs from expected {}",
                proof.metadata, lock.proof_metadata
            )
        })?;
        require(*settlement_tx_id == lock.draft_transfer_ref, || {
            format!(
                "settlement {} is not the agreed draft {}",
                settlement_tx_id.short(),
                lock.draft_transfer_ref.short()
            )
        })?;
        proof
            .verify(settlement_tx_id)
            .map_err(|_| violation("proof does not verify over the settlement id"))?;
        require(signers.contains(&lock.receiver.key), || {
            "release must be signed by the receiver".to_string()
        })?;

        let to_receiver = SignerPolicy::single(lock.receiver.key);
        let expected = Self::escrowed_inputs(tx, &lock_ref)?
            .iter()
            .map(|token| token.with_holder(to_receiver.clone()))
            .collect();
        Self::check_redirect(tx, expected, None)
    }

    fn verify_revert_intent(tx: &LedgerTransaction, signers: &[PublicKey]) -> Verdict {
        let (lock_ref, lock) = Self::single_lock_input(tx)?;
        require(lock.phase == LockPhase::Escrowed, || {
            "revert intent already registered".to_string()
        })?;

        let starts_after_deadline = tx
            .time_window
            .and_then(|window| window.from)
            .map_or(false, |from| from > lock.deadline);
        require(starts_after_deadline, || {
            format!(
                "time window must start after the deadline {}",
                lock.deadline.to_rfc3339()
            )
        })?;

        let reissued = tx
            .outputs_of::<LockState>()
            .map_err(|e| violation(e.to_string()))?;
        let (index, next) = match reissued.as_slice() {
            [(index, next)] => (*index, next),
            _ => return Err(violation("revert intent must re-issue exactly one lock")),
        };
        require(
            *next == lock.with_phase(LockPhase::RevertIntentRegistered),
            || "re-issued lock may only change its phase".to_string(),
        )?;
        require(tx.outputs[index].encumbrance.is_none(), || {
            "lock must not itself be encumbered".to_string()
        })?;
        require(signers.contains(&lock.receiver.key), || {
            "revert intent must be signed by the receiver".to_string()
        })?;

        let expected = Self::escrowed_inputs(tx, &lock_ref)?;
        Self::check_redirect(tx, expected, Some(index as u32))
    }

    fn verify_revert(tx: &LedgerTransaction, signers: &[PublicKey]) -> Verdict {
        let (lock_ref, lock) = Self::single_lock_input(tx)?;
        require(tx.outputs_of::<LockState>().map_or(false, |o| o.is_empty()), || {
            "revert must not create a lock".to_string()
        })?;
        require(lock.phase == LockPhase::RevertIntentRegistered, || {
            "revert requires a registered revert intent".to_string()
        })?;

        let distinct: BTreeSet<&PublicKey> = signers.iter().collect();
        require(
            distinct.len() == 1 && distinct.contains(&lock.receiver.key),
            || "revert must be signed by exactly the receiver".to_string(),
        )?;

        let to_creator = SignerPolicy::single(lock.creator.key);
        let expected = Self::escrowed_inputs(tx, &lock_ref)?
            .iter()
            .map(|token| token.with_holder(to_creator.clone()))
            .collect();
        Self::check_redirect(tx, expected, None)
    }
}

impl Contract for LockContract {
    fn name(&self) -> &'static str {
        LockState::CONTRACT
    }

    fn verify(&self, tx: &LedgerTransaction) -> Verdict {
        let commands = tx
            .commands_of::<LockCommand>()
            .map_err(|e| violation(e.to_string()))?;

        let (command, signers) = match commands.as_slice() {
            [one] => one,
            [] => return Err(violation("no lock command")),
            _ => return Err(violation("more than one lock command")),
        };

        match command {
            LockCommand::Encumber => Self::verify_encumber(tx, signers),
            LockCommand::Release {
                proof,
                settlement_tx_id,
            } => Self::verify_release(tx, signers, proof, settlement_tx_id),
            LockCommand::RegisterRevertIntent => Self::verify_revert_intent(tx, signers),
            LockCommand::Revert => Self::verify_revert(tx, signers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use crossnotary_common::{AssetId, NotaryId, TimeWindow, TokenKind};
    use crossnotary_crypto::SigningKey;
    use crossnotary_ledger::{
        ContractRegistry, TokenCommand, TokenContract, TransactionBuilder, WireTransaction,
    };

    struct Fixture {
        seller: SigningKey,
        buyer: SigningKey,
        buyer_notary: SigningKey,
        issuer: SigningKey,
        lock: LockState,
        escrow: WireTransaction,
    }

    fn seller_notary() -> NotaryId {
        NotaryId::new("NotaryB")
    }

    fn art(holder: SignerPolicy, issuer: &SigningKey) -> TokenState {
        TokenState::unique(
            TokenKind::new("ART"),
            AssetId::new("sunflowers"),
            holder,
            issuer.public_key(),
        )
    }

    fn registry() -> ContractRegistry {
        ContractRegistry::new()
            .with(Arc::new(TokenContract))
            .with(Arc::new(LockContract))
    }

    fn fixture() -> Fixture {
        let (seller, buyer) = (SigningKey::generate(), SigningKey::generate());
        let (buyer_notary, issuer) = (SigningKey::generate(), SigningKey::generate());
        let policy = SignerPolicy::all_of([seller.public_key(), buyer.public_key()]).unwrap();

        let lock = LockState {
            draft_transfer_ref: SecureHash::of(b"draft"),
            creator: Party::new("bob", seller.public_key()),
            receiver: Party::new("alice", buyer.public_key()),
            controlling_notary: buyer_notary.public_key(),
            holder_policy: policy.clone(),
            deadline: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            proof_metadata: SignatureMetadata::default(),
            phase: LockPhase::Escrowed,
        };

        let mut builder = TransactionBuilder::new(seller_notary());
        let index = builder.add_output_state(&lock, None).unwrap();
        builder.add_output_state(&art(policy, &issuer), Some(index)).unwrap();
        builder
            .add_command(&LockCommand::Encumber, [seller.public_key(), buyer.public_key()])
            .unwrap();
        builder
            .add_command(&TokenCommand::Move, [seller.public_key()])
            .unwrap();
        let mut escrow = builder.to_wire_transaction();
        escrow.inputs = vec![StateRef::new(SecureHash::of(b"issuance"), 0)];

        Fixture {
            seller,
            buyer,
            buyer_notary,
            issuer,
            lock,
            escrow,
        }
    }

    impl Fixture {
        fn resolve_escrow(&self) -> LedgerTransaction {
            let issued = StateEnvelope::new(
                &art(SignerPolicy::single(self.seller.public_key()), &self.issuer),
                seller_notary(),
            )
            .unwrap();
            LedgerTransaction::resolve(&self.escrow, |_| Some(issued.clone())).unwrap()
        }

        /// Spend every output of `source` with `command`, adding `outputs`.
        fn spend(
            &self,
            source: &WireTransaction,
            command: LockCommand,
            signers: Vec<PublicKey>,
            window: Option<TimeWindow>,
            outputs: impl FnOnce(&mut TransactionBuilder),
        ) -> LedgerTransaction {
            let consumed = source.out_refs();
            let mut builder = TransactionBuilder::new(seller_notary());
            for state in &consumed {
                builder.add_input(state);
            }
            outputs(&mut builder);
            builder.add_command(&command, signers.clone()).unwrap();
            builder.add_command(&TokenCommand::Move, signers).unwrap();
            if let Some(window) = window {
                builder.set_time_window(window);
            }
            let wire = builder.to_wire_transaction();
            LedgerTransaction::resolve(&wire, |state_ref| {
                consumed
                    .iter()
                    .find(|state| state.state_ref == *state_ref)
                    .map(|state| state.state.clone())
            })
            .unwrap()
        }

        fn release(&self, proof: TransactionSignature, to: PublicKey) -> LedgerTransaction {
            let token = art(SignerPolicy::single(to), &self.issuer);
            self.spend(
                &self.escrow,
                LockCommand::Release {
                    proof,
                    settlement_tx_id: self.lock.draft_transfer_ref,
                },
                vec![self.buyer.public_key()],
                None,
                |builder| {
                    builder.add_output_state(&token, None).unwrap();
                },
            )
        }

        fn proof(&self, metadata: SignatureMetadata) -> TransactionSignature {
            TransactionSignature::sign(&self.buyer_notary, &self.lock.draft_transfer_ref, metadata)
        }

        fn intent_wire(&self, from: chrono::DateTime<Utc>) -> (WireTransaction, LedgerTransaction) {
            let reissued = self.lock.with_phase(LockPhase::RevertIntentRegistered);
            let token = art(self.lock.holder_policy.clone(), &self.issuer);
            let ltx = self.spend(
                &self.escrow,
                LockCommand::RegisterRevertIntent,
                vec![self.seller.public_key(), self.buyer.public_key()],
                Some(TimeWindow::from_only(from)),
                |builder| {
                    let index = builder.add_output_state(&reissued, None).unwrap();
                    builder.add_output_state(&token, Some(index)).unwrap();
                },
            );
            let wire = WireTransaction {
                inputs: ltx.inputs.iter().map(|input| input.state_ref).collect(),
                outputs: ltx.outputs.clone(),
                commands: ltx.commands.clone(),
                notary: ltx.notary.clone(),
                time_window: ltx.time_window,
                salt: SecureHash::of(b"intent"),
            };
            (wire, ltx)
        }
    }

    #[test]
    fn test_encumber_escrows_under_dual_control() {
        let f = fixture();
        assert!(registry().verify(&f.resolve_escrow()).is_ok());
    }

    #[test]
    fn test_encumber_requires_receiver_signature() {
        let mut f = fixture();
        f.escrow.commands[0].signers = vec![f.seller.public_key()];
        let err = registry().verify(&f.resolve_escrow()).unwrap_err();
        assert!(err.to_string().contains("creator and receiver"));
    }

    #[test]
    fn test_release_with_notary_proof() {
        let f = fixture();
        let tx = f.release(f.proof(SignatureMetadata::default()), f.buyer.public_key());
        assert!(registry().verify(&tx).is_ok());
    }

    #[test]
    fn test_release_rejects_wrong_metadata() {
        let f = fixture();
        let mut metadata = SignatureMetadata::default();
        metadata.platform_version += 1;

        let tx = f.release(f.proof(metadata), f.buyer.public_key());
        let err = registry().verify(&tx).unwrap_err();
        assert!(err.to_string().contains("metadata"));
    }

    #[test]
    fn test_release_rejects_foreign_signer() {
        let f = fixture();
        let forged = TransactionSignature::sign(
            &f.buyer,
            &f.lock.draft_transfer_ref,
            SignatureMetadata::default(),
        );
        let tx = f.release(forged, f.buyer.public_key());
        assert!(registry().verify(&tx).is_err());
    }

    #[test]
    fn test_release_must_pay_the_receiver() {
        let f = fixture();
        let outsider = SigningKey::generate().public_key();
        let tx = f.release(f.proof(SignatureMetadata::default()), outsider);
        let err = registry().verify(&tx).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_revert_intent_respects_deadline() {
        let f = fixture();

        let (_, early) = f.intent_wire(f.lock.deadline - Duration::seconds(1));
        let err = registry().verify(&early).unwrap_err();
        assert!(err.to_string().contains("deadline"));

        let (_, at_deadline) = f.intent_wire(f.lock.deadline);
        let err = registry().verify(&at_deadline).unwrap_err();
        assert!(err.to_string().contains("after the deadline"));

        let (_, on_time) = f.intent_wire(f.lock.revert_opens_at());
        assert!(registry().verify(&on_time).is_ok());
    }

    #[test]
    fn test_revert_requires_intent_and_receiver() {
        let f = fixture();
        let to_seller = art(SignerPolicy::single(f.seller.public_key()), &f.issuer);

        let without_intent = f.spend(
            &f.escrow,
            LockCommand::Revert,
            vec![f.buyer.public_key()],
            None,
            |builder| {
                builder.add_output_state(&to_seller, None).unwrap();
            },
        );
        let err = registry().verify(&without_intent).unwrap_err();
        assert!(err.to_string().contains("revert intent"));

        let (intent, _) = f.intent_wire(f.lock.revert_opens_at());
        let by_creator = f.spend(
            &intent,
            LockCommand::Revert,
            vec![f.seller.public_key()],
            None,
            |builder| {
                builder.add_output_state(&to_seller, None).unwrap();
            },
        );
        assert!(registry().verify(&by_creator).is_err());

        let by_receiver = f.spend(
            &intent,
            LockCommand::Revert,
            vec![f.buyer.public_key()],
            None,
            |builder| {
                builder.add_output_state(&to_seller, None).unwrap();
            },
        );
        assert!(registry().verify(&by_receiver).is_ok());
    }

    #[test]
    fn test_release_after_intent_rejected() {
        let f = fixture();
        let (intent, _) = f.intent_wire(f.lock.revert_opens_at());
        let token = art(SignerPolicy::single(f.buyer.public_key()), &f.issuer);

        let tx = f.spend(
            &intent,
            LockCommand::Release {
                proof: f.proof(SignatureMetadata::default()),
                settlement_tx_id: f.lock.draft_transfer_ref,
            },
            vec![f.buyer.public_key()],
            None,
            |builder| {
                builder.add_output_state(&token, None).unwrap();
            },
        );
        let err = registry().verify(&tx).unwrap_err();
        assert!(err.to_string().contains("ESCROWED"));
    }
}
