//! Fungible and unique tokens, and the contract that moves them.

use std::collections::BTreeMap;

use crossnotary_common::{AssetId, AssetRequest, TokenKind};
use crossnotary_crypto::{PublicKey, SignerPolicy};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Contract, ContractCommand, ContractState, ContractViolation, LedgerTransaction};

/// How much of a token a state holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenAmount {
    Fungible(Decimal),
    Unique(AssetId),
}

/// A holding of a token, owned by a signer policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    pub kind: TokenKind,
    pub amount: TokenAmount,
    pub holder: SignerPolicy,
    pub issuer: PublicKey,
}

impl ContractState for TokenState {
    const CONTRACT: &'static str = "crossnotary.token";
}

impl TokenState {
    pub fn fungible(kind: TokenKind, quantity: Decimal, holder: SignerPolicy, issuer: PublicKey) -> Self {
        Self {
            kind,
            amount: TokenAmount::Fungible(quantity),
            holder,
            issuer,
        }
    }

    pub fn unique(kind: TokenKind, asset_id: AssetId, holder: SignerPolicy, issuer: PublicKey) -> Self {
        Self {
            kind,
            amount: TokenAmount::Unique(asset_id),
            holder,
            issuer,
        }
    }

    /// Same token under a different holder.
    pub fn with_holder(&self, holder: SignerPolicy) -> Self {
        Self {
            holder,
            ..self.clone()
        }
    }

    pub fn quantity(&self) -> Option<Decimal> {
        match &self.amount {
            TokenAmount::Fungible(quantity) => Some(*quantity),
            TokenAmount::Unique(_) => None,
        }
    }

    pub fn asset_id(&self) -> Option<&AssetId> {
        match &self.amount {
            TokenAmount::Fungible(_) => None,
            TokenAmount::Unique(asset_id) => Some(asset_id),
        }
    }
}

/// Whether `states` amount to exactly the asset described by `request`.
pub fn delivers(request: &AssetRequest, states: &[TokenState]) -> bool {
    if states.iter().any(|state| state.kind != *request.kind()) {
        return false;
    }
    match request {
        AssetRequest::Fungible { amount, .. } => {
            let mut total = Decimal::ZERO;
            for state in states {
                match state.quantity() {
                    Some(quantity) => total += quantity,
                    None => return false,
                }
            }
            !states.is_empty() && total == *amount
        }
        AssetRequest::NonFungible { asset_id, .. } => {
            matches!(states, [only] if only.asset_id() == Some(asset_id))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenCommand {
    /// Create tokens; signed by their issuer.
    Issue,
    /// Change holders. Every unencumbered input's holder policy must be
    /// satisfied by the signers; encumbered inputs are authorized by the
    /// contract of their encumbrance.
    Move,
}

impl ContractCommand for TokenCommand {
    const CONTRACT: &'static str = "crossnotary.token";
}

/// Per-(kind, issuer) totals of a set of token states.
#[derive(Debug, Default, PartialEq, Eq)]
struct TokenTotals {
    fungible: BTreeMap<(TokenKind, PublicKey), Decimal>,
    unique: BTreeMap<(TokenKind, PublicKey), Vec<AssetId>>,
}

impl TokenTotals {
    fn of<'a>(states: impl IntoIterator<Item = &'a TokenState>) -> Self {
        let mut totals = TokenTotals::default();
        for state in states {
            let key = (state.kind.clone(), state.issuer);
            match &state.amount {
                TokenAmount::Fungible(quantity) => {
                    *totals.fungible.entry(key).or_insert(Decimal::ZERO) += *quantity;
                }
                TokenAmount::Unique(asset_id) => {
                    totals.unique.entry(key).or_default().push(asset_id.clone());
                }
            }
        }
        for ids in totals.unique.values_mut() {
            ids.sort();
        }
        totals
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenContract;

impl TokenContract {
    fn violation(reason: impl Into<String>) -> ContractViolation {
        ContractViolation::new(TokenState::CONTRACT, reason)
    }
}

impl Contract for TokenContract {
    fn name(&self) -> &'static str {
        TokenState::CONTRACT
    }

    fn verify(&self, tx: &LedgerTransaction) -> Result<(), ContractViolation> {
        let inputs = tx
            .inputs_of::<TokenState>()
            .map_err(|e| Self::violation(e.to_string()))?;
        let outputs = tx
            .outputs_of::<TokenState>()
            .map_err(|e| Self::violation(e.to_string()))?;
        let commands = tx
            .commands_of::<TokenCommand>()
            .map_err(|e| Self::violation(e.to_string()))?;

        let (command, signers) = match commands.as_slice() {
            [one] => one,
            [] => return Err(Self::violation("no token command")),
            _ => return Err(Self::violation("more than one token command")),
        };

        for (i, output) in &outputs {
            if let TokenAmount::Fungible(quantity) = output.amount {
                if quantity <= Decimal::ZERO {
                    return Err(Self::violation(format!(
                        "output {} has non-positive quantity {}",
                        i, quantity
                    )));
                }
            }
        }

        match command {
            TokenCommand::Issue => {
                if !inputs.is_empty() {
                    return Err(Self::violation("issue must not consume tokens"));
                }
                if outputs.is_empty() {
                    return Err(Self::violation("issue must create tokens"));
                }
                if let Some((i, _)) = outputs.iter().find(|(_, out)| !signers.contains(&out.issuer)) {
                    return Err(Self::violation(format!(
                        "output {} not signed by its issuer",
                        i
                    )));
                }
            }
            TokenCommand::Move => {
                if inputs.is_empty() {
                    return Err(Self::violation("move must consume tokens"));
                }
                if let Some((i, input)) = inputs.iter().find(|(i, input)| {
                    tx.inputs[*i].state.encumbrance.is_none()
                        && !input.holder.is_satisfied_by(signers.iter())
                }) {
                    return Err(Self::violation(format!(
                        "input {} holder {} not satisfied by move signers",
                        i, input.holder
                    )));
                }
                let consumed = TokenTotals::of(inputs.iter().map(|(_, state)| state));
                let produced = TokenTotals::of(outputs.iter().map(|(_, state)| state));
                if consumed != produced {
                    return Err(Self::violation("token totals not conserved"));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContractRegistry, StateEnvelope, TransactionBuilder};
    use crossnotary_common::NotaryId;
    use crossnotary_crypto::SigningKey;
    use std::sync::Arc;

    fn notary() -> NotaryId {
        NotaryId::new("NotaryA")
    }

    fn usd(quantity: i64, holder: &SigningKey, issuer: &SigningKey) -> TokenState {
        TokenState::fungible(
            TokenKind::new("USD"),
            Decimal::new(quantity, 0),
            SignerPolicy::single(holder.public_key()),
            issuer.public_key(),
        )
    }

    fn resolve_move(
        inputs: &[TokenState],
        outputs: &[TokenState],
        signers: Vec<PublicKey>,
    ) -> LedgerTransaction {
        let issued: Vec<StateEnvelope> = inputs
            .iter()
            .map(|state| StateEnvelope::new(state, notary()).unwrap())
            .collect();
        let mut builder = TransactionBuilder::new(notary());
        for state in outputs {
            builder.add_output_state(state, None).unwrap();
        }
        builder.add_command(&TokenCommand::Move, signers).unwrap();
        let mut wire = builder.to_wire_transaction();
        let source = crossnotary_crypto::SecureHash::of(b"issuance");
        wire.inputs = (0..issued.len() as u32)
            .map(|i| crate::StateRef::new(source, i))
            .collect();

        LedgerTransaction::resolve(&wire, |state_ref| issued.get(state_ref.index as usize).cloned())
            .unwrap()
    }

    fn registry() -> ContractRegistry {
        ContractRegistry::new().with(Arc::new(TokenContract))
    }

    #[test]
    fn test_move_conserves_value() {
        let (alice, bob, bank) = (SigningKey::generate(), SigningKey::generate(), SigningKey::generate());
        let tx = resolve_move(
            &[usd(100, &alice, &bank)],
            &[usd(60, &bob, &bank), usd(40, &alice, &bank)],
            vec![alice.public_key()],
        );
        assert!(registry().verify(&tx).is_ok());
    }

    #[test]
    fn test_move_cannot_create_value() {
        let (alice, bob, bank) = (SigningKey::generate(), SigningKey::generate(), SigningKey::generate());
        let tx = resolve_move(
            &[usd(100, &alice, &bank)],
            &[usd(101, &bob, &bank)],
            vec![alice.public_key()],
        );
        assert!(registry().verify(&tx).is_err());
    }

    #[test]
    fn test_move_requires_holder_signature() {
        let (alice, bob, bank) = (SigningKey::generate(), SigningKey::generate(), SigningKey::generate());
        let tx = resolve_move(
            &[usd(100, &alice, &bank)],
            &[usd(100, &bob, &bank)],
            vec![bob.public_key()],
        );
        let err = registry().verify(&tx).unwrap_err();
        assert!(err.to_string().contains("not satisfied"));
    }

    #[test]
    fn test_encumbered_input_defers_to_encumbrance() {
        let (alice, bob, bank) = (SigningKey::generate(), SigningKey::generate(), SigningKey::generate());
        let mut tx = resolve_move(
            &[usd(100, &alice, &bank)],
            &[usd(100, &bob, &bank)],
            vec![bob.public_key()],
        );
        assert!(TokenContract.verify(&tx).is_err());

        tx.inputs[0].state = tx.inputs[0].state.clone().encumbered_by(1);
        assert!(TokenContract.verify(&tx).is_ok());
    }

    #[test]
    fn test_move_preserves_unique_ids() {
        let (alice, bob, bank) = (SigningKey::generate(), SigningKey::generate(), SigningKey::generate());
        let art = |id: &str, holder: &SigningKey| {
            TokenState::unique(
                TokenKind::new("ART"),
                AssetId::new(id),
                SignerPolicy::single(holder.public_key()),
                bank.public_key(),
            )
        };
        let tx = resolve_move(&[art("a1", &alice)], &[art("a2", &bob)], vec![alice.public_key()]);
        assert!(registry().verify(&tx).is_err());

        let tx = resolve_move(&[art("a1", &alice)], &[art("a1", &bob)], vec![alice.public_key()]);
        assert!(registry().verify(&tx).is_ok());
    }

    #[test]
    fn test_delivers_exact_asset() {
        let (alice, bank) = (SigningKey::generate(), SigningKey::generate());
        let request = AssetRequest::fungible("USD", Decimal::new(100, 0));

        assert!(delivers(&request, &[usd(60, &alice, &bank), usd(40, &alice, &bank)]));
        assert!(!delivers(&request, &[usd(99, &alice, &bank)]));
        assert!(!delivers(&request, &[]));
        assert!(!delivers(
            &AssetRequest::non_fungible("USD", "x"),
            &[usd(100, &alice, &bank)]
        ));
    }
}
