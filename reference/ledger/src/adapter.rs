//! Asset ledger adapter: transfer construction and holdings queries.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use crossnotary_common::{AssetId, AssetRequest, NotaryId, TokenKind};
use crossnotary_crypto::{PublicKey, SecureHash, SignerPolicy, SigningKey};
use rust_decimal::Decimal;
use tracing::{info, instrument};

use crate::{
    LedgerError, Notary, Result, SignatureMetadata, SignedTransaction, StateAndRef, TokenCommand, TokenState, TransactionBuilder, TransactionSignature,
};

/// The pieces of a token transfer, ready to be placed into a transaction.
///
/// The first `recipient_outputs` outputs go to the recipient; the rest are
/// change back to the sender.
#[derive(Debug, Clone)]
pub struct TransferFragment {
    pub notary: NotaryId,
    pub inputs: Vec<StateAndRef>,
    pub outputs: Vec<TokenState>,
    pub recipient_outputs: usize,
    pub signers: Vec<PublicKey>,
}

impl TransferFragment {
    /// Add the transfer and its Move command to `builder`. Recipient outputs
    /// are encumbered by `encumbrance` when given. Returns their indices.
    pub fn apply(
        &self,
        builder: &mut TransactionBuilder,
        encumbrance: Option<u32>,
    ) -> Result<Vec<u32>> {
        for input in &self.inputs {
            builder.add_input(input);
        }
        let mut recipient = Vec::with_capacity(self.recipient_outputs);
        for (i, output) in self.outputs.iter().enumerate() {
            if i < self.recipient_outputs {
                recipient.push(builder.add_output_state(output, encumbrance)?);
            } else {
                builder.add_output_state(output, None)?;
            }
        }
        builder.add_command(&TokenCommand::Move, self.signers.iter().copied())?;
        Ok(recipient)
    }
}

/// Operations the swap needs from a ledger domain.
#[async_trait]
pub trait AssetLedger: Send + Sync {
    /// Notary of this domain.
    fn notary_id(&self) -> NotaryId;

    /// Build a transfer of `asset` from `from`'s unencumbered holdings to `to`.
    async fn construct_transfer(
        &self,
        asset: &AssetRequest,
        from: &PublicKey,
        to: &SignerPolicy,
    ) -> Result<TransferFragment>;

    /// Unencumbered holdings of `kind` held solely by `holder`.
    async fn owned_assets(&self, holder: &PublicKey, kind: &TokenKind) -> Result<Vec<StateAndRef>>;

    /// Total fungible quantity of `kind` held solely by `holder`.
    async fn balance(&self, holder: &PublicKey, kind: &TokenKind) -> Result<Decimal>;

    /// Current holder of a unique asset, if it exists unspent.
    async fn holder_of(&self, kind: &TokenKind, asset_id: &AssetId) -> Result<Option<SignerPolicy>>;

    /// A committed transaction.
    async fn transaction(&self, id: &SecureHash) -> Result<SignedTransaction>;

    /// Submit `stx` to the domain's notary.
    async fn commit(&self, stx: &SignedTransaction) -> Result<TransactionSignature>;
}

/// [`AssetLedger`] over a notary's vault.
#[derive(Debug, Clone)]
pub struct VaultAssetLedger {
    notary: Arc<Notary>,
}

impl VaultAssetLedger {
    pub fn new(notary: Arc<Notary>) -> Self {
        Self { notary }
    }

    pub fn notary(&self) -> &Arc<Notary> {
        &self.notary
    }

    fn holdings(&self, holder: &PublicKey, kind: &TokenKind) -> Vec<(StateAndRef, TokenState)> {
        let policy = SignerPolicy::single(*holder);
        self.notary.vault().query::<TokenState, _>(|envelope, token| {
            envelope.encumbrance.is_none() && token.kind == *kind && token.holder == policy
        })
    }

    async fn issue(&self, issuer: &SigningKey, token: TokenState) -> Result<SignedTransaction> {
        let mut builder = TransactionBuilder::new(self.notary.id().clone());
        builder.add_output_state(&token, None)?;
        builder.add_command(&TokenCommand::Issue, [issuer.public_key()])?;

        let stx = SignedTransaction::new(builder.to_wire_transaction())
            .sign(issuer, SignatureMetadata::default());
        let notary_sig = self.notary.commit(&stx)?;

        let mut committed = stx;
        committed.add_signature(notary_sig);
        info!(kind = %token.kind, tx_id = %committed.id().short(), "Tokens issued");
        Ok(committed)
    }

    /// Issue `quantity` of `kind` to `holder`.
    pub async fn issue_fungible(
        &self,
        issuer: &SigningKey,
        kind: impl Into<TokenKind>,
        quantity: Decimal,
        holder: PublicKey,
    ) -> Result<SignedTransaction> {
        let token = TokenState::fungible(
            kind.into(),
            quantity,
            SignerPolicy::single(holder),
            issuer.public_key(),
        );
        self.issue(issuer, token).await
    }

    /// Issue the unique asset `asset_id` of `kind` to `holder`.
    pub async fn issue_unique(
        &self,
        issuer: &SigningKey,
        kind: impl Into<TokenKind>,
        asset_id: impl Into<AssetId>,
        holder: PublicKey,
    ) -> Result<SignedTransaction> {
        let token = TokenState::unique(
            kind.into(),
            asset_id.into(),
            SignerPolicy::single(holder),
            issuer.public_key(),
        );
        self.issue(issuer, token).await
    }
}

#[async_trait]
impl AssetLedger for VaultAssetLedger {
    fn notary_id(&self) -> NotaryId {
        self.notary.id().clone()
    }

    #[instrument(skip(self, asset, to), fields(asset = %asset))]
    async fn construct_transfer(
        &self,
        asset: &AssetRequest,
        from: &PublicKey,
        to: &SignerPolicy,
    ) -> Result<TransferFragment> {
        let holdings = self.holdings(from, asset.kind());
        let sender = SignerPolicy::single(*from);

        let (inputs, outputs, recipient_outputs) = match asset {
            AssetRequest::Fungible { amount, .. } => {
                let mut remaining = *amount;
                let mut inputs = Vec::new();
                let mut sent: BTreeMap<PublicKey, Decimal> = BTreeMap::new();
                let mut change: BTreeMap<PublicKey, Decimal> = BTreeMap::new();

                for (state, token) in holdings {
                    if remaining <= Decimal::ZERO {
                        break;
                    }
                    let Some(quantity) = token.quantity() else {
                        continue;
                    };
                    let take = quantity.min(remaining);
                    *sent.entry(token.issuer).or_insert(Decimal::ZERO) += take;
                    if quantity > take {
                        *change.entry(token.issuer).or_insert(Decimal::ZERO) += quantity - take;
                    }
                    remaining -= take;
                    inputs.push(state);
                }

                if remaining > Decimal::ZERO {
                    return Err(LedgerError::InsufficientHoldings(format!(
                        "{} short of {} by {}",
                        from.key_id(),
                        asset,
                        remaining
                    )));
                }

                let to_recipient = sent.into_iter().map(|(issuer, quantity)| {
                    TokenState::fungible(asset.kind().clone(), quantity, to.clone(), issuer)
                });
                let to_sender = change.into_iter().map(|(issuer, quantity)| {
                    TokenState::fungible(asset.kind().clone(), quantity, sender.clone(), issuer)
                });
                let recipient: Vec<TokenState> = to_recipient.collect();
                let count = recipient.len();
                (inputs, recipient.into_iter().chain(to_sender).collect(), count)
            }
            AssetRequest::NonFungible { asset_id, .. } => {
                let (state, token) = holdings
                    .into_iter()
                    .find(|(_, token)| token.asset_id() == Some(asset_id))
                    .ok_or_else(|| {
                        LedgerError::InsufficientHoldings(format!(
                            "{} does not hold {}",
                            from.key_id(),
                            asset
                        ))
                    })?;
                (vec![state], vec![token.with_holder(to.clone())], 1)
            }
        };

        Ok(TransferFragment {
            notary: self.notary.id().clone(),
            inputs,
            outputs,
            recipient_outputs,
            signers: vec![*from],
        })
    }

    async fn owned_assets(&self, holder: &PublicKey, kind: &TokenKind) -> Result<Vec<StateAndRef>> {
        Ok(self
            .holdings(holder, kind)
            .into_iter()
            .map(|(state, _)| state)
            .collect())
    }

    async fn balance(&self, holder: &PublicKey, kind: &TokenKind) -> Result<Decimal> {
        Ok(self
            .holdings(holder, kind)
            .iter()
            .filter_map(|(_, token)| token.quantity())
            .sum())
    }

    async fn holder_of(&self, kind: &TokenKind, asset_id: &AssetId) -> Result<Option<SignerPolicy>> {
        Ok(self
            .notary
            .vault()
            .query::<TokenState, _>(|_, token| {
                token.kind == *kind && token.asset_id() == Some(asset_id)
            })
            .into_iter()
            .next()
            .map(|(_, token)| token.holder))
    }

    async fn transaction(&self, id: &SecureHash) -> Result<SignedTransaction> {
        self.notary
            .vault()
            .transaction(id)
            .ok_or(LedgerError::UnknownTransaction(*id))
    }

    async fn commit(&self, stx: &SignedTransaction) -> Result<TransactionSignature> {
        self.notary.commit(stx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContractRegistry, LedgerNetwork, TokenContract};
    use crossnotary_common::SystemClock;

    fn create_test_ledger() -> (VaultAssetLedger, SigningKey) {
        let network = LedgerNetwork::builder(ContractRegistry::new().with(Arc::new(TokenContract)))
            .notary("NotaryA", SigningKey::generate(), Arc::new(SystemClock))
            .domain("USD", "NotaryA")
            .domain("ART", "NotaryA")
            .build()
            .unwrap();
        (
            network.ledger_for(&TokenKind::new("USD")).unwrap(),
            SigningKey::generate(),
        )
    }

    #[tokio::test]
    async fn test_transfer_with_change() {
        let (ledger, bank) = create_test_ledger();
        let alice = SigningKey::generate();
        let bob = SigningKey::generate();
        ledger
            .issue_fungible(&bank, "USD", Decimal::new(70, 0), alice.public_key())
            .await
            .unwrap();
        ledger
            .issue_fungible(&bank, "USD", Decimal::new(50, 0), alice.public_key())
            .await
            .unwrap();

        let request = AssetRequest::fungible("USD", Decimal::new(100, 0));
        let fragment = ledger
            .construct_transfer(&request, &alice.public_key(), &SignerPolicy::single(bob.public_key()))
            .await
            .unwrap();

        let mut builder = TransactionBuilder::new(ledger.notary_id());
        fragment.apply(&mut builder, None).unwrap();
        let stx = SignedTransaction::new(builder.to_wire_transaction())
            .sign(&alice, SignatureMetadata::default());
        ledger.commit(&stx).await.unwrap();

        let usd = TokenKind::new("USD");
        assert_eq!(ledger.balance(&bob.public_key(), &usd).await.unwrap(), Decimal::new(100, 0));
        assert_eq!(ledger.balance(&alice.public_key(), &usd).await.unwrap(), Decimal::new(20, 0));
    }

    #[tokio::test]
    async fn test_insufficient_holdings() {
        let (ledger, bank) = create_test_ledger();
        let alice = SigningKey::generate();
        ledger
            .issue_fungible(&bank, "USD", Decimal::new(10, 0), alice.public_key())
            .await
            .unwrap();

        let result = ledger
            .construct_transfer(
                &AssetRequest::fungible("USD", Decimal::new(11, 0)),
                &alice.public_key(),
                &SignerPolicy::single(bank.public_key()),
            )
            .await;
        assert!(matches!(result, Err(LedgerError::InsufficientHoldings(_))));
    }

    #[tokio::test]
    async fn test_holder_of_unique_asset() {
        let (ledger, bank) = create_test_ledger();
        let alice = SigningKey::generate();
        let art = TokenKind::new("ART");
        let id = AssetId::new("sunflowers");
        ledger
            .issue_unique(&bank, art.clone(), id.clone(), alice.public_key())
            .await
            .unwrap();

        assert_eq!(
            ledger.holder_of(&art, &id).await.unwrap(),
            Some(SignerPolicy::single(alice.public_key()))
        );
        assert_eq!(ledger.holder_of(&art, &AssetId::new("other")).await.unwrap(), None);
        assert_eq!(ledger.owned_assets(&alice.public_key(), &art).await.unwrap().len(), 1);
    }
}
