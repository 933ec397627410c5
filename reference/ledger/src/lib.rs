//! CrossNotary Ledger
//!
//! A small UTXO ledger with one notary per domain. States are JSON payloads
//! tagged with the contract that governs them; transactions are content
//! addressed and committed atomically by their notary, which is the only
//! point where double spends are serialized.

pub mod adapter;
pub mod contract;
pub mod error;
pub mod network;
pub mod notary;
pub mod state;
pub mod token;
pub mod transaction;
pub mod vault;

pub use adapter::{AssetLedger, TransferFragment, VaultAssetLedger};
pub use contract::{Contract, ContractRegistry, ContractViolation, LedgerTransaction};
pub use error::{LedgerError, Result};
pub use network::{LedgerNetwork, LedgerNetworkBuilder};
pub use notary::Notary;
pub use state::{ContractState, StateAndRef, StateEnvelope, StateRef};
pub use token::{TokenAmount, TokenCommand, TokenContract, TokenState};
pub use transaction::{
    CommandEnvelope, ContractCommand, SignatureMetadata, SignatureScheme, SignedTransaction,
    TransactionBuilder, TransactionSignature, WireTransaction, PLATFORM_VERSION,
};
pub use vault::Vault;
