//! CrossNotary Swap
//!
//! Atomic exchange of assets held on two notary domains. The buyer pays on
//! its own domain; the seller's asset sits in escrow on the other domain
//! under a lock that only a signature of the buyer's notary over the agreed
//! payment can release. After the lock's deadline the seller may register a
//! revert intent and take the escrow back, with the buyer's consent.

pub mod config;
pub mod escrow;
pub mod lock;
pub mod lock_manager;
pub mod metrics;
pub mod negotiator;
pub mod network;
pub mod node;
pub mod orchestrator;
pub mod relay;
pub mod revert;
pub mod sandbox;
pub mod service;
pub mod session;
pub mod state;
pub mod store;

pub use config::SwapConfig;
pub use lock::{LockCommand, LockContract, LockPhase, LockState};
pub use lock_manager::{LockManager, LockRecord, LockStatus};
pub use metrics::{SharedMetrics, SwapMetrics};
pub use network::SwapNetwork;
pub use node::SwapNode;
pub use orchestrator::ExecuteOptions;
pub use sandbox::{Sandbox, SandboxBuilder};
pub use service::SwapService;
pub use state::{FlowPhase, Role, SwapOutcome};
pub use store::{ExchangeRequestStore, InMemoryRequestStore, PgRequestStore, SharedStore};
