//! CrossNotary Protocol Messages
//!
//! Messages exchanged between buyer and seller over a swap session. Every
//! message travels as JSON inside a [`SwapEnvelope`] and carries full
//! transaction structures, so the receiver can recompute every id it is
//! asked to trust.

pub mod messages;

pub use messages::*;
