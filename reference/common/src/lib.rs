//! CrossNotary Common Types
//!
//! Shared types used across the swap protocol: party and request
//! identifiers, asset requests, the exchange request record and its
//! lifecycle, the error taxonomy and clocks.

pub mod asset;
pub mod error;
pub mod identifiers;
pub mod request;
pub mod time;

pub use asset::*;
pub use error::*;
pub use identifiers::*;
pub use request::*;
pub use time::*;
