//! Asset types exchanged in a swap.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::SwapError;

/// Kind of token tracked by a ledger (a currency code, a collection name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenKind(String);

impl TokenKind {
    /// Create a new token kind.
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    /// Get the kind as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TokenKind {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TokenKind {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a unique (non-fungible) asset within its token kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AssetId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for AssetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One side of the terms of an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetRequest {
    /// A quantity of an interchangeable token.
    Fungible { kind: TokenKind, amount: Decimal },
    /// One specific unique token.
    NonFungible { kind: TokenKind, asset_id: AssetId },
}

impl AssetRequest {
    /// Request `amount` units of `kind`.
    pub fn fungible(kind: impl Into<TokenKind>, amount: Decimal) -> Self {
        AssetRequest::Fungible {
            kind: kind.into(),
            amount,
        }
    }

    /// Request the unique asset `asset_id` of `kind`.
    pub fn non_fungible(kind: impl Into<TokenKind>, asset_id: impl Into<AssetId>) -> Self {
        AssetRequest::NonFungible {
            kind: kind.into(),
            asset_id: asset_id.into(),
        }
    }

    pub fn kind(&self) -> &TokenKind {
        match self {
            AssetRequest::Fungible { kind, .. } | AssetRequest::NonFungible { kind, .. } => kind,
        }
    }

    pub fn is_fungible(&self) -> bool {
        matches!(self, AssetRequest::Fungible { .. })
    }

    /// Amount, for fungible requests.
    pub fn amount(&self) -> Option<Decimal> {
        match self {
            AssetRequest::Fungible { amount, .. } => Some(*amount),
            AssetRequest::NonFungible { .. } => None,
        }
    }

    /// Asset id, for non-fungible requests.
    pub fn asset_id(&self) -> Option<&AssetId> {
        match self {
            AssetRequest::Fungible { .. } => None,
            AssetRequest::NonFungible { asset_id, .. } => Some(asset_id),
        }
    }

    /// Check the request is well formed.
    pub fn validate(&self) -> Result<(), SwapError> {
        if self.kind().as_str().is_empty() {
            return Err(SwapError::ValidationFailure(
                "token kind must not be empty".to_string(),
            ));
        }
        match self {
            AssetRequest::Fungible { amount, .. } if *amount <= Decimal::ZERO => {
                Err(SwapError::ValidationFailure(format!(
                    "fungible amount must be positive, got {}",
                    amount
                )))
            }
            AssetRequest::NonFungible { asset_id, .. } if asset_id.as_str().is_empty() => Err(
                SwapError::ValidationFailure("asset id must not be empty".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for AssetRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetRequest::Fungible { kind, amount } => write!(f, "{} {}", amount, kind),
            AssetRequest::NonFungible { kind, asset_id } => write!(f, "{}#{}", kind, asset_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_fungible_amount_must_be_positive() {
        assert!(AssetRequest::fungible("USD", dec("10.50")).validate().is_ok());
        assert!(AssetRequest::fungible("USD", Decimal::ZERO).validate().is_err());
        assert!(AssetRequest::fungible("USD", dec("-1")).validate().is_err());
    }

    #[test]
    fn test_non_fungible_requires_asset_id() {
        assert!(AssetRequest::non_fungible("ART", "mona-lisa")
            .validate()
            .is_ok());
        assert!(AssetRequest::non_fungible("ART", "").validate().is_err());
        assert!(AssetRequest::non_fungible("", "x").validate().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(AssetRequest::fungible("USD", dec("100")).to_string(), "100 USD");
        assert_eq!(
            AssetRequest::non_fungible("ART", "mona-lisa").to_string(),
            "ART#mona-lisa"
        );
    }

    #[test]
    fn test_tagged_json() {
        let json = serde_json::to_value(AssetRequest::non_fungible("ART", "a1")).unwrap();
        assert_eq!(json["type"], "NON_FUNGIBLE");
        assert_eq!(json["asset_id"], "a1");
    }
}
