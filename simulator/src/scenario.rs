//! Simulation scenarios.

use std::path::Path;

use crossnotary_common::AssetRequest;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Parties to join, in order. The first one uses the configured store.
    pub parties: Vec<String>,
    /// Protocol timing overrides, in seconds.
    #[serde(default)]
    pub timing: Option<Timing>,
    /// Steps in the scenario.
    pub steps: Vec<ScenarioStep>,
}

/// Shorter windows so deadline scenarios finish quickly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Timing {
    pub draft_window_secs: i64,
    pub escrow_grace_secs: i64,
}

/// A step in a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ScenarioStep {
    /// Wait for a duration.
    Wait { seconds: u64 },
    /// Mint a fungible token.
    IssueFungible {
        party: String,
        kind: String,
        quantity: Decimal,
    },
    /// Mint a unique token.
    IssueUnique {
        party: String,
        kind: String,
        asset_id: String,
    },
    /// Propose, decide and, if approved, execute one swap.
    Swap {
        buyer: String,
        seller: String,
        pay: AssetRequest,
        receive: AssetRequest,
        #[serde(default = "approve_by_default")]
        approve: bool,
        /// Hold the buyer leg back this long once escrow is committed.
        #[serde(default)]
        settle_delay_secs: Option<u64>,
        expect: Expectation,
    },
    /// Assert a condition.
    Assert { condition: AssertCondition },
}

fn approve_by_default() -> bool {
    true
}

/// How a swap step is expected to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    Settled,
    Reverted,
    Aborted,
    Denied,
}

/// Conditions that can be asserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum AssertCondition {
    /// Unencumbered balance of a fungible kind.
    BalanceEquals {
        party: String,
        kind: String,
        quantity: Decimal,
    },
    /// Sole holder of a unique token.
    HeldBy {
        kind: String,
        asset_id: String,
        party: String,
    },
}

impl Scenario {
    /// Load a built-in scenario by name, or a JSON scenario from a path.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        match name {
            "happy-path" => Ok(Self::happy_path()),
            "timeout" => Ok(Self::timeout()),
            "denied" => Ok(Self::denied()),
            "fx" => Ok(Self::fx()),
            path if Path::new(path).is_file() => {
                let raw = std::fs::read_to_string(path)?;
                Ok(serde_json::from_str(&raw)?)
            }
            _ => Err(anyhow::anyhow!("Unknown scenario: {}", name)),
        }
    }

    /// Alice buys Bob's painting for 250 USD.
    fn happy_path() -> Self {
        Self {
            name: "happy-path".to_string(),
            description: "USD on NotaryA for a unique ART token on NotaryB".to_string(),
            parties: vec!["Alice".to_string(), "Bob".to_string()],
            timing: None,
            steps: vec![
                issue_usd("Alice", 1_000),
                issue_painting("Bob"),
                ScenarioStep::Swap {
                    buyer: "Alice".to_string(),
                    seller: "Bob".to_string(),
                    pay: AssetRequest::fungible("USD", Decimal::from(250)),
                    receive: AssetRequest::non_fungible("ART", "mona-lisa"),
                    approve: true,
                    settle_delay_secs: None,
                    expect: Expectation::Settled,
                },
                balance_equals("Alice", "USD", 750),
                balance_equals("Bob", "USD", 250),
                held_by("Alice"),
            ],
        }
    }

    /// The buyer leg comes too late and the escrow goes back to Bob.
    fn timeout() -> Self {
        Self {
            name: "timeout".to_string(),
            description: "Buyer leg held past the escrow deadline".to_string(),
            parties: vec!["Alice".to_string(), "Bob".to_string()],
            timing: Some(Timing {
                draft_window_secs: 2,
                escrow_grace_secs: 1,
            }),
            steps: vec![
                issue_usd("Alice", 1_000),
                issue_painting("Bob"),
                ScenarioStep::Swap {
                    buyer: "Alice".to_string(),
                    seller: "Bob".to_string(),
                    pay: AssetRequest::fungible("USD", Decimal::from(250)),
                    receive: AssetRequest::non_fungible("ART", "mona-lisa"),
                    approve: true,
                    settle_delay_secs: Some(5),
                    expect: Expectation::Reverted,
                },
                balance_equals("Alice", "USD", 1_000),
                held_by("Bob"),
            ],
        }
    }

    /// Bob turns the offer down; nothing moves.
    fn denied() -> Self {
        Self {
            name: "denied".to_string(),
            description: "Seller denies the request".to_string(),
            parties: vec!["Alice".to_string(), "Bob".to_string()],
            timing: None,
            steps: vec![
                issue_usd("Alice", 1_000),
                issue_painting("Bob"),
                ScenarioStep::Swap {
                    buyer: "Alice".to_string(),
                    seller: "Bob".to_string(),
                    pay: AssetRequest::fungible("USD", Decimal::from(10)),
                    receive: AssetRequest::non_fungible("ART", "mona-lisa"),
                    approve: false,
                    settle_delay_secs: None,
                    expect: Expectation::Denied,
                },
                balance_equals("Alice", "USD", 1_000),
                held_by("Bob"),
            ],
        }
    }

    /// Fungible for fungible across both notaries, then a shortfall.
    fn fx() -> Self {
        Self {
            name: "fx".to_string(),
            description: "USD for GBP, then a swap the buyer cannot fund".to_string(),
            parties: vec!["Alice".to_string(), "Bob".to_string(), "Carol".to_string()],
            timing: None,
            steps: vec![
                issue_usd("Alice", 1_000),
                ScenarioStep::IssueFungible {
                    party: "Carol".to_string(),
                    kind: "GBP".to_string(),
                    quantity: Decimal::from(800),
                },
                ScenarioStep::Swap {
                    buyer: "Alice".to_string(),
                    seller: "Carol".to_string(),
                    pay: AssetRequest::fungible("USD", Decimal::from(500)),
                    receive: AssetRequest::fungible("GBP", Decimal::from(400)),
                    approve: true,
                    settle_delay_secs: None,
                    expect: Expectation::Settled,
                },
                ScenarioStep::Swap {
                    buyer: "Alice".to_string(),
                    seller: "Carol".to_string(),
                    pay: AssetRequest::fungible("USD", Decimal::from(900)),
                    receive: AssetRequest::fungible("GBP", Decimal::from(100)),
                    approve: true,
                    settle_delay_secs: None,
                    expect: Expectation::Aborted,
                },
                balance_equals("Alice", "USD", 500),
                balance_equals("Alice", "GBP", 400),
                balance_equals("Carol", "GBP", 400),
                balance_equals("Carol", "USD", 500),
            ],
        }
    }
}

fn issue_usd(party: &str, quantity: i64) -> ScenarioStep {
    ScenarioStep::IssueFungible {
        party: party.to_string(),
        kind: "USD".to_string(),
        quantity: Decimal::from(quantity),
    }
}

fn issue_painting(party: &str) -> ScenarioStep {
    ScenarioStep::IssueUnique {
        party: party.to_string(),
        kind: "ART".to_string(),
        asset_id: "mona-lisa".to_string(),
    }
}

fn balance_equals(party: &str, kind: &str, quantity: i64) -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::BalanceEquals {
            party: party.to_string(),
            kind: kind.to_string(),
            quantity: Decimal::from(quantity),
        },
    }
}

fn held_by(party: &str) -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::HeldBy {
            kind: "ART".to_string(),
            asset_id: "mona-lisa".to_string(),
            party: party.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_scenarios_load() {
        for name in ["happy-path", "timeout", "denied", "fx"] {
            let scenario = Scenario::load(name).unwrap();
            assert_eq!(scenario.name, name);
            assert!(!scenario.steps.is_empty());
        }
        assert!(Scenario::load("no-such-scenario").is_err());
    }

    #[test]
    fn test_scenario_json_shape() {
        let raw = r#"{
            "name": "custom",
            "description": "one swap",
            "parties": ["Alice", "Bob"],
            "steps": [
                {"step": "issue_fungible", "party": "Alice", "kind": "USD", "quantity": "10"},
                {"step": "swap", "buyer": "Alice", "seller": "Bob",
                 "pay": {"type": "FUNGIBLE", "kind": "USD", "amount": "10"},
                 "receive": {"type": "NON_FUNGIBLE", "kind": "ART", "asset_id": "sketch"},
                 "expect": "aborted"}
            ]
        }"#;
        let scenario: Scenario = serde_json::from_str(raw).unwrap();
        assert!(scenario.timing.is_none());
        match &scenario.steps[1] {
            ScenarioStep::Swap {
                approve,
                settle_delay_secs,
                expect,
                ..
            } => {
                assert!(*approve);
                assert_eq!(*settle_delay_secs, None);
                assert_eq!(*expect, Expectation::Aborted);
            }
            other => panic!("unexpected step {:?}", other),
        }
    }
}
