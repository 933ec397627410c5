//! Simulation controller.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crossnotary_common::AssetRequest;
use crossnotary_swap::store::connect_store;
use crossnotary_swap::{ExecuteOptions, Sandbox, SwapConfig, SwapOutcome, SwapService};

use crate::metrics::SimulationMetrics;
use crate::scenario::{AssertCondition, Expectation, Scenario, ScenarioStep};

fn expectation_of(outcome: &SwapOutcome) -> Expectation {
    match outcome {
        SwapOutcome::Settled { .. } => Expectation::Settled,
        SwapOutcome::Reverted { .. } => Expectation::Reverted,
        SwapOutcome::Aborted { .. } => Expectation::Aborted,
    }
}

/// Controls the simulation.
pub struct SimulationController {
    config: SwapConfig,
    /// Simulation speed multiplier for wait steps.
    speed: f64,
    rng: StdRng,
    sandbox: Sandbox,
    /// Joined parties by name.
    parties: HashMap<String, SwapService>,
    /// Revert sweepers of the joined parties.
    sweepers: Vec<JoinHandle<()>>,
    metrics: SimulationMetrics,
}

impl SimulationController {
    /// Create a controller over a fresh sandbox.
    pub fn new(config: SwapConfig, speed: f64, seed: Option<u64>) -> anyhow::Result<Self> {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let sandbox = Sandbox::builder().config(config.clone()).build()?;

        Ok(Self {
            config,
            speed,
            rng,
            sandbox,
            parties: HashMap::new(),
            sweepers: Vec::new(),
            metrics: SimulationMetrics::new(),
        })
    }

    /// Join `names` to the network. The first party keeps its requests in
    /// the configured store; the rest stay in memory.
    pub async fn initialize(&mut self, names: &[String]) -> anyhow::Result<()> {
        for (i, name) in names.iter().enumerate() {
            let service = if i == 0 {
                let store = connect_store(&self.config).await?;
                self.sandbox.add_party_with_store(name, store)?
            } else {
                self.sandbox.add_party(name)?
            };
            info!(party = %name, key = %service.party().key.key_id(), "Party joined");
            self.sweepers.push(service.spawn_revert_sweeper());
            self.parties.insert(name.clone(), service);
        }
        Ok(())
    }

    /// Run a scenario. Stops at the first failed expectation.
    pub async fn run_scenario(&mut self, scenario: &Scenario) -> anyhow::Result<()> {
        info!("Running scenario: {} - {}", scenario.name, scenario.description);

        for step in &scenario.steps {
            self.execute_step(step).await?;
        }

        Ok(())
    }

    /// Run `count` random USD-for-GBP swaps between two fresh parties.
    pub async fn run_volume(&mut self, count: usize) -> anyhow::Result<()> {
        info!(count, "Running random swaps");
        let names = ["Buyer".to_string(), "Seller".to_string()];
        self.initialize(&names).await?;

        let budget = Decimal::from(1_000 * count as i64);
        let buyer = self.party("Buyer")?.party().clone();
        let seller = self.party("Seller")?.party().clone();
        self.sandbox.issue_fungible("USD", budget, &buyer).await?;
        self.sandbox.issue_fungible("GBP", budget, &seller).await?;

        for _ in 0..count {
            let pay = Decimal::from(self.rng.gen_range(1..1_000));
            let receive = Decimal::from(self.rng.gen_range(1..1_000));
            self.swap(
                "Buyer",
                "Seller",
                AssetRequest::fungible("USD", pay),
                AssetRequest::fungible("GBP", receive),
                true,
                None,
                Expectation::Settled,
            )
            .await?;
        }

        Ok(())
    }

    /// Execute a single scenario step.
    async fn execute_step(&mut self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::Wait { seconds } => {
                let adjusted = (*seconds as f64 / self.speed) as u64;
                info!("Waiting {} seconds (adjusted: {})", seconds, adjusted);
                tokio::time::sleep(Duration::from_secs(adjusted)).await;
            }
            ScenarioStep::IssueFungible {
                party,
                kind,
                quantity,
            } => {
                let holder = self.party(party)?.party().clone();
                self.sandbox.issue_fungible(kind, *quantity, &holder).await?;
                info!(party = %party, kind = %kind, quantity = %quantity, "Issued");
            }
            ScenarioStep::IssueUnique {
                party,
                kind,
                asset_id,
            } => {
                let holder = self.party(party)?.party().clone();
                self.sandbox.issue_unique(kind, asset_id, &holder).await?;
                info!(party = %party, kind = %kind, asset_id = %asset_id, "Issued");
            }
            ScenarioStep::Swap {
                buyer,
                seller,
                pay,
                receive,
                approve,
                settle_delay_secs,
                expect,
            } => {
                self.swap(
                    buyer,
                    seller,
                    pay.clone(),
                    receive.clone(),
                    *approve,
                    settle_delay_secs.map(Duration::from_secs),
                    *expect,
                )
                .await?;
            }
            ScenarioStep::Assert { condition } => self.check(condition).await?,
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn swap(
        &mut self,
        buyer: &str,
        seller: &str,
        pay: AssetRequest,
        receive: AssetRequest,
        approve: bool,
        settle_delay: Option<Duration>,
        expect: Expectation,
    ) -> anyhow::Result<()> {
        let buyer = self.party(buyer)?.clone();
        let seller = self.party(seller)?.clone();
        info!(buyer = %buyer.party(), seller = %seller.party(), pay = %pay, receive = %receive, "Swap requested");

        let started = Instant::now();
        let request_id = buyer
            .create_request(&seller.party().name, pay, receive)
            .await?;
        let reason = (!approve).then(|| "declined by scenario".to_string());
        seller.approve(request_id, approve, reason).await?;

        let observed = if approve {
            let options = ExecuteOptions { settle_delay };
            let outcome = buyer.execute_with(request_id, options).await?;
            self.metrics
                .record_outcome(&outcome, started.elapsed().as_millis() as u64);
            info!(request_id = %request_id, outcome = ?outcome, "Swap finished");
            expectation_of(&outcome)
        } else {
            self.metrics.record_denied();
            info!(request_id = %request_id, "Swap denied");
            Expectation::Denied
        };

        if observed != expect {
            self.metrics.record_unexpected();
            warn!(request_id = %request_id, ?observed, ?expect, "Unexpected swap outcome");
            anyhow::bail!(
                "request {} ended {:?}, expected {:?}",
                request_id,
                observed,
                expect
            );
        }
        Ok(())
    }

    async fn check(&self, condition: &AssertCondition) -> anyhow::Result<()> {
        match condition {
            AssertCondition::BalanceEquals {
                party,
                kind,
                quantity,
            } => {
                let holder = self.party(party)?.party();
                let balance = self.sandbox.balance(holder, kind).await?;
                if balance != *quantity {
                    anyhow::bail!("{} holds {} {}, expected {}", party, balance, kind, quantity);
                }
            }
            AssertCondition::HeldBy {
                kind,
                asset_id,
                party,
            } => {
                let key = self.party(party)?.party().key;
                let holder = self.sandbox.holder_of(kind, asset_id).await?;
                if holder.as_ref().and_then(|policy| policy.single_key()) != Some(key) {
                    anyhow::bail!("{} {} is not held by {} alone", kind, asset_id, party);
                }
            }
        }
        info!(?condition, "Assertion passed");
        Ok(())
    }

    fn party(&self, name: &str) -> anyhow::Result<&SwapService> {
        self.parties
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown party: {}", name))
    }

    pub fn parties(&self) -> impl Iterator<Item = &SwapService> {
        self.parties.values()
    }

    pub fn metrics(&self) -> &SimulationMetrics {
        &self.metrics
    }
}

impl Drop for SimulationController {
    fn drop(&mut self) {
        for sweeper in &self.sweepers {
            sweeper.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_happy_path_scenario_runs() {
        let scenario = Scenario::load("happy-path").unwrap();
        let mut controller = SimulationController::new(SwapConfig::default(), 1.0, Some(7)).unwrap();
        controller.initialize(&scenario.parties).await.unwrap();
        controller.run_scenario(&scenario).await.unwrap();

        assert_eq!(controller.metrics().settled, 1);
        assert_eq!(controller.metrics().unexpected, 0);
    }

    #[tokio::test]
    async fn test_wrong_expectation_fails_the_run() {
        let mut scenario = Scenario::load("denied").unwrap();
        for step in &mut scenario.steps {
            if let ScenarioStep::Swap { expect, .. } = step {
                *expect = Expectation::Settled;
            }
        }
        let mut controller = SimulationController::new(SwapConfig::default(), 1.0, None).unwrap();
        controller.initialize(&scenario.parties).await.unwrap();

        assert!(controller.run_scenario(&scenario).await.is_err());
        assert_eq!(controller.metrics().unexpected, 1);
    }

    #[tokio::test]
    async fn test_volume_run_settles_every_swap() {
        let mut controller = SimulationController::new(SwapConfig::default(), 1.0, Some(42)).unwrap();
        controller.run_volume(3).await.unwrap();

        assert_eq!(controller.metrics().total_swaps, 3);
        assert_eq!(controller.metrics().settled, 3);
    }

    #[tokio::test]
    async fn test_every_joined_party_runs_a_sweeper() {
        let names = ["Alice".to_string(), "Bob".to_string()];
        let mut controller = SimulationController::new(SwapConfig::default(), 1.0, None).unwrap();
        controller.initialize(&names).await.unwrap();

        assert_eq!(controller.sweepers.len(), 2);
        assert!(controller.sweepers.iter().all(|sweeper| !sweeper.is_finished()));
    }
}
