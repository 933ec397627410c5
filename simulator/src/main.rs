//! CrossNotary Simulator
//!
//! Runs swap scenarios between parties on two in-process notaries.

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod controller;
mod metrics;
mod scenario;

use controller::SimulationController;
use crossnotary_swap::SwapConfig;
use scenario::Scenario;

/// CrossNotary Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Cross-notary atomic swap simulation environment")]
struct Args {
    /// Built-in scenario (happy-path, timeout, denied, fx) or a JSON file
    #[arg(short, long, default_value = "happy-path")]
    scenario: String,

    /// Run this many random swaps instead of a scenario
    #[arg(long)]
    swaps: Option<usize>,

    /// Simulation speed multiplier for wait steps
    #[arg(long, default_value = "1.0")]
    speed: f64,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    /// Print each party's counters in Prometheus text format
    #[arg(long)]
    prometheus: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json);

    info!("Starting CrossNotary Simulator");
    let mut config = SwapConfig::from_env();

    let controller = match args.swaps {
        Some(count) => {
            let mut controller = SimulationController::new(config, args.speed, args.seed)?;
            controller.run_volume(count).await?;
            controller
        }
        None => {
            let scenario = Scenario::load(&args.scenario)?;
            if let Some(timing) = scenario.timing {
                config.draft_window = chrono::Duration::seconds(timing.draft_window_secs);
                config.escrow_grace_period = chrono::Duration::seconds(timing.escrow_grace_secs);
            }
            let mut controller = SimulationController::new(config, args.speed, args.seed)?;
            controller.initialize(&scenario.parties).await?;
            controller.run_scenario(&scenario).await?;
            controller
        }
    };

    let metrics = controller.metrics();
    info!("Simulation complete");
    info!("Total swaps: {}", metrics.total_swaps);
    info!(
        "Settled: {}, reverted: {}, aborted: {}, denied: {}",
        metrics.settled, metrics.reverted, metrics.aborted, metrics.denied
    );
    info!("Settle rate: {:.2}", metrics.settle_rate());
    info!(
        "Average latency: {}ms (p99 {}ms)",
        metrics.average_latency_ms(),
        metrics.p99_latency_ms()
    );

    if args.prometheus {
        for service in controller.parties() {
            println!("# party {}", service.party());
            println!("{}", service.node().metrics().to_prometheus());
        }
    }

    Ok(())
}
