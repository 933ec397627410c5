//! Simulation metrics.

use std::collections::VecDeque;

use crossnotary_swap::SwapOutcome;

/// Outcome counts and latencies of the swaps a run executed.
#[derive(Debug, Clone)]
pub struct SimulationMetrics {
    /// Swap steps attempted.
    pub total_swaps: u64,
    pub settled: u64,
    pub reverted: u64,
    pub aborted: u64,
    pub denied: u64,
    /// Steps whose outcome differed from the expectation.
    pub unexpected: u64,
    /// Latency samples (ms).
    latency_samples: VecDeque<u64>,
    /// Maximum samples to keep.
    max_samples: usize,
}

impl SimulationMetrics {
    pub fn new() -> Self {
        Self {
            total_swaps: 0,
            settled: 0,
            reverted: 0,
            aborted: 0,
            denied: 0,
            unexpected: 0,
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    /// Record an executed swap.
    pub fn record_outcome(&mut self, outcome: &SwapOutcome, latency_ms: u64) {
        self.total_swaps += 1;
        match outcome {
            SwapOutcome::Settled { .. } => self.settled += 1,
            SwapOutcome::Reverted { .. } => self.reverted += 1,
            SwapOutcome::Aborted { .. } => self.aborted += 1,
        }

        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_ms);
    }

    /// Record a request the seller turned down.
    pub fn record_denied(&mut self) {
        self.total_swaps += 1;
        self.denied += 1;
    }

    pub fn record_unexpected(&mut self) {
        self.unexpected += 1;
    }

    /// Get average latency in ms.
    pub fn average_latency_ms(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    pub fn p99_latency_ms(&self) -> u64 {
        self.percentile_latency(99)
    }

    fn percentile_latency(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Share of attempted swaps that settled.
    pub fn settle_rate(&self) -> f64 {
        if self.total_swaps == 0 {
            return 0.0;
        }

        self.settled as f64 / self.total_swaps as f64
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics() {
        let mut metrics = SimulationMetrics::new();

        metrics.record_outcome(
            &SwapOutcome::Aborted {
                reason: "no funds".to_string(),
            },
            100,
        );
        metrics.record_outcome(
            &SwapOutcome::Aborted {
                reason: "no asset".to_string(),
            },
            200,
        );
        metrics.record_denied();
        metrics.record_unexpected();

        assert_eq!(metrics.total_swaps, 3);
        assert_eq!(metrics.aborted, 2);
        assert_eq!(metrics.denied, 1);
        assert_eq!(metrics.unexpected, 1);
        assert_eq!(metrics.average_latency_ms(), 150);
        assert_eq!(metrics.p99_latency_ms(), 200);
        assert_eq!(metrics.settle_rate(), 0.0);
    }
}
