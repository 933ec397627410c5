//! Time utilities, protocol timing constants and clocks.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Protocol timing constants.
pub mod constants {
    use super::Duration;

    /// How long a draft transfer stays valid (60 seconds).
    pub fn default_draft_window() -> Duration {
        Duration::seconds(60)
    }

    /// Added to the draft deadline to get the escrow deadline (30 seconds).
    pub fn escrow_grace_period() -> Duration {
        Duration::seconds(30)
    }

    /// Extra wait past the escrow deadline before the seller reverts (1 second).
    pub fn revert_margin() -> Duration {
        Duration::seconds(1)
    }

    /// Maximum wait for any single session message (120 seconds).
    pub fn session_timeout() -> Duration {
        Duration::seconds(120)
    }

    /// Clock difference tolerated between buyer and seller (5 seconds).
    pub fn max_clock_skew() -> Duration {
        Duration::seconds(5)
    }

    /// How often a seller looks for escrows left past their deadline (10 seconds).
    pub fn revert_sweep_interval() -> Duration {
        Duration::seconds(10)
    }
}

/// A timestamp with timezone (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Get the current wall-clock timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Duration extensions for convenient construction.
pub trait DurationExt {
    fn as_std(&self) -> std::time::Duration;
}

impl DurationExt for Duration {
    fn as_std(&self) -> std::time::Duration {
        self.to_std().unwrap_or(std::time::Duration::ZERO)
    }
}

/// Source of "now" for notaries and flows.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Timestamp;
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        now()
    }
}

/// UTC time derived from the tokio clock.
///
/// Anchored at construction; advances with `tokio::time`, so it follows a
/// paused or advanced runtime clock in tests.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin_utc: Timestamp,
    origin: tokio::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::starting_at(now())
    }

    pub fn starting_at(origin_utc: Timestamp) -> Self {
        Self {
            origin_utc,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        let elapsed = Duration::from_std(self.origin.elapsed()).unwrap_or_else(|_| Duration::zero());
        self.origin_utc + elapsed
    }
}

/// Clock moved by hand.
#[derive(Debug)]
pub struct ManualClock {
    current: RwLock<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            current: RwLock::new(start),
        }
    }

    pub fn set(&self, at: Timestamp) {
        *self.current.write() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut current = self.current.write();
        *current = *current + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.current.read()
    }
}

/// Validity interval of a transaction: `from <= t < until`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub from: Option<Timestamp>,
    pub until: Option<Timestamp>,
}

impl TimeWindow {
    /// Valid strictly before `until`.
    pub fn until_only(until: Timestamp) -> Self {
        Self {
            from: None,
            until: Some(until),
        }
    }

    /// Valid at or after `from`.
    pub fn from_only(from: Timestamp) -> Self {
        Self {
            from: Some(from),
            until: None,
        }
    }

    pub fn between(from: Timestamp, until: Timestamp) -> Self {
        Self {
            from: Some(from),
            until: Some(until),
        }
    }

    pub fn contains(&self, at: Timestamp) -> bool {
        self.from.map_or(true, |from| from <= at) && self.until.map_or(true, |until| at < until)
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let from = self.from.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-inf".into());
        let until = self.until.map(|t| t.to_rfc3339()).unwrap_or_else(|| "+inf".into());
        write!(f, "[{}, {})", from, until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_is_half_open() {
        let start = now();
        let window = TimeWindow::between(start, start + Duration::seconds(60));

        assert!(window.contains(start));
        assert!(window.contains(start + Duration::seconds(59)));
        assert!(!window.contains(start + Duration::seconds(60)));
        assert!(!window.contains(start - Duration::milliseconds(1)));
    }

    #[test]
    fn test_open_ended_windows() {
        let t = now();
        assert!(TimeWindow::until_only(t).contains(t - Duration::days(365)));
        assert!(TimeWindow::from_only(t).contains(t + Duration::days(365)));
        assert!(!TimeWindow::from_only(t).contains(t - Duration::seconds(1)));
    }

    #[test]
    fn test_manual_clock() {
        let start = now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::seconds(90));
        assert_eq!(clock.now(), start + Duration::seconds(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monotonic_clock_follows_tokio_time() {
        let start = now();
        let clock = MonotonicClock::starting_at(start);

        tokio::time::advance(std::time::Duration::from_secs(91)).await;
        assert!(clock.now() >= start + Duration::seconds(91));
    }
}
