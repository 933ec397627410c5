//! Swap node configuration.

use chrono::Duration;
use crossnotary_common::constants;
use crossnotary_ledger::SignatureMetadata;

/// Timing and storage settings for a swap node.
#[derive(Debug, Clone)]
pub struct SwapConfig {
    /// How long a buyer's draft transfer stays valid.
    pub draft_window: Duration,
    /// Added to the draft's validity deadline to get the escrow deadline.
    pub escrow_grace_period: Duration,
    /// Extra wait past the escrow deadline before the seller reverts.
    pub revert_margin: Duration,
    /// Maximum wait for a single session message.
    pub session_timeout: Duration,
    /// How far past `now + draft_window` a buyer's draft may stay valid.
    pub max_clock_skew: Duration,
    /// Pause between sweeps for escrows left past their deadline.
    pub revert_sweep_interval: Duration,
    /// Metadata stamped on this node's transaction signatures.
    pub signature_metadata: SignatureMetadata,
    /// PostgreSQL URL for the request store. In-memory when unset.
    pub database_url: Option<String>,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            draft_window: constants::default_draft_window(),
            escrow_grace_period: constants::escrow_grace_period(),
            revert_margin: constants::revert_margin(),
            session_timeout: constants::session_timeout(),
            max_clock_skew: constants::max_clock_skew(),
            revert_sweep_interval: constants::revert_sweep_interval(),
            signature_metadata: SignatureMetadata::default(),
            database_url: None,
        }
    }
}

fn secs_from_env(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .map(Duration::seconds)
}

impl SwapConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(window) = secs_from_env("SWAP_DRAFT_WINDOW_SECS") {
            config.draft_window = window;
        }

        if let Some(grace) = secs_from_env("SWAP_ESCROW_GRACE_SECS") {
            config.escrow_grace_period = grace;
        }

        if let Some(margin) = secs_from_env("SWAP_REVERT_MARGIN_SECS") {
            config.revert_margin = margin;
        }

        if let Some(timeout) = secs_from_env("SWAP_SESSION_TIMEOUT_SECS") {
            config.session_timeout = timeout;
        }

        if let Some(skew) = secs_from_env("SWAP_MAX_CLOCK_SKEW_SECS") {
            config.max_clock_skew = skew;
        }

        if let Some(interval) = secs_from_env("SWAP_REVERT_SWEEP_SECS") {
            config.revert_sweep_interval = interval;
        }

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = Some(url);
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.draft_window <= Duration::zero() {
            return Err("Draft window must be positive".to_string());
        }

        if self.draft_window > Duration::hours(24) {
            return Err("Draft window cannot exceed 24 hours".to_string());
        }

        if self.escrow_grace_period <= Duration::zero() {
            return Err("Escrow grace period must be positive".to_string());
        }

        if self.revert_margin < Duration::zero() {
            return Err("Revert margin cannot be negative".to_string());
        }

        if self.session_timeout <= Duration::zero() {
            return Err("Session timeout must be positive".to_string());
        }

        if self.max_clock_skew < Duration::zero() {
            return Err("Clock skew allowance cannot be negative".to_string());
        }

        if self.revert_sweep_interval <= Duration::zero() {
            return Err("Revert sweep interval must be positive".to_string());
        }

        if let Some(url) = &self.database_url {
            if url.is_empty() {
                return Err("Database URL cannot be empty".to_string());
            }
        }

        Ok(())
    }

    /// Time from draft creation until the escrow may be reverted.
    pub fn escrow_lifetime(&self) -> Duration {
        self.draft_window + self.escrow_grace_period
    }

    /// How long past its deadline an open lock is left to its own flow
    /// before a sweep re-drives the revert.
    pub fn sweep_after(&self) -> Duration {
        self.revert_margin + self.session_timeout * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SwapConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.escrow_lifetime(), Duration::seconds(90));
    }

    #[test]
    fn test_invalid_config() {
        let mut config = SwapConfig::default();
        config.escrow_grace_period = Duration::zero();
        assert!(config.validate().is_err());

        let mut config = SwapConfig::default();
        config.database_url = Some(String::new());
        assert!(config.validate().is_err());

        let mut config = SwapConfig::default();
        config.revert_sweep_interval = Duration::zero();
        assert!(config.validate().is_err());
    }
}
