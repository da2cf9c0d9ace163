//! Retry scheduling for transient failures.

use std::time::Duration;

use crate::config::SyncConfig;

/// Exponential backoff with a ceiling. There is no give-up limit; the
/// warning threshold only decides when observers are told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub warning_threshold: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
            warning_threshold: config.retry_warning_threshold,
        }
    }

    /// Delay before the next attempt after `attempts` failed dispatches:
    /// `base * 2^(attempts - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether this failure is the one that crosses the warning threshold.
    pub fn should_warn(&self, attempts: u32) -> bool {
        attempts == self.warning_threshold
    }
}
