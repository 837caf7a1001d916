//! Reconnect backoff policy.
//!
//! Exponential backoff with jitter for connection recovery attempts.

use std::time::Duration;

/// Backoff configuration for connection attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound on any single delay in milliseconds
    pub max_delay_ms: u64,
    /// Give up after this many attempts; `None` retries forever
    pub max_attempts: Option<u32>,
    /// Scale each delay by a random factor in [0.5, 1.0]
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: None,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Policy with fixed delays and no jitter, capped at `max_attempts`.
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        Self {
            base_delay_ms: millis,
            max_delay_ms: millis,
            max_attempts: Some(max_attempts),
            jitter: false,
        }
    }

    /// Whether attempt number `attempt` (0-based) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }

    /// Delay to wait before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let base = self.base_delay_ms.saturating_mul(factor);
        let capped = base.min(self.max_delay_ms);

        if !self.jitter {
            return Duration::from_millis(capped);
        }

        // Jitter keeps 50-100% of the delay
        let jitter_factor = 0.5 + (rand::random::<f64>() * 0.5);
        Duration::from_millis((capped as f64 * jitter_factor) as u64)
    }
}
