//! Reconnect backoff policy.
//!
//! Computes the delay before reconnect attempt `n` as
//! `min(base * 2^n + jitter, max)`. The jitter term is a uniform random
//! offset in `[0, jitter_cap]` so that a plant-wide network blip does not
//! make every dashboard reconnect on the same tick.

// Rust guideline compliant 2026-02

use std::time::Duration;

use rand::Rng;

use crate::config::ChannelConfig;

/// Exponential backoff policy for reconnect scheduling.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Base delay (attempt 0 waits roughly this long).
    pub base_delay: Duration,
    /// Cap applied after the jitter term.
    pub max_delay: Duration,
    /// Attempts allowed before the channel gives up.
    pub max_attempts: u32,
    /// Upper bound on the random jitter. Zero disables jitter.
    pub jitter: Duration,
}

impl ReconnectPolicy {
    /// Build a policy from the channel configuration.
    #[must_use]
    pub fn from_config(config: &ChannelConfig) -> Self {
        Self {
            base_delay: config.reconnect_base_delay,
            max_delay: config.reconnect_max_delay,
            max_attempts: config.max_reconnect_attempts,
            jitter: config.reconnect_jitter,
        }
    }

    /// Whether another automatic attempt is allowed at this count.
    #[must_use]
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before reconnect attempt `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = 2u32
            .checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        let jittered = exponential + self.jitter_offset();
        jittered.min(self.max_delay)
    }

    /// Uniform random offset in `[0, jitter]`.
    fn jitter_offset(&self) -> Duration {
        if self.jitter.is_zero() {
            return Duration::ZERO;
        }
        let cap_ms = self.jitter.as_millis().min(u128::from(u64::MAX)) as u64;
        Duration::from_millis(rand::rng().random_range(0..=cap_ms))
    }
}
