//! Retry backoff policies.
//!
//! The retry *budget* lives on the task (`max_retries`); the policy only
//! decides how long to wait before each re-enqueue. Jitter spreads the
//! re-enqueue times of simultaneously failing tasks so they do not land on
//! the queue as a thundering herd.

use crate::config::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Re-enqueue immediately.
    Immediate,
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff.
    Exponential,
    /// Linear backoff.
    Linear,
}

/// Retry backoff policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Backoff strategy.
    pub strategy: RetryStrategy,

    /// Initial delay in milliseconds.
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds (ceiling).
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff.
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1))
    }
}

impl RetryPolicy {
    /// Immediate re-enqueue, no delay.
    #[must_use]
    pub const fn immediate() -> Self {
        Self {
            strategy: RetryStrategy::Immediate,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Fixed delay between retries.
    #[must_use]
    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            strategy: RetryStrategy::Fixed,
            initial_delay_ms: ms,
            max_delay_ms: ms,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Exponential backoff with jitter, capped at five minutes.
    #[must_use]
    pub fn exponential(initial: Duration) -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            initial_delay_ms: initial.as_millis() as u64,
            max_delay_ms: 300_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    /// Linear backoff.
    #[must_use]
    pub fn linear(increment: Duration) -> Self {
        let ms = increment.as_millis() as u64;
        Self {
            strategy: RetryStrategy::Linear,
            initial_delay_ms: ms,
            max_delay_ms: ms * 60,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Sets the delay ceiling.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Sets the jitter factor, clamped to [0, 1].
    #[must_use]
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Disables jitter.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// Delay before the given retry attempt (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.strategy == RetryStrategy::Immediate {
            return Duration::ZERO;
        }

        let base_delay = match self.strategy {
            RetryStrategy::Immediate => 0,
            RetryStrategy::Fixed => self.initial_delay_ms,
            RetryStrategy::Exponential => {
                let exp = attempt - 1;
                (self.initial_delay_ms as f64 * self.multiplier.powi(exp as i32)) as u64
            }
            RetryStrategy::Linear => self.initial_delay_ms * u64::from(attempt),
        };

        let capped = base_delay.min(self.max_delay_ms);

        let final_delay = if self.jitter_factor > 0.0 {
            let jitter_range = (capped as f64 * self.jitter_factor) as u64;
            let jitter = rand_jitter(jitter_range);
            capped.saturating_add(jitter).saturating_sub(jitter_range / 2)
        } else {
            capped
        };

        Duration::from_millis(final_delay)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms,
            multiplier: config.multiplier,
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
        }
    }
}

/// Generate random jitter using a simple LCG seeded from the clock.
fn rand_jitter(range: u64) -> u64 {
    use std::time::SystemTime;

    if range == 0 {
        return 0;
    }

    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    let a: u64 = 6364136223846793005;
    let c: u64 = 1442695040888963407;

    seed.wrapping_mul(a).wrapping_add(c) % range
}
