//! Retry backoff policy for blocking acquisition
//!
//! Many object stores cap writes to a single object at roughly one per second,
//! so contenders must spread their attempts out: capped exponential delays
//! with random jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff configuration between `try_lock` attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    /// Upper bound for the un-jittered delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Backoff multiplier
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_initial_delay() -> u64 {
    250
}

fn default_max_delay() -> u64 {
    5000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffConfig {
    /// Fixed-rate policy without growth or jitter
    pub fn constant(delay: Duration) -> Self {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        Self {
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Check the policy is usable
    pub fn validate(&self) -> Result<(), String> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(format!(
                "backoff multiplier must be >= 1.0, got {}",
                self.multiplier
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(format!(
                "backoff jitter must be within [0.0, 1.0], got {}",
                self.jitter
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(format!(
                "backoff initial delay ({}ms) exceeds max delay ({}ms)",
                self.initial_delay_ms, self.max_delay_ms
            ));
        }
        Ok(())
    }

    /// Calculate delay for a given retry attempt (0-indexed, attempt 0 has no delay)
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let ceiling = self.max_delay_ms as f64;
        let nominal =
            (self.initial_delay_ms as f64 * self.multiplier.powi(exponent)).min(ceiling);

        // Spread contenders over [nominal * (1 - jitter), nominal * (1 + jitter)]
        let spread = nominal * self.jitter;
        let millis = if spread > 0.0 {
            rand::rng().random_range(nominal - spread..=nominal + spread)
        } else {
            nominal
        };

        Duration::from_millis(millis.max(0.0).round() as u64)
    }
}
