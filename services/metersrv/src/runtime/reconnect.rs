//! Reconnection policy
//!
//! Delay schedule for the background reconnect loop of a
//! [`ConnectionManager`](super::ConnectionManager). The default reproduces a
//! fixed five second retry forever; exponential backoff and jitter are opt-in.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Reconnection policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Maximum attempts per reconnect run (0 means unlimited)
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Backoff multiplier (1.0 keeps the delay fixed)
    pub backoff_multiplier: f64,
    /// Whether to add ±25% jitter to delays
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

impl ReconnectPolicy {
    /// Create from configuration values
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }

    /// Whether `attempts` consecutive failures use up the policy
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }

    /// Delay to wait after the `attempt`-th consecutive failure (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;

        // Exponential backoff: delay = initial_delay * (multiplier ^ (attempt - 1))
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let scaled_secs = self.initial_delay.as_secs_f64() * factor;

        // Cap at maximum delay
        let mut delay = if !scaled_secs.is_finite() || scaled_secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            self.initial_delay.mul_f64(factor)
        };

        // Add jitter (±25% of delay)
        if self.jitter {
            let jitter_range = delay.as_millis() as f64 * 0.25;
            if jitter_range > 0.0 {
                let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
                let delay_ms = (delay.as_millis() as f64 + jitter).max(0.0);
                delay = Duration::from_millis(delay_ms as u64);
            }
        }

        delay
    }
}

/// Reconnect section of the configuration file, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: 5000,
            max_delay_ms: 60_000,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_delay_ms == 0 {
            return Err("initial_delay_ms must be greater than 0".to_string());
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err("max_delay_ms must not be less than initial_delay_ms".to_string());
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err("backoff_multiplier must be at least 1.0".to_string());
        }
        Ok(())
    }
}
