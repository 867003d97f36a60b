//! Retry Policy
//!
//! Decides whether a failed attempt may be retried and how long to wait.

use crate::domain::value_objects::RetryStrategy;
use crate::error::ConfigError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Whether failed calls are retried at all
    pub enabled: bool,
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Backoff growth
    pub strategy: RetryStrategy,
    /// Delay unit for all strategies
    pub base_delay: Duration,
    /// Upper bound for any computed delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            strategy: RetryStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::NotPositive("retry.max_attempts"));
        }
        if self.base_delay.is_zero() {
            return Err(ConfigError::NotPositive("retry.base_delay"));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::Invalid {
                field: "retry.max_delay",
                reason: "must not be smaller than base_delay".to_string(),
            });
        }
        Ok(())
    }
}

/// Backoff calculator.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether attempt number `attempt` (0-based) may run.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.config.enabled && attempt < self.config.max_attempts
    }

    /// Delay to wait after failed attempt `attempt` (0-based).
    ///
    /// - Fixed: `base`
    /// - Linear: `base * (attempt + 1)`
    /// - Exponential: `base * 2^attempt` plus 10-30% jitter
    ///
    /// Always capped at `max_delay`.
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_secs_f64();

        let delay = match self.config.strategy {
            RetryStrategy::Fixed => base,
            RetryStrategy::Linear => base * (attempt as f64 + 1.0),
            RetryStrategy::Exponential => {
                let raw = base * 2f64.powi(attempt.min(62) as i32);
                let jitter = rand::thread_rng().gen_range(0.1..0.3);
                raw + raw * jitter
            }
        };

        let max = self.config.max_delay.as_secs_f64();
        Duration::from_secs_f64(delay.min(max))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
