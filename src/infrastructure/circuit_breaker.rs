//! Circuit Breaker Pattern
//!
//! Prevents cascading failures by temporarily rejecting calls to a failing
//! target.

use crate::error::ConfigError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening the circuit
    pub failure_threshold: u32,
    /// Time since the last failure before a trial call is let through
    pub recovery_timeout: Duration,
    /// Number of successes in half-open to close circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::NotPositive("circuit_breaker.failure_threshold"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::NotPositive("circuit_breaker.success_threshold"));
        }
        Ok(())
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests allowed
    #[default]
    Closed,
    /// Circuit tripped - requests blocked
    Open,
    /// Testing recovery - trial requests allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Default)]
struct CircuitInner {
    state: CircuitState,
    failure_count: u32,
    /// Trial successes while half-open
    success_count: u32,
    last_failure: Option<Instant>,
}

/// Circuit breaker for one logical target.
///
/// Shared by all concurrent calls to that target. Open -> HalfOpen is
/// lazy: it happens on the first `should_allow_request` after the recovery
/// timeout, there is no background timer.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(CircuitInner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check if a call is allowed. Call before every attempt.
    ///
    /// Returns true if allowed, false if circuit is open.
    pub fn should_allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let recovered = inner
                    .last_failure
                    .map(|t| t.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);

                if recovered {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    tracing::info!("circuit breaker for {} transitioning to half-open", self.name);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    tracing::info!("circuit breaker for {} closed (recovered)", self.name);
                }
            }
            CircuitState::Closed => {
                // Decay one failure per success
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
            CircuitState::Open => {
                // Late completion of a call admitted before the circuit opened
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    tracing::warn!(
                        "circuit breaker for {} opened after {} failures",
                        self.name,
                        inner.failure_count
                    );
                }
            }
            CircuitState::HalfOpen => {
                // Any failure in half-open immediately re-opens
                inner.state = CircuitState::Open;
                inner.failure_count += 1;
                inner.success_count = 0;
                tracing::warn!(
                    "circuit breaker for {} re-opened (failed in half-open)",
                    self.name
                );
            }
            CircuitState::Open => {
                // Already open; the refreshed timestamp extends the timeout
                inner.failure_count += 1;
            }
        }
    }

    /// Current state without triggering the lazy Open -> HalfOpen move.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Full state snapshot.
    pub fn get_state(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure: inner.last_failure,
        }
    }

    /// Manually reset the circuit to closed.
    pub fn reset(&self) {
        *self.inner.lock() = CircuitInner::default();
        tracing::info!("circuit breaker for {} manually reset", self.name);
    }
}

/// Snapshot of a circuit.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    #[serde(skip)]
    pub last_failure: Option<Instant>,
}
