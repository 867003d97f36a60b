//! Rate Limiter
//!
//! Fixed-window request limiting that suspends callers instead of
//! rejecting them.

use crate::error::ConfigError;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Maximum requests per window
    pub max_requests: u32,
    /// Window length; the counter resets when it rolls over
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(1),
        }
    }
}

impl RateLimitConfig {
    /// `max_requests_per_second` over a 1 second window.
    pub fn per_second(max_requests_per_second: u32) -> Self {
        Self {
            max_requests: max_requests_per_second,
            window: Duration::from_secs(1),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_requests == 0 {
            return Err(ConfigError::NotPositive("rate_limit.max_requests"));
        }
        if self.window.is_zero() {
            return Err(ConfigError::NotPositive("rate_limit.window"));
        }
        Ok(())
    }
}

struct WindowState {
    window_start: Instant,
    count: u32,
}

/// Rolling-window limiter.
///
/// The internal lock is held while a caller sleeps out the window, so
/// waiting callers are admitted one by one in arrival order.
pub struct WindowRateLimiter {
    config: RateLimitConfig,
    state: Mutex<WindowState>,
}

impl WindowRateLimiter {
    /// Create a new rate limiter.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(WindowState {
                window_start: Instant::now(),
                count: 0,
            }),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Take one permit, sleeping until the next window if this one is spent.
    ///
    /// Returns how long the caller was suspended.
    pub async fn acquire(&self) -> Duration {
        let mut state = self.state.lock().await;
        let mut waited = Duration::ZERO;

        let elapsed = state.window_start.elapsed();
        if elapsed >= self.config.window {
            state.window_start = Instant::now();
            state.count = 0;
        } else if state.count >= self.config.max_requests {
            waited = self.config.window - elapsed;
            tracing::debug!("rate limit reached, waiting {:?}", waited);
            tokio::time::sleep(waited).await;
            state.window_start = Instant::now();
            state.count = 0;
        }

        state.count += 1;
        waited
    }

    /// Take one permit only if available right now.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut state) = self.state.try_lock() else {
            return false;
        };

        if state.window_start.elapsed() >= self.config.window {
            state.window_start = Instant::now();
            state.count = 0;
        }

        if state.count < self.config.max_requests {
            state.count += 1;
            true
        } else {
            false
        }
    }

    /// Permits left in the current window.
    pub async fn remaining(&self) -> u32 {
        let state = self.state.lock().await;
        if state.window_start.elapsed() >= self.config.window {
            self.config.max_requests
        } else {
            self.config.max_requests.saturating_sub(state.count)
        }
    }
}

impl Default for WindowRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
