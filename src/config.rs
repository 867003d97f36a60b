//! Client and streaming configuration.
//!
//! Plain structs with defaults and builder-style setters. `build()` runs
//! `validate()` and hands the config back. [`load_client_config_from_env`]
//! reads overrides from `STREAMGATE_*` variables.

use crate::domain::services::RetryConfig;
use crate::domain::value_objects::{BackpressureStrategy, LoadBalancingStrategy, RetryStrategy};
use crate::error::ConfigError;
use crate::infrastructure::circuit_breaker::CircuitBreakerConfig;
use crate::infrastructure::health_checker::HealthCheckConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Settings for the stream coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Capacity of each per-stream buffer (default: 1000)
    pub max_buffer_size: usize,

    /// What a full buffer does with new items (default: Block)
    pub backpressure_strategy: BackpressureStrategy,

    /// Largest accepted message in bytes (default: 4 MiB)
    pub max_message_size: usize,

    /// Idle keepalive handed to transports (default: 30s)
    pub keepalive_timeout: Duration,

    /// Live streams allowed at once (default: 100)
    pub max_concurrent_streams: usize,

    /// Longest wait for the next upstream item (default: 300s)
    pub stream_timeout: Duration,

    /// Fail a stream when its buffer rejects an item (default: false)
    pub fail_on_backpressure: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 1000,
            backpressure_strategy: BackpressureStrategy::Block,
            max_message_size: 4 * 1024 * 1024,
            keepalive_timeout: Duration::from_secs(30),
            max_concurrent_streams: 100,
            stream_timeout: Duration::from_secs(300),
            fail_on_backpressure: false,
        }
    }
}

impl StreamingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-stream buffer capacity.
    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    /// Set the backpressure strategy.
    pub fn backpressure_strategy(mut self, strategy: BackpressureStrategy) -> Self {
        self.backpressure_strategy = strategy;
        self
    }

    /// Set the maximum message size in bytes.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.keepalive_timeout = timeout;
        self
    }

    /// Set the live stream limit.
    pub fn max_concurrent_streams(mut self, max: usize) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    /// Set the per-item upstream timeout.
    pub fn stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn fail_on_backpressure(mut self, fail: bool) -> Self {
        self.fail_on_backpressure = fail;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_buffer_size == 0 {
            return Err(ConfigError::NotPositive("streaming.max_buffer_size"));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::NotPositive("streaming.max_message_size"));
        }
        if self.keepalive_timeout.is_zero() {
            return Err(ConfigError::NotPositive("streaming.keepalive_timeout"));
        }
        if self.max_concurrent_streams == 0 {
            return Err(ConfigError::NotPositive("streaming.max_concurrent_streams"));
        }
        if self.stream_timeout.is_zero() {
            return Err(ConfigError::NotPositive("streaming.stream_timeout"));
        }
        Ok(())
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }
}

/// Settings for [`RpcClient`](crate::application::RpcClient).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Logical service name passed to discovery
    pub service_name: String,

    /// Per-attempt call timeout (default: 30s)
    pub timeout: Duration,

    /// Endpoint selection strategy (default: RoundRobin)
    pub load_balancing_strategy: LoadBalancingStrategy,

    pub retry: RetryConfig,

    pub circuit_breaker: CircuitBreakerConfig,

    pub health_check: HealthCheckConfig,

    /// Period of the discovery refresh loop (default: 30s)
    pub discovery_interval: Duration,

    pub streaming: StreamingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            timeout: Duration::from_secs(30),
            load_balancing_strategy: LoadBalancingStrategy::RoundRobin,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            health_check: HealthCheckConfig::default(),
            discovery_interval: Duration::from_secs(30),
            streaming: StreamingConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create a new configuration for `service_name`.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Set the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the load balancing strategy.
    pub fn load_balancing_strategy(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.load_balancing_strategy = strategy;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn health_check(mut self, health_check: HealthCheckConfig) -> Self {
        self.health_check = health_check;
        self
    }

    /// Set the discovery refresh period.
    pub fn discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    pub fn streaming(mut self, streaming: StreamingConfig) -> Self {
        self.streaming = streaming;
        self
    }

    /// Validate the configuration, nested sections included.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "service_name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::NotPositive("timeout"));
        }
        if self.discovery_interval.is_zero() {
            return Err(ConfigError::NotPositive("discovery_interval"));
        }
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.health_check.validate()?;
        self.streaming.validate()
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }
}

/// Load a [`ClientConfig`] for `service_name` from `STREAMGATE_*` variables.
///
/// Unset variables keep their defaults; malformed ones are errors.
pub fn load_client_config_from_env(service_name: &str) -> anyhow::Result<ClientConfig> {
    load_client_config_with(service_name, |key| std::env::var(key).ok())
}

/// Same as [`load_client_config_from_env`] but reading through `lookup`.
pub fn load_client_config_with<F>(service_name: &str, lookup: F) -> anyhow::Result<ClientConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };
    let defaults = ClientConfig::new(service_name);

    let retry = RetryConfig {
        enabled: env.flag("STREAMGATE_RETRY_ENABLED", defaults.retry.enabled)?,
        max_attempts: env.number("STREAMGATE_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
        strategy: env.parsed(
            "STREAMGATE_RETRY_STRATEGY",
            defaults.retry.strategy,
            RetryStrategy::parse,
        )?,
        base_delay: env.millis("STREAMGATE_RETRY_BASE_DELAY_MS", defaults.retry.base_delay)?,
        max_delay: env.millis("STREAMGATE_RETRY_MAX_DELAY_MS", defaults.retry.max_delay)?,
    };

    let circuit_breaker = CircuitBreakerConfig {
        failure_threshold: env.number(
            "STREAMGATE_CB_FAILURE_THRESHOLD",
            defaults.circuit_breaker.failure_threshold,
        )?,
        recovery_timeout: env.millis(
            "STREAMGATE_CB_RECOVERY_TIMEOUT_MS",
            defaults.circuit_breaker.recovery_timeout,
        )?,
        success_threshold: env.number(
            "STREAMGATE_CB_SUCCESS_THRESHOLD",
            defaults.circuit_breaker.success_threshold,
        )?,
    };

    let health_check = HealthCheckConfig {
        interval: env.millis("STREAMGATE_HEALTH_INTERVAL_MS", defaults.health_check.interval)?,
        timeout: env.millis("STREAMGATE_HEALTH_TIMEOUT_MS", defaults.health_check.timeout)?,
        ..defaults.health_check.clone()
    };

    let streaming = StreamingConfig {
        max_buffer_size: env.number(
            "STREAMGATE_MAX_BUFFER_SIZE",
            defaults.streaming.max_buffer_size,
        )?,
        backpressure_strategy: env.parsed(
            "STREAMGATE_BACKPRESSURE",
            defaults.streaming.backpressure_strategy,
            BackpressureStrategy::parse,
        )?,
        max_message_size: env.number(
            "STREAMGATE_MAX_MESSAGE_SIZE",
            defaults.streaming.max_message_size,
        )?,
        keepalive_timeout: env.millis(
            "STREAMGATE_KEEPALIVE_TIMEOUT_MS",
            defaults.streaming.keepalive_timeout,
        )?,
        max_concurrent_streams: env.number(
            "STREAMGATE_MAX_CONCURRENT_STREAMS",
            defaults.streaming.max_concurrent_streams,
        )?,
        stream_timeout: env.millis(
            "STREAMGATE_STREAM_TIMEOUT_MS",
            defaults.streaming.stream_timeout,
        )?,
        fail_on_backpressure: env.flag(
            "STREAMGATE_FAIL_ON_BACKPRESSURE",
            defaults.streaming.fail_on_backpressure,
        )?,
    };

    let config = ClientConfig {
        service_name: service_name.to_string(),
        timeout: env.millis("STREAMGATE_TIMEOUT_MS", defaults.timeout)?,
        load_balancing_strategy: env.parsed(
            "STREAMGATE_LB_STRATEGY",
            defaults.load_balancing_strategy,
            LoadBalancingStrategy::parse,
        )?,
        retry,
        circuit_breaker,
        health_check,
        discovery_interval: env.millis(
            "STREAMGATE_DISCOVERY_INTERVAL_MS",
            defaults.discovery_interval,
        )?,
        streaming,
    };

    config
        .validate()
        .with_context(|| format!("invalid client configuration for {}", service_name))?;
    Ok(config)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T>(
        &self,
        key: &'static str,
        default: T,
        parse: impl Fn(&str) -> Option<T>,
    ) -> anyhow::Result<T> {
        match (self.lookup)(key) {
            None => Ok(default),
            Some(raw) => parse(raw.trim())
                .ok_or_else(|| ConfigError::Invalid {
                    field: key,
                    reason: format!("unrecognized value {:?}", raw),
                })
                .with_context(|| format!("failed to read {}", key)),
        }
    }

    fn number<T: FromStr>(&self, key: &'static str, default: T) -> anyhow::Result<T> {
        self.parsed(key, default, |s| s.parse().ok())
    }

    fn millis(&self, key: &'static str, default: Duration) -> anyhow::Result<Duration> {
        self.parsed(key, default, |s| s.parse().ok().map(Duration::from_millis))
    }

    fn flag(&self, key: &'static str, default: bool) -> anyhow::Result<bool> {
        self.parsed(key, default, |s| match s.to_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        })
    }
}
