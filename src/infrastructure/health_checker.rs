//! Active Health Checker
//!
//! Periodically probes every endpoint in the pool through a [`HealthProbe`]
//! and flips the endpoint's health flag when the thresholds are crossed.

use crate::domain::entities::Endpoint;
use crate::domain::ports::HealthProbe;
use crate::domain::services::EndpointPool;
use crate::domain::value_objects::EndpointAddress;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};

/// Health check configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Interval between health checks
    pub interval: Duration,
    /// Timeout for each probe
    pub timeout: Duration,
    /// Number of consecutive failures before marking unhealthy
    pub unhealthy_threshold: u32,
    /// Number of consecutive successes before marking healthy
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            unhealthy_threshold: 1,
            healthy_threshold: 1,
        }
    }
}

impl HealthCheckConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::NotPositive("health_check.interval"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::NotPositive("health_check.timeout"));
        }
        if self.unhealthy_threshold == 0 {
            return Err(ConfigError::NotPositive("health_check.unhealthy_threshold"));
        }
        if self.healthy_threshold == 0 {
            return Err(ConfigError::NotPositive("health_check.healthy_threshold"));
        }
        Ok(())
    }
}

/// Health status for an endpoint.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Whether the endpoint is healthy
    pub healthy: bool,
    /// Last check timestamp
    pub last_check: Instant,
    /// Last check latency
    pub latency_ms: Option<u64>,
    /// Consecutive failures
    pub consecutive_failures: u32,
    /// Consecutive successes
    pub consecutive_successes: u32,
    /// Last error message
    pub last_error: Option<String>,
}

impl HealthStatus {
    fn starting_from(healthy: bool) -> Self {
        Self {
            healthy,
            last_check: Instant::now(),
            latency_ms: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_error: None,
        }
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::starting_from(true)
    }
}

/// Result of a health check.
#[derive(Debug, Clone)]
pub enum HealthCheckResult {
    Success { latency_ms: u64 },
    Failure { error: String, latency_ms: u64 },
}

impl HealthCheckResult {
    pub fn is_success(&self) -> bool {
        matches!(self, HealthCheckResult::Success { .. })
    }
}

type HealthChangeCallback = Arc<dyn Fn(&EndpointAddress, bool) + Send + Sync>;

/// Active health checker for pool endpoints.
pub struct HealthChecker {
    config: HealthCheckConfig,
    probe: Arc<dyn HealthProbe>,
    /// Health status per endpoint address
    status: Arc<RwLock<HashMap<EndpointAddress, HealthStatus>>>,
    /// Callback when health changes
    on_health_change: Option<HealthChangeCallback>,
}

impl HealthChecker {
    /// Create a new health checker.
    pub fn new(config: HealthCheckConfig, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            config,
            probe,
            status: Arc::new(RwLock::new(HashMap::new())),
            on_health_change: None,
        }
    }

    /// Set callback for health status changes.
    pub fn on_health_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(&EndpointAddress, bool) + Send + Sync + 'static,
    {
        self.on_health_change = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Get health status for an endpoint.
    pub async fn get_status(&self, address: &EndpointAddress) -> Option<HealthStatus> {
        self.status.read().await.get(address).cloned()
    }

    /// Check if an endpoint is healthy.
    pub async fn is_healthy(&self, address: &EndpointAddress) -> bool {
        self.status
            .read()
            .await
            .get(address)
            .map(|s| s.healthy)
            .unwrap_or(true) // Default to healthy if not checked yet
    }

    /// Get all health statuses.
    pub async fn all_statuses(&self) -> HashMap<EndpointAddress, HealthStatus> {
        self.status.read().await.clone()
    }

    /// Probe a single endpoint, bounded by the configured timeout.
    pub async fn check_endpoint(&self, endpoint: &Endpoint) -> HealthCheckResult {
        let start = Instant::now();
        let result = tokio::time::timeout(self.config.timeout, self.probe.check(endpoint)).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(true) => HealthCheckResult::Success { latency_ms },
            Ok(false) => HealthCheckResult::Failure {
                error: "probe reported unhealthy".to_string(),
                latency_ms,
            },
            Err(_) => HealthCheckResult::Failure {
                error: "probe timeout".to_string(),
                latency_ms,
            },
        }
    }

    /// Probe every endpoint in the pool once.
    ///
    /// Returns the number of endpoints whose health flag changed. Status
    /// entries of endpoints that left the pool are dropped.
    pub async fn check_all(&self, pool: &EndpointPool) -> usize {
        let endpoints = pool.snapshot();
        let mut changed = 0;

        for endpoint in endpoints.iter() {
            let result = self.check_endpoint(endpoint).await;
            if self.update_status(endpoint, result).await {
                changed += 1;
            }
        }

        self.status
            .write()
            .await
            .retain(|addr, _| endpoints.iter().any(|e| e.address() == addr));

        changed
    }

    /// Run checks every `interval` until shutdown is signalled.
    pub async fn run(self: Arc<Self>, pool: Arc<EndpointPool>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let changed = self.check_all(&pool).await;
                    if changed > 0 {
                        tracing::debug!("health check pass changed {} endpoints", changed);
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("health check loop stopping");
                    break;
                }
            }
        }
    }

    /// Update health status based on check result. Returns true on a flip.
    async fn update_status(&self, endpoint: &Endpoint, result: HealthCheckResult) -> bool {
        let address = endpoint.address();
        let mut statuses = self.status.write().await;
        let entry = statuses
            .entry(address.clone())
            .or_insert_with(|| HealthStatus::starting_from(endpoint.is_healthy()));

        let was_healthy = entry.healthy;

        match result {
            HealthCheckResult::Success { latency_ms } => {
                entry.consecutive_successes += 1;
                entry.consecutive_failures = 0;
                entry.latency_ms = Some(latency_ms);
                entry.last_error = None;

                if !entry.healthy && entry.consecutive_successes >= self.config.healthy_threshold {
                    entry.healthy = true;
                    tracing::info!("endpoint {} is now healthy", address);
                }
            }
            HealthCheckResult::Failure { error, latency_ms } => {
                entry.consecutive_failures += 1;
                entry.consecutive_successes = 0;
                entry.latency_ms = Some(latency_ms);

                if entry.healthy && entry.consecutive_failures >= self.config.unhealthy_threshold {
                    entry.healthy = false;
                    tracing::warn!("endpoint {} is now unhealthy: {}", address, error);
                }
                entry.last_error = Some(error);
            }
        }

        entry.last_check = Instant::now();
        let healthy = entry.healthy;
        drop(statuses);

        endpoint.set_healthy(healthy);

        if was_healthy != healthy {
            if let Some(callback) = &self.on_health_change {
                callback(address, healthy);
            }
            return true;
        }
        false
    }
}
