//! Load Balancer Service
//!
//! Picks one healthy endpoint per call from an [`EndpointPool`] and keeps
//! the per-endpoint load and outcome counters up to date.

use crate::domain::entities::Endpoint;
use crate::domain::services::EndpointPool;
use crate::domain::value_objects::LoadBalancingStrategy;
use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Load balancer over one endpoint pool.
///
/// Only healthy endpoints are ever returned. Strategies:
/// 1. RoundRobin: persistent cursor over the healthy snapshot
/// 2. Random: uniform
/// 3. LeastConnections: fewest in-flight calls
/// 4. WeightedRoundRobin: random, proportional to weight
/// 5. HealthBased: best success rate, then fastest
pub struct LoadBalancer {
    pool: Arc<EndpointPool>,
    strategy: LoadBalancingStrategy,
    /// Round-robin cursor. Never reset when the healthy set changes size.
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(pool: Arc<EndpointPool>, strategy: LoadBalancingStrategy) -> Self {
        Self {
            pool,
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn pool(&self) -> &Arc<EndpointPool> {
        &self.pool
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    /// Select an endpoint for the next call.
    ///
    /// # Returns
    /// The chosen endpoint, or None if no endpoint is healthy. Callers treat
    /// None as "service unavailable".
    pub fn get_endpoint(&self) -> Option<Arc<Endpoint>> {
        let healthy = self.pool.healthy_endpoints();
        if healthy.is_empty() {
            return None;
        }

        let picked = match self.strategy {
            LoadBalancingStrategy::RoundRobin => {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
                healthy[idx].clone()
            }
            LoadBalancingStrategy::Random => healthy.choose(&mut rand::thread_rng())?.clone(),
            LoadBalancingStrategy::LeastConnections => healthy
                .iter()
                .min_by_key(|e| e.active_connections())?
                .clone(),
            LoadBalancingStrategy::WeightedRoundRobin => Self::pick_weighted(&healthy)?,
            LoadBalancingStrategy::HealthBased => healthy
                .iter()
                .min_by(|a, b| Self::compare_health(a, b))?
                .clone(),
        };

        tracing::debug!(
            "selected endpoint {} ({:?})",
            picked.address(),
            self.strategy
        );
        Some(picked)
    }

    /// Weighted random choice; all-zero weights degrade to uniform.
    fn pick_weighted(healthy: &[Arc<Endpoint>]) -> Option<Arc<Endpoint>> {
        let mut rng = rand::thread_rng();
        match WeightedIndex::new(healthy.iter().map(|e| e.weight())) {
            Ok(dist) => Some(healthy[dist.sample(&mut rng)].clone()),
            Err(_) => healthy.choose(&mut rng).cloned(),
        }
    }

    /// Orders by `(-success_rate, avg_response_time_ms)`.
    fn compare_health(a: &Endpoint, b: &Endpoint) -> CmpOrdering {
        b.success_rate()
            .partial_cmp(&a.success_rate())
            .unwrap_or(CmpOrdering::Equal)
            .then_with(|| {
                a.avg_response_time_ms()
                    .partial_cmp(&b.avg_response_time_ms())
                    .unwrap_or(CmpOrdering::Equal)
            })
    }

    /// Mark a call as started on `endpoint`.
    pub fn record_request_start(&self, endpoint: &Endpoint) {
        endpoint.begin_request();
    }

    /// Mark a call as finished on `endpoint`.
    pub fn record_request_end(&self, endpoint: &Endpoint, success: bool, duration_ms: f64) {
        endpoint.end_request(success, duration_ms);
    }

    /// Release a call that was abandoned before it finished.
    ///
    /// Frees the connection slot but leaves the success and error counts
    /// and the response time untouched.
    pub fn record_request_abandoned(&self, endpoint: &Endpoint) {
        endpoint.abandon_request();
    }
}
