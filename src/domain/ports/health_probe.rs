//! Health Probe Port
//!
//! Defines the interface for checking a single endpoint's health.

use crate::domain::entities::Endpoint;
use async_trait::async_trait;

/// Active health check for one endpoint.
///
/// The health checker wraps every call in its own timeout; a probe that
/// does not answer in time counts as unhealthy.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, endpoint: &Endpoint) -> bool;
}
