//! Discovery Port
//!
//! Defines the interface for resolving a service name to endpoints.
//! Implementations may use DNS, a registry, or a fixed list.

use crate::domain::entities::DiscoveredEndpoint;
use crate::error::BoxError;
use async_trait::async_trait;

/// Source of endpoint lists for a service.
///
/// Called periodically by the client's refresh loop; the returned list
/// replaces the pool contents.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    async fn discover(&self, service: &str) -> Result<Vec<DiscoveredEndpoint>, BoxError>;
}

/// Discovery source that always returns the same list.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    endpoints: Vec<DiscoveredEndpoint>,
}

impl StaticDiscovery {
    pub fn new(endpoints: Vec<DiscoveredEndpoint>) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl DiscoverySource for StaticDiscovery {
    async fn discover(&self, _service: &str) -> Result<Vec<DiscoveredEndpoint>, BoxError> {
        Ok(self.endpoints.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_discovery_returns_list() {
        let source = StaticDiscovery::new(vec![
            DiscoveredEndpoint::new("a", 1),
            DiscoveredEndpoint::new("b", 2),
        ]);
        let found = source.discover("any").await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].address, "b");
    }
}
