//! Endpoint Pool
//!
//! Set of candidate endpoints for one service, keyed by address.

use crate::domain::entities::{DiscoveredEndpoint, Endpoint, EndpointSnapshot};
use crate::domain::value_objects::EndpointAddress;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

/// Copy-on-write list of endpoints.
///
/// Readers take a cheap `Arc` snapshot of the list; writers build a new
/// list and swap it in. Per-endpoint counters are atomics mutated in place,
/// so a snapshot keeps observing live health and load.
#[derive(Debug, Default)]
pub struct EndpointPool {
    endpoints: RwLock<Arc<Vec<Arc<Endpoint>>>>,
}

impl EndpointPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current list of endpoints.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Endpoint>>> {
        self.endpoints.read().clone()
    }

    /// Endpoints currently marked healthy, in pool order.
    pub fn healthy_endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.snapshot()
            .iter()
            .filter(|e| e.is_healthy())
            .cloned()
            .collect()
    }

    pub fn get(&self, address: &EndpointAddress) -> Option<Arc<Endpoint>> {
        self.snapshot()
            .iter()
            .find(|e| e.address() == address)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add an endpoint.
    ///
    /// Returns false if an endpoint with the same address is already
    /// present; the existing one is kept.
    pub fn add_endpoint(&self, endpoint: Endpoint) -> bool {
        let mut guard = self.endpoints.write();
        if guard.iter().any(|e| e.address() == endpoint.address()) {
            return false;
        }
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        tracing::debug!("endpoint {} added to pool", endpoint.address());
        next.push(Arc::new(endpoint));
        *guard = Arc::new(next);
        true
    }

    /// Remove an endpoint by address. Returns the removed endpoint.
    pub fn remove_endpoint(&self, address: &EndpointAddress) -> Option<Arc<Endpoint>> {
        let mut guard = self.endpoints.write();
        let pos = guard.iter().position(|e| e.address() == address)?;
        let mut next: Vec<_> = guard.iter().cloned().collect();
        let removed = next.remove(pos);
        *guard = Arc::new(next);
        tracing::debug!("endpoint {} removed from pool", address);
        Some(removed)
    }

    /// Replace the whole set with a discovered list.
    ///
    /// Endpoints whose address survives the update keep their counters and
    /// their current health; only their weight is taken from the discovery
    /// record. The discovered health seeds new endpoints.
    /// Duplicate addresses in `discovered` are collapsed (first wins).
    pub fn update_endpoints(&self, discovered: &[DiscoveredEndpoint]) {
        let mut guard = self.endpoints.write();
        let mut seen = HashSet::with_capacity(discovered.len());
        let mut next = Vec::with_capacity(discovered.len());

        for d in discovered {
            let address = EndpointAddress::new(d.address.clone(), d.port);
            if !seen.insert(address.clone()) {
                continue;
            }
            match guard.iter().find(|e| *e.address() == address) {
                Some(existing) => {
                    existing.set_weight(d.weight);
                    next.push(existing.clone());
                }
                None => next.push(Arc::new(Endpoint::from_discovered(d))),
            }
        }

        let before = guard.len();
        *guard = Arc::new(next);
        tracing::debug!(
            "endpoint pool updated: {} -> {} endpoints",
            before,
            guard.len()
        );
    }

    /// Set health of an endpoint by address. Returns the previous value.
    pub fn set_healthy(&self, address: &EndpointAddress, healthy: bool) -> Option<bool> {
        self.get(address).map(|e| e.set_healthy(healthy))
    }

    pub fn snapshots(&self) -> Vec<EndpointSnapshot> {
        self.snapshot().iter().map(|e| e.snapshot()).collect()
    }
}
