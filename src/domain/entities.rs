//! Domain Entities - Core business objects
//!
//! These entities represent the core concepts of the streaming and client
//! domain. They have no I/O and contain only state and bookkeeping.

use crate::domain::value_objects::{EndpointAddress, StreamPattern, StreamState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// A remote endpoint that can receive calls.
///
/// Identity is the address. Everything else is mutable health state,
/// updated in place after every call so that a shared `Arc<Endpoint>`
/// held by an in-flight call keeps reporting into the same counters.
#[derive(Debug)]
pub struct Endpoint {
    address: EndpointAddress,
    /// Relative weight for weighted selection
    weight: AtomicU32,
    healthy: AtomicBool,
    active_connections: AtomicUsize,
    success_count: AtomicU64,
    error_count: AtomicU64,
    /// Smoothed response time, `(old + new) / 2` on every completed call
    avg_response_time_ms: Mutex<f64>,
}

impl Endpoint {
    pub fn new(address: EndpointAddress, weight: u32) -> Self {
        Self {
            address,
            weight: AtomicU32::new(weight),
            healthy: AtomicBool::new(true),
            active_connections: AtomicUsize::new(0),
            success_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            avg_response_time_ms: Mutex::new(0.0),
        }
    }

    /// Build from a discovery record.
    pub fn from_discovered(d: &DiscoveredEndpoint) -> Self {
        let ep = Self::new(EndpointAddress::new(d.address.clone(), d.port), d.weight);
        ep.set_healthy(d.healthy);
        ep
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight, Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Set health, returning the previous value.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::AcqRel)
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn avg_response_time_ms(&self) -> f64 {
        *self.avg_response_time_ms.lock()
    }

    /// Fraction of completed calls that succeeded.
    ///
    /// An endpoint with no completed calls counts as fully successful so
    /// that fresh endpoints are not starved by health-based selection.
    pub fn success_rate(&self) -> f64 {
        let ok = self.success_count() as f64;
        let total = ok + self.error_count() as f64;
        if total == 0.0 {
            1.0
        } else {
            ok / total
        }
    }

    pub(crate) fn begin_request(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn end_request(&self, success: bool, duration_ms: f64) {
        self.release_connection();

        {
            let mut avg = self.avg_response_time_ms.lock();
            *avg = (*avg + duration_ms) / 2.0;
        }

        if success {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Give back the connection of a call that never completed, without
    /// counting an outcome.
    pub(crate) fn abandon_request(&self) {
        self.release_connection();
    }

    /// Saturating decrement of `active_connections`.
    fn release_connection(&self) {
        let mut current = self.active_connections.load(Ordering::Relaxed);
        while current > 0 {
            match self.active_connections.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(c) => current = c,
            }
        }
    }

    /// Copy the current state.
    pub fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            address: self.address.clone(),
            weight: self.weight(),
            healthy: self.is_healthy(),
            active_connections: self.active_connections(),
            success_count: self.success_count(),
            error_count: self.error_count(),
            avg_response_time_ms: self.avg_response_time_ms(),
        }
    }
}

/// Point-in-time copy of an [`Endpoint`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSnapshot {
    pub address: EndpointAddress,
    pub weight: u32,
    pub healthy: bool,
    pub active_connections: usize,
    pub success_count: u64,
    pub error_count: u64,
    pub avg_response_time_ms: f64,
}

/// Endpoint record produced by service discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredEndpoint {
    pub address: String,
    pub port: u16,
    pub weight: u32,
    pub healthy: bool,
}

impl DiscoveredEndpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            weight: 1,
            healthy: true,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_healthy(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }
}

/// One logical stream owned by the coordinator.
#[derive(Debug)]
pub struct StreamHandle {
    id: String,
    pattern: StreamPattern,
    state: Mutex<StreamState>,
    /// Closed by its owner rather than by running out of input
    cancelled: AtomicBool,
    started_at: Instant,
}

impl StreamHandle {
    pub fn new(id: impl Into<String>, pattern: StreamPattern) -> Self {
        Self {
            id: id.into(),
            pattern,
            state: Mutex::new(StreamState::Idle),
            cancelled: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pattern(&self) -> StreamPattern {
        self.pattern
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Move to `next` if the lifecycle allows it.
    ///
    /// Returns false (and leaves the state untouched) for backward moves
    /// and for any move out of `Closed`.
    pub fn transition(&self, next: StreamState) -> bool {
        let mut state = self.state.lock();
        if state.can_transition_to(next) {
            *state = next;
            true
        } else {
            false
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Closed
    }

    /// Close on behalf of the owner. Returns false if already closed.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        if *state == StreamState::Closed {
            return false;
        }
        self.cancelled.store(true, Ordering::Release);
        *state = StreamState::Closed;
        true
    }

    /// True if the stream was ended by [`cancel`](Self::cancel).
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            id: self.id.clone(),
            pattern: self.pattern,
            state: self.state(),
            age: self.started_at.elapsed(),
        }
    }
}

/// Snapshot of a [`StreamHandle`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamInfo {
    pub id: String,
    pub pattern: StreamPattern,
    pub state: StreamState,
    pub age: Duration,
}

/// Per-stream counters.
///
/// Counts only grow for the lifetime of a stream id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub backpressure_events: u64,
    pub dropped_messages: u64,
}

/// Per-call context handed through interceptors to the transport.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub stream_id: String,
    /// Fully qualified method name, e.g. `users.UserService/Get`
    pub method: String,
    /// Outgoing metadata (headers)
    pub metadata: HashMap<String, String>,
    pub deadline: Option<Instant>,
}

impl CallContext {
    pub fn new(stream_id: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            method: method.into(),
            ..Default::default()
        }
    }

    pub fn with_deadline(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn insert_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// A message whose encoded size is known.
///
/// Used for byte accounting and message size limits; the encoding itself
/// belongs to the transport.
pub trait Payload: Send + 'static {
    fn encoded_len(&self) -> usize;
}

impl Payload for Vec<u8> {
    fn encoded_len(&self) -> usize {
        self.len()
    }
}

impl Payload for bytes::Bytes {
    fn encoded_len(&self) -> usize {
        self.len()
    }
}

impl Payload for String {
    fn encoded_len(&self) -> usize {
        self.len()
    }
}

impl Payload for &'static str {
    fn encoded_len(&self) -> usize {
        self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(host: &str, port: u16) -> Endpoint {
        Endpoint::new(EndpointAddress::new(host, port), 1)
    }

    // ===== Endpoint Tests =====

    #[test]
    fn test_endpoint_defaults() {
        let ep = endpoint("10.0.0.1", 50051);
        assert!(ep.is_healthy());
        assert_eq!(ep.active_connections(), 0);
        assert_eq!(ep.success_count(), 0);
        assert_eq!(ep.error_count(), 0);
        assert_eq!(ep.success_rate(), 1.0);
    }

    #[test]
    fn test_endpoint_request_accounting() {
        let ep = endpoint("10.0.0.1", 50051);
        ep.begin_request();
        ep.begin_request();
        assert_eq!(ep.active_connections(), 2);

        ep.end_request(true, 100.0);
        assert_eq!(ep.active_connections(), 1);
        assert_eq!(ep.avg_response_time_ms(), 50.0);

        ep.end_request(false, 50.0);
        assert_eq!(ep.active_connections(), 0);
        assert_eq!(ep.avg_response_time_ms(), 50.0);
        assert_eq!(ep.success_count(), 1);
        assert_eq!(ep.error_count(), 1);
        assert_eq!(ep.success_rate(), 0.5);
    }

    #[test]
    fn test_end_request_saturates_at_zero() {
        let ep = endpoint("10.0.0.1", 50051);
        ep.end_request(true, 10.0);
        assert_eq!(ep.active_connections(), 0);
    }

    #[test]
    fn test_abandon_request_counts_no_outcome() {
        let ep = endpoint("10.0.0.1", 50051);
        ep.begin_request();
        ep.abandon_request();

        assert_eq!(ep.active_connections(), 0);
        assert_eq!(ep.success_count(), 0);
        assert_eq!(ep.error_count(), 0);
        assert_eq!(ep.avg_response_time_ms(), 0.0);

        ep.abandon_request();
        assert_eq!(ep.active_connections(), 0);
    }

    #[test]
    fn test_from_discovered() {
        let d = DiscoveredEndpoint::new("svc-a", 9000)
            .with_weight(5)
            .with_healthy(false);
        let ep = Endpoint::from_discovered(&d);
        assert_eq!(ep.address(), &EndpointAddress::new("svc-a", 9000));
        assert_eq!(ep.weight(), 5);
        assert!(!ep.is_healthy());
    }

    #[test]
    fn test_snapshot_serializes() {
        let ep = endpoint("10.0.0.1", 50051);
        let json = serde_json::to_value(ep.snapshot()).unwrap();
        assert_eq!(json["address"]["host"], "10.0.0.1");
        assert_eq!(json["healthy"], true);
    }

    // ===== StreamHandle Tests =====

    #[test]
    fn test_stream_handle_lifecycle() {
        let handle = StreamHandle::new("s1", StreamPattern::ServerStreaming);
        assert_eq!(handle.state(), StreamState::Idle);

        assert!(handle.transition(StreamState::Active));
        assert!(handle.transition(StreamState::Error));
        assert!(!handle.transition(StreamState::Active));
        assert!(handle.transition(StreamState::Closed));
        assert!(handle.is_closed());
        assert!(!handle.transition(StreamState::Active));
    }

    #[test]
    fn test_stream_handle_cancel() {
        let handle = StreamHandle::new("s1", StreamPattern::ServerStreaming);
        handle.transition(StreamState::Active);
        assert!(!handle.is_cancelled());

        assert!(handle.cancel());
        assert!(handle.is_closed());
        assert!(handle.is_cancelled());
        assert!(!handle.cancel());

        // Ending normally is not a cancellation
        let done = StreamHandle::new("s2", StreamPattern::ServerStreaming);
        done.transition(StreamState::Closed);
        assert!(!done.cancel());
        assert!(!done.is_cancelled());
    }

    #[test]
    fn test_stream_info() {
        let handle = StreamHandle::new("s1", StreamPattern::Bidirectional);
        handle.transition(StreamState::Active);
        let info = handle.info();
        assert_eq!(info.id, "s1");
        assert_eq!(info.pattern, StreamPattern::Bidirectional);
        assert_eq!(info.state, StreamState::Active);
    }

    // ===== CallContext Tests =====

    #[test]
    fn test_call_context_metadata() {
        let mut ctx = CallContext::new("s1", "svc/Method");
        assert!(ctx.metadata("authorization").is_none());
        ctx.insert_metadata("authorization", "Bearer t");
        assert_eq!(ctx.metadata("authorization"), Some("Bearer t"));
    }

    #[test]
    fn test_call_context_deadline() {
        let ctx = CallContext::new("s1", "svc/Method").with_deadline(Duration::from_secs(5));
        assert!(ctx.deadline.unwrap() > Instant::now());
    }

    // ===== Payload Tests =====

    #[test]
    fn test_payload_lengths() {
        assert_eq!(vec![1u8, 2, 3].encoded_len(), 3);
        assert_eq!(bytes::Bytes::from_static(b"abcd").encoded_len(), 4);
        assert_eq!(String::from("hello").encoded_len(), 5);
        assert_eq!("hi".encoded_len(), 2);
    }
}
