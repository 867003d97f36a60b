//! Domain Layer
//!
//! Entities, value objects, ports and pure selection/backoff logic.

pub mod entities;
pub mod ports;
pub mod services;
pub mod value_objects;

pub use entities::{
    CallContext, DiscoveredEndpoint, Endpoint, EndpointSnapshot, Payload, StreamHandle,
    StreamInfo, StreamMetrics,
};
pub use value_objects::{
    BackpressureStrategy, EndpointAddress, LoadBalancingStrategy, RetryStrategy, StreamPattern,
    StreamState,
};
