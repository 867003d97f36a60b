//! streamgate Library
//!
//! Streaming coordination (unary, server, client and bidirectional
//! streams with backpressure, interceptors and per-stream metrics) and a
//! resilient RPC client core (endpoint pool, load balancing, circuit
//! breaking, retries, discovery refresh and health checking) over an
//! injected transport.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod streaming;

// Re-export commonly used types
pub use application::{ClientMetrics, RpcClient, RpcClientBuilder};
pub use config::{load_client_config_from_env, ClientConfig, StreamingConfig};
pub use domain::entities::{CallContext, DiscoveredEndpoint, Endpoint, Payload, StreamMetrics};
pub use domain::ports::{DiscoverySource, HealthProbe, ResponseStream, StaticDiscovery, TokenSupplier, Transport};
pub use domain::services::{EndpointPool, LoadBalancer, RetryConfig, RetryPolicy};
pub use domain::value_objects::{
    BackpressureStrategy, EndpointAddress, LoadBalancingStrategy, RetryStrategy, StreamPattern,
    StreamState,
};
pub use error::{ConfigError, RpcError, StreamingError, StreamingFailure, TransportError};
pub use infrastructure::{CircuitBreaker, CircuitBreakerConfig, HealthCheckConfig};
pub use streaming::{
    AuthInterceptor, InterceptorChain, RateLimitInterceptor, StreamBuffer, StreamCoordinator,
    StreamInterceptor,
};
