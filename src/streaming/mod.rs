//! Streaming Layer
//!
//! Buffers, per-stream metrics, interceptors and the coordinator that ties
//! them together for the four call patterns.

pub mod buffer;
pub mod coordinator;
pub mod interceptor;
pub mod metrics;

pub use buffer::{PutOutcome, StreamBuffer};
pub use coordinator::{CoordinatedStream, StreamCoordinator};
pub use interceptor::{AuthInterceptor, InterceptorChain, RateLimitInterceptor, StreamInterceptor};
pub use metrics::StreamMetricsCollector;
