//! Infrastructure Layer
//!
//! Cross-cutting concerns and infrastructure components.

pub mod circuit_breaker;
pub mod health_checker;
pub mod rate_limiter;
pub mod shutdown;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use health_checker::{HealthCheckConfig, HealthCheckResult, HealthChecker, HealthStatus};
pub use rate_limiter::{RateLimitConfig, WindowRateLimiter};
pub use shutdown::{CallGuard, ShutdownController};
