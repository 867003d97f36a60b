mod endpoint_pool;
mod load_balancer;
mod retry_policy;

pub use endpoint_pool::EndpointPool;
pub use load_balancer::LoadBalancer;
pub use retry_policy::{RetryConfig, RetryPolicy};
