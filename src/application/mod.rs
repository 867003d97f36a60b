//! Application Layer
//!
//! Use cases built on the domain services and infrastructure.

pub mod rpc_client;

pub use rpc_client::{CallTotals, ClientMetrics, RpcClient, RpcClientBuilder};
