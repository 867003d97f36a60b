//! Integration tests for RpcClient
//!
//! Drives the client end to end with in-memory transport, discovery and
//! health probe fakes.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streamgate::config::load_client_config_with;
use streamgate::domain::entities::Endpoint;
use streamgate::error::BoxError;
use streamgate::{
    CallContext, ClientConfig, DiscoveredEndpoint, DiscoverySource, EndpointAddress, HealthCheckConfig,
    HealthProbe, LoadBalancingStrategy, RateLimitInterceptor, ResponseStream, RpcClient, RpcError,
    Transport, TransportError,
};

// ===== Fakes =====

/// Local handle so the fakes can implement foreign traits (orphan rule).
struct Shared<T>(Arc<T>);

impl<T> std::ops::Deref for Shared<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

/// Answers `<request> from <port>`; ports in `down` refuse connections.
#[derive(Default)]
struct FleetTransport {
    down: Mutex<HashSet<u16>>,
    calls: AtomicUsize,
}

#[async_trait]
impl Transport for Shared<FleetTransport> {
    type Request = String;
    type Response = String;

    async fn invoke(
        &self,
        endpoint: &EndpointAddress,
        request: String,
        _ctx: &CallContext,
        _timeout: Duration,
    ) -> Result<String, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.lock().contains(&endpoint.port) {
            return Err(TransportError::Unavailable(format!("{} refused", endpoint)));
        }
        Ok(format!("{} from {}", request, endpoint.port))
    }

    async fn invoke_streaming(
        &self,
        endpoint: &EndpointAddress,
        request: String,
        _ctx: &CallContext,
        _timeout: Duration,
    ) -> Result<ResponseStream<String>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let port = endpoint.port;
        let n: usize = request.parse().unwrap_or(0);
        let items: Vec<Result<String, TransportError>> =
            (0..n).map(|i| Ok(format!("{}#{}", port, i))).collect();
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

/// Discovery whose answer can be changed between refreshes.
#[derive(Default)]
struct MutableDiscovery {
    endpoints: Mutex<Vec<DiscoveredEndpoint>>,
    fail: Mutex<bool>,
    calls: AtomicUsize,
}

impl MutableDiscovery {
    fn set(&self, ports: &[u16]) {
        *self.endpoints.lock() = ports
            .iter()
            .map(|&p| DiscoveredEndpoint::new("10.1.0.1", p))
            .collect();
    }
}

#[async_trait]
impl DiscoverySource for Shared<MutableDiscovery> {
    async fn discover(&self, service: &str) -> Result<Vec<DiscoveredEndpoint>, BoxError> {
        assert_eq!(service, "inventory");
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail.lock() {
            return Err("registry unreachable".into());
        }
        Ok(self.endpoints.lock().clone())
    }
}

/// Probe backed by the same `down` set as the transport.
struct FleetProbe(Arc<FleetTransport>);

#[async_trait]
impl HealthProbe for FleetProbe {
    async fn check(&self, endpoint: &Endpoint) -> bool {
        !self.0.down.lock().contains(&endpoint.address().port)
    }
}

fn addr(port: u16) -> EndpointAddress {
    EndpointAddress::new("10.1.0.1", port)
}

fn base_config() -> ClientConfig {
    ClientConfig::new("inventory")
        .timeout(Duration::from_millis(200))
        .discovery_interval(Duration::from_secs(10))
        .health_check(HealthCheckConfig {
            interval: Duration::from_secs(5),
            timeout: Duration::from_millis(100),
            ..Default::default()
        })
}

// ===== Discovery =====

#[tokio::test(start_paused = true)]
async fn test_discovery_loop_tracks_endpoint_changes() {
    let transport = Arc::new(FleetTransport::default());
    let discovery = Arc::new(MutableDiscovery::default());
    discovery.set(&[8001, 8002]);

    let client = RpcClient::builder(base_config(), Shared(transport.clone()))
        .discovery(Shared(discovery.clone()))
        .build()
        .unwrap();

    client.start().await;
    assert_eq!(client.load_balancer().pool().len(), 2);

    // Warm up counters on 8001 so we can check they survive a refresh
    client.call("Stock/Get", "sku-1".to_string()).await.unwrap();
    let before = client.load_balancer().pool().get(&addr(8001)).unwrap();
    assert_eq!(before.success_count(), 1);

    discovery.set(&[8001, 8003]);
    tokio::time::sleep(Duration::from_millis(10_100)).await;

    let pool = client.load_balancer().pool();
    assert_eq!(pool.len(), 2);
    assert!(pool.get(&addr(8002)).is_none());
    assert!(pool.get(&addr(8003)).is_some());
    let after = pool.get(&addr(8001)).unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(after.success_count(), 1);

    client.stop().await;
    let refreshes = discovery.calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(discovery.calls.load(Ordering::SeqCst), refreshes);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_failure_keeps_previous_endpoints() {
    let transport = Arc::new(FleetTransport::default());
    let discovery = Arc::new(MutableDiscovery::default());
    discovery.set(&[8001]);

    let client = RpcClient::builder(base_config(), Shared(transport))
        .discovery(Shared(discovery.clone()))
        .build()
        .unwrap();
    client.start().await;

    *discovery.fail.lock() = true;
    tokio::time::sleep(Duration::from_millis(10_100)).await;
    assert!(discovery.calls.load(Ordering::SeqCst) >= 2);
    assert_eq!(client.load_balancer().pool().len(), 1);
    assert!(client.refresh_endpoints().await.is_err());

    client.stop().await;
}

// ===== Health Checking =====

#[tokio::test(start_paused = true)]
async fn test_health_loop_steers_traffic_away_from_down_endpoint() {
    let transport = Arc::new(FleetTransport::default());
    transport.down.lock().insert(8002);

    let client = RpcClient::builder(base_config(), Shared(transport.clone()))
        .health_probe(FleetProbe(transport.clone()))
        .build()
        .unwrap();
    client.add_endpoint(addr(8001), 1);
    client.add_endpoint(addr(8002), 1);

    client.start().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let pool = client.load_balancer().pool();
    assert!(!pool.get(&addr(8002)).unwrap().is_healthy());

    for _ in 0..4 {
        let response = client.call("Stock/Get", "sku".to_string()).await.unwrap();
        assert_eq!(response, "sku from 8001");
    }

    // Recovery is picked up on the next health pass
    transport.down.lock().clear();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(pool.get(&addr(8002)).unwrap().is_healthy());

    client.stop().await;
}

#[tokio::test]
async fn test_all_endpoints_down_is_service_unavailable() {
    let transport = Arc::new(FleetTransport::default());
    let client = RpcClient::builder(base_config(), Shared(transport.clone()))
        .build()
        .unwrap();
    client.add_endpoint(addr(8001), 1);
    client.load_balancer().pool().set_healthy(&addr(8001), false);

    let err = client.call("Stock/Get", "sku".to_string()).await.unwrap_err();
    assert!(err.is_retry_later());
    assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
}

// ===== Retries and Circuit Breaking =====

#[tokio::test(start_paused = true)]
async fn test_retry_moves_to_next_endpoint() {
    let transport = Arc::new(FleetTransport::default());
    transport.down.lock().insert(8001);

    let client = RpcClient::builder(base_config(), Shared(transport.clone()))
        .build()
        .unwrap();
    client.add_endpoint(addr(8001), 1);
    client.add_endpoint(addr(8002), 1);

    let response = client.call("Stock/Get", "sku".to_string()).await.unwrap();
    assert_eq!(response, "sku from 8002");

    let metrics = client.get_metrics();
    assert_eq!(metrics.calls.retries, 1);
    let failed = metrics
        .endpoints
        .iter()
        .find(|e| e.address == addr(8001))
        .unwrap();
    assert_eq!(failed.error_count, 1);
}

#[tokio::test]
async fn test_breaker_recovers_after_timeout() {
    let transport = Arc::new(FleetTransport::default());
    transport.down.lock().insert(8001);

    let mut config = base_config();
    config.retry.enabled = false;
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.recovery_timeout = Duration::from_millis(50);
    config.circuit_breaker.success_threshold = 1;

    let client = RpcClient::builder(config, Shared(transport.clone())).build().unwrap();
    client.add_endpoint(addr(8001), 1);

    for _ in 0..2 {
        let err = client.call("Stock/Get", "sku".to_string()).await.unwrap_err();
        assert!(matches!(err, RpcError::Client { .. }));
    }
    let err = client.call("Stock/Get", "sku".to_string()).await.unwrap_err();
    assert!(matches!(err, RpcError::CircuitOpen { .. }));

    transport.down.lock().clear();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let response = client.call("Stock/Get", "sku".to_string()).await.unwrap();
    assert_eq!(response, "sku from 8001");
    assert_eq!(
        client.circuit_breaker().state(),
        streamgate::infrastructure::CircuitState::Closed
    );
}

// ===== Streaming =====

#[tokio::test]
async fn test_streaming_calls_are_balanced_and_metered() {
    let transport = Arc::new(FleetTransport::default());
    let config = base_config().load_balancing_strategy(LoadBalancingStrategy::LeastConnections);
    let client = RpcClient::builder(config, Shared(transport)).build().unwrap();
    client.add_endpoint(addr(8001), 1);
    client.add_endpoint(addr(8002), 1);

    // The first stream holds a connection on 8001 until drained
    let first = client.call_streaming("Stock/Watch", "3".to_string()).await.unwrap();
    let second = client.call_streaming("Stock/Watch", "2".to_string()).await.unwrap();

    let a: Vec<String> = first.map(|r| r.unwrap()).collect().await;
    let b: Vec<String> = second.map(|r| r.unwrap()).collect().await;
    assert_eq!(a, vec!["8001#0", "8001#1", "8001#2"]);
    assert_eq!(b, vec!["8002#0", "8002#1"]);

    let metrics = client.get_metrics();
    assert_eq!(metrics.streams.len(), 2);
    let sent: u64 = metrics.streams.values().map(|m| m.messages_sent).sum();
    assert_eq!(sent, 5);
    assert!(metrics.endpoints.iter().all(|e| e.active_connections == 0));
    assert!(client.coordinator().get_active_streams().is_empty());
}

#[tokio::test]
async fn test_stop_closes_open_streams() {
    let transport = Arc::new(FleetTransport::default());
    let client = RpcClient::builder(base_config(), Shared(transport)).build().unwrap();
    client.add_endpoint(addr(8001), 1);

    let mut stream = client.call_streaming("Stock/Watch", "5".to_string()).await.unwrap();
    assert!(stream.next().await.is_some());

    client.stop().await;
    assert!(stream.next().await.is_none());
    assert_eq!(client.coordinator().stream_count(), 0);
}

// ===== Interceptors and Config =====

#[tokio::test(start_paused = true)]
async fn test_rate_limited_client_spreads_calls() {
    let transport = Arc::new(FleetTransport::default());
    let client = RpcClient::builder(base_config(), Shared(transport))
        .request_interceptor(RateLimitInterceptor::new(2).unwrap())
        .build()
        .unwrap();
    client.add_endpoint(addr(8001), 1);

    let start = tokio::time::Instant::now();
    for _ in 0..5 {
        client.call("Stock/Get", "sku".to_string()).await.unwrap();
    }
    // 5 calls at 2/s need two window rollovers
    assert!(start.elapsed() >= Duration::from_secs(2));
}

#[tokio::test]
async fn test_client_from_env_style_config() {
    let config = load_client_config_with("inventory", |key| match key {
        "STREAMGATE_LB_STRATEGY" => Some("weighted_round_robin".to_string()),
        "STREAMGATE_RETRY_MAX_ATTEMPTS" => Some("5".to_string()),
        _ => None,
    })
    .unwrap();

    let client = RpcClient::builder(config, Shared(Arc::new(FleetTransport::default())))
        .build()
        .unwrap();
    assert_eq!(
        client.load_balancer().strategy(),
        LoadBalancingStrategy::WeightedRoundRobin
    );
    assert_eq!(client.config().retry.max_attempts, 5);
}
