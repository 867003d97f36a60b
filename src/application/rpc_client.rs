//! RPC Client - Main application use case
//!
//! Resolves an endpoint per call, guards it with the circuit breaker,
//! retries failed attempts and drives streaming responses through the
//! stream coordinator. Discovery refresh and health checking run as
//! background loops between `start` and `stop`.

use crate::config::ClientConfig;
use crate::domain::entities::{CallContext, Endpoint, EndpointSnapshot, StreamMetrics};
use crate::domain::ports::{DiscoverySource, HealthProbe, ResponseStream, Transport};
use crate::domain::services::{EndpointPool, LoadBalancer, RetryPolicy};
use crate::domain::value_objects::{EndpointAddress, StreamPattern};
use crate::error::{BoxError, ConfigError, RpcError, StreamingError, StreamingFailure, TransportError};
use crate::infrastructure::circuit_breaker::{CircuitBreaker, CircuitSnapshot};
use crate::infrastructure::health_checker::HealthChecker;
use crate::infrastructure::shutdown::ShutdownController;
use crate::streaming::coordinator::{CoordinatedStream, StreamCoordinator};
use crate::streaming::interceptor::{InterceptorChain, StreamInterceptor};
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use uuid::Uuid;

/// How long `stop` waits for a background loop before aborting it.
const LOOP_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a single attempt failed.
enum AttemptError {
    NoEndpoint,
    CircuitOpen,
    Timeout,
    Transport(TransportError),
    Interceptor(StreamingFailure),
}

/// Call counters since the client was built.
#[derive(Debug, Default)]
struct CallStats {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

/// Snapshot of [`CallStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallTotals {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retries: u64,
}

/// Everything the client knows about its own health.
#[derive(Debug, Clone, Serialize)]
pub struct ClientMetrics {
    pub service: String,
    pub endpoints: Vec<EndpointSnapshot>,
    pub circuit: CircuitSnapshot,
    pub streams: HashMap<String, StreamMetrics>,
    pub calls: CallTotals,
}

/// Resilient client for one logical service.
pub struct RpcClient<Tr: Transport> {
    config: ClientConfig,
    transport: Arc<Tr>,
    pool: Arc<EndpointPool>,
    load_balancer: Arc<LoadBalancer>,
    circuit_breaker: Arc<CircuitBreaker>,
    retry_policy: RetryPolicy,
    request_interceptors: InterceptorChain<Tr::Request>,
    coordinator: StreamCoordinator<Tr::Response>,
    discovery: Option<Arc<dyn DiscoverySource>>,
    health_checker: Option<Arc<HealthChecker>>,
    shutdown: ShutdownController,
    stats: CallStats,
    started: AtomicBool,
}

impl<Tr: Transport> RpcClient<Tr> {
    /// Start building a client for `config.service_name` over `transport`.
    pub fn builder(config: ClientConfig, transport: Tr) -> RpcClientBuilder<Tr> {
        RpcClientBuilder {
            config,
            transport: Arc::new(transport),
            discovery: None,
            probe: None,
            request_interceptors: InterceptorChain::new(),
            response_interceptors: InterceptorChain::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &StreamCoordinator<Tr::Response> {
        &self.coordinator
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.load_balancer
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    pub fn health_checker(&self) -> Option<&Arc<HealthChecker>> {
        self.health_checker.as_ref()
    }

    /// Run one discovery refresh, then spawn the discovery and health loops.
    ///
    /// Does nothing if the client was already started or stopped.
    pub async fn start(&self) {
        if self.shutdown.is_shutdown() || self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let service = self.config.service_name.clone();

        if let Some(discovery) = &self.discovery {
            refresh_pool(&self.pool, discovery.as_ref(), &service).await;

            let pool = self.pool.clone();
            let discovery = discovery.clone();
            let interval = self.config.discovery_interval;
            let shutdown = self.shutdown.subscribe();
            self.shutdown.spawn(
                "discovery",
                discovery_loop(pool, discovery, service.clone(), interval, shutdown),
            );
        }

        if let Some(checker) = &self.health_checker {
            self.shutdown.spawn(
                "health-check",
                checker.clone().run(self.pool.clone(), self.shutdown.subscribe()),
            );
        }

        tracing::info!(
            "rpc client for {} started with {} endpoints",
            service,
            self.pool.len()
        );
    }

    /// Stop the background loops, close all streams and wait for in-flight
    /// calls to finish (bounded by the call timeout).
    pub async fn stop(&self) {
        self.shutdown.shutdown_and_join(LOOP_STOP_TIMEOUT).await;
        let closed = self.coordinator.close_all();
        if !self.shutdown.wait_for_drain(self.config.timeout).await {
            tracing::warn!(
                "rpc client for {} stopped with {} calls in flight",
                self.config.service_name,
                self.shutdown.active_calls()
            );
        }
        tracing::info!(
            "rpc client for {} stopped ({} streams closed)",
            self.config.service_name,
            closed
        );
    }

    /// Replace the pool contents from the discovery source once.
    ///
    /// Returns the pool size, or the discovery error.
    pub async fn refresh_endpoints(&self) -> Result<usize, BoxError> {
        let Some(discovery) = &self.discovery else {
            return Ok(self.pool.len());
        };
        let found = discovery.discover(&self.config.service_name).await?;
        self.pool.update_endpoints(&found);
        Ok(self.pool.len())
    }

    /// Add an endpoint by hand. Returns false if it is already known.
    pub fn add_endpoint(&self, address: EndpointAddress, weight: u32) -> bool {
        let added = self.pool.add_endpoint(Endpoint::new(address.clone(), weight));
        if added {
            tracing::debug!("added endpoint {} to {}", address, self.config.service_name);
        }
        added
    }

    /// Remove an endpoint. Calls already using it finish normally.
    pub fn remove_endpoint(&self, address: &EndpointAddress) -> bool {
        let removed = self.pool.remove_endpoint(address).is_some();
        if removed {
            tracing::debug!("removed endpoint {} from {}", address, self.config.service_name);
        }
        removed
    }

    /// Unary call with retries.
    pub async fn call(&self, method: &str, request: Tr::Request) -> Result<Tr::Response, RpcError> {
        let _guard = self.shutdown.call_guard();
        let call_id = Uuid::new_v4().to_string();

        self.with_retries(method, &call_id, StreamPattern::Unary, |attempt| {
            self.attempt_unary(method, &call_id, attempt, request.clone())
        })
        .await
    }

    /// Server-streaming call.
    ///
    /// Opening the stream gets the same endpoint, breaker and retry handling
    /// as [`call`](Self::call). The responses are driven by the coordinator
    /// under a fresh stream id; the endpoint and breaker learn the outcome
    /// when the stream ends. A stream that is cancelled or dropped before
    /// its end only gives back its connection.
    pub async fn call_streaming(
        &self,
        method: &str,
        request: Tr::Request,
    ) -> Result<CoordinatedStream<Tr::Response>, RpcError> {
        let _guard = self.shutdown.call_guard();
        let stream_id = Uuid::new_v4().to_string();

        let (responses, endpoint, started, ctx) = self
            .with_retries(method, &stream_id, StreamPattern::ServerStreaming, |attempt| {
                self.attempt_streaming(method, &stream_id, attempt, request.clone())
            })
            .await?;

        let mut outcome = StreamOutcome {
            load_balancer: self.load_balancer.clone(),
            circuit_breaker: self.circuit_breaker.clone(),
            endpoint,
            started,
            recorded: false,
        };
        let coordinated = self.coordinator.open_server_stream_with(ctx, responses)?;
        let handle = self.coordinator.stream_handle(&stream_id);

        let tracked = async_stream::stream! {
            let mut coordinated = coordinated;
            let mut failed = false;
            while let Some(item) = coordinated.next().await {
                failed |= item.is_err();
                yield item;
            }
            if handle.map_or(false, |h| h.is_cancelled()) {
                outcome.abandon();
            } else {
                outcome.finish(!failed);
            }
        };

        Ok(Box::pin(tracked))
    }

    pub fn get_metrics(&self) -> ClientMetrics {
        ClientMetrics {
            service: self.config.service_name.clone(),
            endpoints: self.pool.snapshots(),
            circuit: self.circuit_breaker.get_state(),
            streams: self.coordinator.get_all_metrics(),
            calls: CallTotals {
                total: self.stats.total.load(Ordering::Relaxed),
                succeeded: self.stats.succeeded.load(Ordering::Relaxed),
                failed: self.stats.failed.load(Ordering::Relaxed),
                retries: self.stats.retries.load(Ordering::Relaxed),
            },
        }
    }

    /// Run `attempt` until it succeeds, fails for good, or the retry policy
    /// gives up.
    async fn with_retries<R, F, Fut>(
        &self,
        method: &str,
        call_id: &str,
        pattern: StreamPattern,
        mut attempt: F,
    ) -> Result<R, RpcError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<R, AttemptError>>,
    {
        self.stats.total.fetch_add(1, Ordering::Relaxed);
        let mut attempts: u32 = 0;

        let err = loop {
            let result = attempt(attempts).await;
            attempts += 1;

            let failure = match result {
                Ok(value) => {
                    self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(failure) => failure,
            };

            let retryable = match &failure {
                AttemptError::Timeout => true,
                AttemptError::Transport(e) => e.is_retryable(),
                _ => false,
            };
            if !retryable || !self.retry_policy.should_retry(attempts) {
                break failure;
            }

            let delay = self.retry_policy.compute_delay(attempts - 1);
            tracing::debug!(
                "call {} attempt {} failed, retrying in {:?}",
                method,
                attempts,
                delay
            );
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(delay).await;
        };

        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        let service = self.config.service_name.clone();
        Err(match err {
            AttemptError::NoEndpoint => RpcError::ServiceUnavailable { service },
            AttemptError::CircuitOpen => RpcError::CircuitOpen { service },
            AttemptError::Timeout => RpcError::Timeout {
                method: method.to_string(),
                timeout: self.config.timeout,
                attempts,
            },
            AttemptError::Transport(source) => RpcError::Client {
                method: method.to_string(),
                attempts,
                source,
            },
            AttemptError::Interceptor(cause) => {
                RpcError::Streaming(StreamingError::new(pattern, call_id, cause))
            }
        })
    }

    /// Pick an endpoint, pass the breaker and run request interceptors.
    async fn prepare(
        &self,
        method: &str,
        call_id: &str,
        attempt: u32,
        request: Tr::Request,
    ) -> Result<(Arc<Endpoint>, Tr::Request, CallContext), AttemptError> {
        let endpoint = self.load_balancer.get_endpoint().ok_or_else(|| {
            tracing::warn!("no healthy endpoints for {}", self.config.service_name);
            AttemptError::NoEndpoint
        })?;

        if !self.circuit_breaker.should_allow_request() {
            return Err(AttemptError::CircuitOpen);
        }

        let mut ctx = CallContext::new(call_id, method).with_deadline(self.config.timeout);
        let request = self
            .request_interceptors
            .apply_request(request, &mut ctx)
            .await
            .map_err(AttemptError::Interceptor)?;

        tracing::debug!(
            "calling {} on {} (attempt {})",
            method,
            endpoint.address(),
            attempt + 1
        );
        Ok((endpoint, request, ctx))
    }

    /// Record a finished attempt on the balancer and breaker.
    fn record_outcome(&self, endpoint: &Endpoint, started: Instant, success: bool) {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.load_balancer
            .record_request_end(endpoint, success, elapsed_ms);
        if success {
            self.circuit_breaker.record_success();
        } else {
            self.circuit_breaker.record_failure();
        }
    }

    async fn attempt_unary(
        &self,
        method: &str,
        call_id: &str,
        attempt: u32,
        request: Tr::Request,
    ) -> Result<Tr::Response, AttemptError> {
        let (endpoint, request, mut ctx) = self.prepare(method, call_id, attempt, request).await?;
        let timeout = self.config.timeout;

        self.load_balancer.record_request_start(&endpoint);
        let started = Instant::now();
        let result = tokio::time::timeout(
            timeout,
            self.transport.invoke(endpoint.address(), request, &ctx, timeout),
        )
        .await;

        match result {
            Ok(Ok(response)) => {
                self.record_outcome(&endpoint, started, true);
                self.coordinator
                    .interceptors()
                    .apply_response(response, &mut ctx)
                    .await
                    .map_err(AttemptError::Interceptor)
            }
            Ok(Err(e)) => {
                self.record_outcome(&endpoint, started, false);
                tracing::debug!("call {} on {} failed: {}", method, endpoint.address(), e);
                Err(AttemptError::Transport(e))
            }
            Err(_) => {
                self.record_outcome(&endpoint, started, false);
                tracing::debug!("call {} on {} timed out", method, endpoint.address());
                Err(AttemptError::Timeout)
            }
        }
    }

    async fn attempt_streaming(
        &self,
        method: &str,
        call_id: &str,
        attempt: u32,
        request: Tr::Request,
    ) -> Result<(ResponseStream<Tr::Response>, Arc<Endpoint>, Instant, CallContext), AttemptError> {
        let (endpoint, request, ctx) = self.prepare(method, call_id, attempt, request).await?;
        let timeout = self.config.timeout;

        self.load_balancer.record_request_start(&endpoint);
        let started = Instant::now();
        let result = tokio::time::timeout(
            timeout,
            self.transport
                .invoke_streaming(endpoint.address(), request, &ctx, timeout),
        )
        .await;

        match result {
            Ok(Ok(responses)) => Ok((responses, endpoint, started, ctx)),
            Ok(Err(e)) => {
                self.record_outcome(&endpoint, started, false);
                Err(AttemptError::Transport(e))
            }
            Err(_) => {
                self.record_outcome(&endpoint, started, false);
                Err(AttemptError::Timeout)
            }
        }
    }
}

/// Settles a streaming call's endpoint accounting exactly once.
///
/// A stream that never reached its end (cancelled or dropped) releases
/// its connection without counting an outcome or touching the breaker.
struct StreamOutcome {
    load_balancer: Arc<LoadBalancer>,
    circuit_breaker: Arc<CircuitBreaker>,
    endpoint: Arc<Endpoint>,
    started: Instant,
    recorded: bool,
}

impl StreamOutcome {
    fn finish(&mut self, success: bool) {
        if std::mem::replace(&mut self.recorded, true) {
            return;
        }
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.load_balancer
            .record_request_end(&self.endpoint, success, elapsed_ms);
        if success {
            self.circuit_breaker.record_success();
        } else {
            self.circuit_breaker.record_failure();
        }
    }

    fn abandon(&mut self) {
        if !std::mem::replace(&mut self.recorded, true) {
            self.load_balancer.record_request_abandoned(&self.endpoint);
        }
    }
}

impl Drop for StreamOutcome {
    fn drop(&mut self) {
        self.abandon();
    }
}

/// Builder for [`RpcClient`].
pub struct RpcClientBuilder<Tr: Transport> {
    config: ClientConfig,
    transport: Arc<Tr>,
    discovery: Option<Arc<dyn DiscoverySource>>,
    probe: Option<Arc<dyn HealthProbe>>,
    request_interceptors: InterceptorChain<Tr::Request>,
    response_interceptors: InterceptorChain<Tr::Response>,
}

impl<Tr: Transport> RpcClientBuilder<Tr> {
    /// Refresh the endpoint pool from `discovery`.
    pub fn discovery(mut self, discovery: impl DiscoverySource + 'static) -> Self {
        self.discovery = Some(Arc::new(discovery));
        self
    }

    /// Run active health checks through `probe`.
    pub fn health_probe(mut self, probe: impl HealthProbe + 'static) -> Self {
        self.probe = Some(Arc::new(probe));
        self
    }

    pub fn request_interceptor(
        mut self,
        interceptor: impl StreamInterceptor<Tr::Request> + 'static,
    ) -> Self {
        self.request_interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn response_interceptor(
        mut self,
        interceptor: impl StreamInterceptor<Tr::Response> + 'static,
    ) -> Self {
        self.response_interceptors.push(Arc::new(interceptor));
        self
    }

    /// Add one interceptor to both the request and the response chain.
    pub fn interceptor<I>(mut self, interceptor: I) -> Self
    where
        I: StreamInterceptor<Tr::Request> + StreamInterceptor<Tr::Response> + 'static,
    {
        let shared = Arc::new(interceptor);
        self.request_interceptors.push(shared.clone());
        self.response_interceptors.push(shared);
        self
    }

    /// Validate the configuration and build the client.
    pub fn build(self) -> Result<RpcClient<Tr>, ConfigError> {
        let config = self.config.build()?;

        let pool = Arc::new(EndpointPool::new());
        let load_balancer = Arc::new(LoadBalancer::new(
            pool.clone(),
            config.load_balancing_strategy,
        ));
        let circuit_breaker = Arc::new(CircuitBreaker::new(
            config.service_name.clone(),
            config.circuit_breaker.clone(),
        ));
        let coordinator = StreamCoordinator::new(config.streaming.clone())?
            .with_interceptors(self.response_interceptors);
        let health_checker = self
            .probe
            .map(|probe| Arc::new(HealthChecker::new(config.health_check.clone(), probe)));

        Ok(RpcClient {
            retry_policy: RetryPolicy::new(config.retry.clone()),
            config,
            transport: self.transport,
            pool,
            load_balancer,
            circuit_breaker,
            request_interceptors: self.request_interceptors,
            coordinator,
            discovery: self.discovery,
            health_checker,
            shutdown: ShutdownController::new(),
            stats: CallStats::default(),
            started: AtomicBool::new(false),
        })
    }
}

/// Replace the pool from discovery, keeping the old list on failure.
async fn refresh_pool(pool: &EndpointPool, discovery: &dyn DiscoverySource, service: &str) {
    match discovery.discover(service).await {
        Ok(found) => {
            pool.update_endpoints(&found);
            tracing::debug!("discovered {} endpoints for {}", pool.len(), service);
        }
        Err(e) => {
            tracing::warn!("endpoint discovery for {} failed: {}", service, e);
        }
    }
}

async fn discovery_loop(
    pool: Arc<EndpointPool>,
    discovery: Arc<dyn DiscoverySource>,
    service: String,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // start() already refreshed once
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                refresh_pool(&pool, discovery.as_ref(), &service).await;
            }
            _ = shutdown.recv() => {
                tracing::debug!("discovery loop for {} stopping", service);
                break;
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::domain::entities::DiscoveredEndpoint;
    use crate::domain::ports::StaticDiscovery;
    use crate::domain::services::RetryConfig;
    use crate::domain::value_objects::RetryStrategy;
    use crate::infrastructure::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::streaming::interceptor::AuthInterceptor;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    // ===== Mock Implementations =====

    enum Reply {
        Echo,
        Fail(TransportError),
        Hang,
        /// Streams the request once, then never ends.
        Stall,
    }

    #[derive(Default)]
    struct MockTransport {
        script: Mutex<VecDeque<Reply>>,
        calls: Mutex<Vec<(EndpointAddress, Option<String>)>>,
    }

    impl MockTransport {
        fn scripted(replies: Vec<Reply>) -> Self {
            Self {
                script: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn next_reply(&self, endpoint: &EndpointAddress, ctx: &CallContext) -> Reply {
            self.calls
                .lock()
                .push((endpoint.clone(), ctx.metadata("authorization").map(String::from)));
            self.script.lock().pop_front().unwrap_or(Reply::Echo)
        }
    }

    #[async_trait]
    impl Transport for Arc<MockTransport> {
        type Request = String;
        type Response = String;

        async fn invoke(
            &self,
            endpoint: &EndpointAddress,
            request: String,
            ctx: &CallContext,
            _timeout: Duration,
        ) -> Result<String, TransportError> {
            match self.next_reply(endpoint, ctx) {
                Reply::Echo | Reply::Stall => Ok(format!("{}@{}", request, endpoint.port)),
                Reply::Fail(e) => Err(e),
                Reply::Hang => std::future::pending().await,
            }
        }

        async fn invoke_streaming(
            &self,
            endpoint: &EndpointAddress,
            request: String,
            ctx: &CallContext,
            _timeout: Duration,
        ) -> Result<ResponseStream<String>, TransportError> {
            match self.next_reply(endpoint, ctx) {
                Reply::Echo => {
                    let parts: Vec<Result<String, TransportError>> =
                        request.split(',').map(|s| Ok(s.to_string())).collect();
                    Ok(Box::pin(futures::stream::iter(parts)))
                }
                Reply::Stall => {
                    let first = futures::stream::once(async move { Ok(request) });
                    Ok(Box::pin(first.chain(futures::stream::pending())))
                }
                Reply::Fail(e) => Err(e),
                Reply::Hang => std::future::pending().await,
            }
        }
    }

    fn unavailable() -> TransportError {
        TransportError::Unavailable("connection refused".to_string())
    }

    fn config() -> ClientConfig {
        ClientConfig::new("orders")
            .timeout(Duration::from_millis(100))
            .retry(RetryConfig {
                strategy: RetryStrategy::Fixed,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
                ..Default::default()
            })
    }

    fn client_with(
        config: ClientConfig,
        transport: Arc<MockTransport>,
        ports: &[u16],
    ) -> RpcClient<Arc<MockTransport>> {
        let client = RpcClient::builder(config, transport).build().unwrap();
        for &port in ports {
            client.add_endpoint(EndpointAddress::new("10.0.0.1", port), 1);
        }
        client
    }

    fn endpoint(client: &RpcClient<Arc<MockTransport>>, port: u16) -> Arc<Endpoint> {
        client
            .load_balancer()
            .pool()
            .get(&EndpointAddress::new("10.0.0.1", port))
            .unwrap()
    }

    // ===== Unary Call Tests =====

    #[tokio::test]
    async fn test_call_success_updates_endpoint_and_breaker() {
        let transport = Arc::new(MockTransport::default());
        let client = client_with(config(), transport.clone(), &[7001]);

        let response = client.call("Orders/Get", "req".to_string()).await.unwrap();
        assert_eq!(response, "req@7001");

        let ep = endpoint(&client, 7001);
        assert_eq!(ep.success_count(), 1);
        assert_eq!(ep.active_connections(), 0);
        assert_eq!(client.circuit_breaker().state(), CircuitState::Closed);
        assert_eq!(client.get_metrics().calls.succeeded, 1);
    }

    #[tokio::test]
    async fn test_call_without_endpoints_is_service_unavailable() {
        let client = client_with(config(), Arc::new(MockTransport::default()), &[]);

        let err = client.call("Orders/Get", "req".to_string()).await.unwrap_err();
        assert!(matches!(err, RpcError::ServiceUnavailable { ref service } if service == "orders"));
        assert!(err.is_retry_later());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_retries_retryable_failure() {
        let transport = Arc::new(MockTransport::scripted(vec![Reply::Fail(unavailable())]));
        let client = client_with(config(), transport.clone(), &[7001]);

        let response = client.call("Orders/Get", "req".to_string()).await.unwrap();
        assert_eq!(response, "req@7001");
        assert_eq!(transport.calls.lock().len(), 2);

        let ep = endpoint(&client, 7001);
        assert_eq!(ep.error_count(), 1);
        assert_eq!(ep.success_count(), 1);
        assert_eq!(client.get_metrics().calls.retries, 1);
    }

    #[tokio::test]
    async fn test_rejected_call_is_not_retried() {
        let transport = Arc::new(MockTransport::scripted(vec![Reply::Fail(
            TransportError::Rejected {
                code: "invalid_argument".to_string(),
                message: "bad id".to_string(),
            },
        )]));
        let client = client_with(config(), transport.clone(), &[7001]);

        let err = client.call("Orders/Get", "req".to_string()).await.unwrap_err();
        match err {
            RpcError::Client { attempts, source, .. } => {
                assert_eq!(attempts, 1);
                assert!(!source.is_retryable());
            }
            other => panic!("expected client error, got {:?}", other),
        }
        assert_eq!(transport.calls.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_exhaust_retries() {
        let transport = Arc::new(MockTransport::scripted(vec![
            Reply::Hang,
            Reply::Hang,
            Reply::Hang,
        ]));
        let client = client_with(config(), transport.clone(), &[7001]);

        let err = client.call("Orders/Get", "req".to_string()).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(matches!(err, RpcError::Timeout { attempts: 3, .. }));
        assert_eq!(endpoint(&client, 7001).error_count(), 3);
        assert_eq!(client.get_metrics().calls.failed, 1);
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast() {
        let transport = Arc::new(MockTransport::scripted(vec![
            Reply::Fail(unavailable()),
            Reply::Fail(unavailable()),
        ]));
        let config = config()
            .retry(RetryConfig {
                enabled: false,
                ..Default::default()
            })
            .circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 2,
                ..Default::default()
            });
        let client = client_with(config, transport.clone(), &[7001]);

        assert!(client.call("Orders/Get", "a".to_string()).await.is_err());
        assert!(client.call("Orders/Get", "b".to_string()).await.is_err());
        assert_eq!(client.circuit_breaker().state(), CircuitState::Open);

        let err = client.call("Orders/Get", "c".to_string()).await.unwrap_err();
        assert!(matches!(err, RpcError::CircuitOpen { .. }));
        assert!(err.is_retry_later());
        assert_eq!(transport.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_round_robin_across_endpoints() {
        let transport = Arc::new(MockTransport::default());
        let client = client_with(config(), transport.clone(), &[7001, 7002]);

        let mut seen = vec![];
        for _ in 0..4 {
            seen.push(client.call("Orders/Get", "r".to_string()).await.unwrap());
        }
        assert_eq!(seen, vec!["r@7001", "r@7002", "r@7001", "r@7002"]);
    }

    #[tokio::test]
    async fn test_auth_interceptor_sets_metadata() {
        let transport = Arc::new(MockTransport::default());
        let client = RpcClient::builder(config(), transport.clone())
            .request_interceptor(AuthInterceptor::new(|| "s3cret".to_string()))
            .build()
            .unwrap();
        client.add_endpoint(EndpointAddress::new("10.0.0.1", 7001), 1);

        client.call("Orders/Get", "req".to_string()).await.unwrap();
        let calls = transport.calls.lock();
        assert_eq!(calls[0].1.as_deref(), Some("Bearer s3cret"));
    }

    #[tokio::test]
    async fn test_interceptor_rejection_surfaces_as_streaming_error() {
        let transport = Arc::new(MockTransport::default());
        let client = RpcClient::builder(config(), transport.clone())
            .interceptor(AuthInterceptor::new(String::new))
            .build()
            .unwrap();
        client.add_endpoint(EndpointAddress::new("10.0.0.1", 7001), 1);

        let err = client.call("Orders/Get", "req".to_string()).await.unwrap_err();
        assert!(matches!(err, RpcError::Streaming(ref e) if e.pattern == StreamPattern::Unary));
        assert!(transport.calls.lock().is_empty());
    }

    // ===== Streaming Call Tests =====

    #[tokio::test]
    async fn test_call_streaming_drives_coordinator() {
        let transport = Arc::new(MockTransport::default());
        let client = client_with(config(), transport, &[7001]);

        let stream = client
            .call_streaming("Orders/Watch", "a,bb,ccc".to_string())
            .await
            .unwrap();
        assert_eq!(client.coordinator().get_active_streams().len(), 1);

        let items: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(items, vec!["a", "bb", "ccc"]);

        let metrics = client.get_metrics();
        assert_eq!(metrics.streams.len(), 1);
        let stream_metrics = metrics.streams.values().next().unwrap();
        assert_eq!(stream_metrics.messages_sent, 3);
        assert_eq!(stream_metrics.bytes_sent, 6);

        let ep = endpoint(&client, 7001);
        assert_eq!(ep.success_count(), 1);
        assert_eq!(ep.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_call_streaming_open_failure_is_retried() {
        let transport = Arc::new(MockTransport::scripted(vec![Reply::Fail(unavailable())]));
        let client = client_with(config(), transport.clone(), &[7001, 7002]);

        let stream = client
            .call_streaming("Orders/Watch", "x".to_string())
            .await
            .unwrap();
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(transport.calls.lock().len(), 2);
        assert_eq!(endpoint(&client, 7001).error_count(), 1);
        assert_eq!(endpoint(&client, 7002).success_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_stream_releases_endpoint() {
        let transport = Arc::new(MockTransport::default());
        let client = client_with(config(), transport, &[7001]);

        let mut stream = client
            .call_streaming("Orders/Watch", "a,b,c".to_string())
            .await
            .unwrap();
        assert!(stream.next().await.is_some());
        drop(stream);

        let ep = endpoint(&client, 7001);
        assert_eq!(ep.active_connections(), 0);
        assert_eq!(ep.success_count(), 0);
        assert_eq!(ep.error_count(), 0);
        assert_eq!(client.circuit_breaker().get_state().failure_count, 0);
    }

    #[tokio::test]
    async fn test_stop_ends_stalled_stream_without_outcome() {
        let transport = Arc::new(MockTransport::scripted(vec![Reply::Stall]));
        let client = client_with(config(), transport, &[7001]);

        let mut stream = client
            .call_streaming("Orders/Watch", "live".to_string())
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "live");

        // Parked on the stalled source until stop() closes it
        let rest = tokio::spawn(async move { stream.collect::<Vec<_>>().await });
        tokio::task::yield_now().await;
        client.stop().await;

        assert!(rest.await.unwrap().is_empty());
        let ep = endpoint(&client, 7001);
        assert_eq!(ep.active_connections(), 0);
        assert_eq!(ep.success_count(), 0);
        assert_eq!(ep.error_count(), 0);
        let circuit = client.circuit_breaker().get_state();
        assert_eq!(circuit.failure_count, 0);
        let stream_metrics = client.get_metrics().streams.into_values().next().unwrap();
        assert_eq!(stream_metrics.errors, 0);
    }

    // ===== Lifecycle Tests =====

    #[tokio::test]
    async fn test_start_runs_discovery_and_stop_joins_loops() {
        let transport = Arc::new(MockTransport::default());
        let client = RpcClient::builder(config(), transport)
            .discovery(StaticDiscovery::new(vec![
                DiscoveredEndpoint::new("10.0.0.1", 7001),
                DiscoveredEndpoint::new("10.0.0.1", 7002).with_weight(3),
            ]))
            .build()
            .unwrap();

        client.start().await;
        assert_eq!(client.load_balancer().pool().len(), 2);
        assert_eq!(client.shutdown.task_count(), 1);

        client.stop().await;
        assert_eq!(client.shutdown.task_count(), 0);
        assert!(client.shutdown.is_shutdown());
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let result = RpcClient::builder(
            ClientConfig::new("orders").timeout(Duration::ZERO),
            Arc::new(MockTransport::default()),
        )
        .build();
        assert_eq!(result.err(), Some(ConfigError::NotPositive("timeout")));
    }

    #[tokio::test]
    async fn test_get_metrics_serializes() {
        let client = client_with(config(), Arc::new(MockTransport::default()), &[7001]);
        client.call("Orders/Get", "x".to_string()).await.unwrap();

        let json = serde_json::to_value(client.get_metrics()).unwrap();
        assert_eq!(json["service"], "orders");
        assert_eq!(json["calls"]["total"], 1);
        assert_eq!(json["circuit"]["state"], "closed");
        assert_eq!(json["endpoints"][0]["success_count"], 1);
    }
}
