//! Stream Coordinator
//!
//! Drives the four call patterns over caller-supplied message streams,
//! applying size limits, interceptors, backpressure and metrics.

use crate::config::StreamingConfig;
use crate::domain::entities::{CallContext, Payload, StreamHandle, StreamInfo, StreamMetrics};
use crate::domain::value_objects::{BackpressureStrategy, StreamPattern, StreamState};
use crate::error::{BoxError, ConfigError, StreamingError, StreamingFailure};
use crate::streaming::buffer::{PutOutcome, StreamBuffer};
use crate::streaming::interceptor::{InterceptorChain, StreamInterceptor};
use crate::streaming::metrics::StreamMetricsCollector;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Stream of outbound messages produced by the coordinator.
pub type CoordinatedStream<T> = BoxStream<'static, Result<T, StreamingError>>;

type Registry<T> = Arc<DashMap<String, Arc<LiveStream<T>>>>;

/// Registry and driver for live streams.
///
/// Cloning is cheap and shares the registry, metrics and interceptors.
pub struct StreamCoordinator<T> {
    config: Arc<StreamingConfig>,
    interceptors: Arc<InterceptorChain<T>>,
    metrics: Arc<StreamMetricsCollector>,
    streams: Registry<T>,
}

impl<T> Clone for StreamCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            interceptors: self.interceptors.clone(),
            metrics: self.metrics.clone(),
            streams: self.streams.clone(),
        }
    }
}

impl<T: Payload> StreamCoordinator<T> {
    /// Create a coordinator, rejecting an invalid `config`.
    pub fn new(config: StreamingConfig) -> Result<Self, ConfigError> {
        let config = config.build()?;
        Ok(Self {
            config: Arc::new(config),
            interceptors: Arc::new(InterceptorChain::new()),
            metrics: Arc::new(StreamMetricsCollector::new()),
            streams: Arc::new(DashMap::new()),
        })
    }

    /// Append an interceptor to the chain.
    pub fn with_interceptor(mut self, interceptor: impl StreamInterceptor<T> + 'static) -> Self {
        Arc::make_mut(&mut self.interceptors).push(Arc::new(interceptor));
        self
    }

    /// Replace the interceptor chain.
    pub fn with_interceptors(mut self, chain: InterceptorChain<T>) -> Self {
        self.interceptors = Arc::new(chain);
        self
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn interceptors(&self) -> &InterceptorChain<T> {
        &self.interceptors
    }

    pub fn metrics(&self) -> &Arc<StreamMetricsCollector> {
        &self.metrics
    }

    /// Server streaming: forward every item of `source` to the caller.
    pub fn open_server_stream<S, E>(
        &self,
        stream_id: impl Into<String>,
        source: S,
    ) -> Result<CoordinatedStream<T>, StreamingError>
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.open_server_stream_with(CallContext::new(stream_id, ""), source)
    }

    /// [`open_server_stream`](Self::open_server_stream) with a caller-built
    /// context; the stream id is taken from `ctx.stream_id`.
    pub fn open_server_stream_with<S, E>(
        &self,
        mut ctx: CallContext,
        source: S,
    ) -> Result<CoordinatedStream<T>, StreamingError>
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let guard = self.register(ctx.stream_id.clone(), StreamPattern::ServerStreaming, None)?;
        let live = guard.live.clone();
        let this = self.clone();

        let stream = async_stream::stream! {
            let _guard = guard;
            let handle = &live.handle;
            let mut source = Box::pin(source);

            loop {
                if handle.is_closed() {
                    break;
                }

                let step = match this.pull(&live, &mut source).await {
                    Ok(Some(_)) if handle.is_closed() => Ok(None),
                    Ok(Some(item)) => this.outbound(handle, item, &mut ctx).await.map(Some),
                    Ok(None) => Ok(None),
                    // Closed while waiting: end quietly
                    Err(_) if handle.is_closed() => Ok(None),
                    Err(cause) => Err(cause),
                };

                match step {
                    Ok(Some(message)) => {
                        yield Ok(message);
                    }
                    Ok(None) => break,
                    Err(cause) => {
                        yield Err(this.fail(handle, cause));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    /// Client streaming: collect every accepted item of `incoming`.
    ///
    /// Items go through a fresh buffer with the configured strategy, so
    /// under DropNewest/DropOldest the result may miss items. Under Block
    /// the buffer is drained while the input is pumped.
    pub async fn open_client_stream<S, E>(
        &self,
        stream_id: impl Into<String>,
        incoming: S,
    ) -> Result<Vec<T>, StreamingError>
    where
        S: Stream<Item = Result<T, E>> + Send,
        E: Into<BoxError>,
    {
        let buffer = Arc::new(self.new_buffer());
        let guard = self.register(
            stream_id.into(),
            StreamPattern::ClientStreaming,
            Some(buffer.clone()),
        )?;
        let live = &guard.live;
        let mut ctx = CallContext::new(live.handle.id(), "");

        let result = if buffer.strategy() == BackpressureStrategy::Block {
            let drain = async {
                let mut items = Vec::new();
                while let Some(item) = buffer.get().await {
                    items.push(item);
                }
                items
            };
            let (pumped, items) = tokio::join!(self.pump(live, &buffer, incoming, &mut ctx), drain);
            pumped.map(|_| items)
        } else {
            self.pump(live, &buffer, incoming, &mut ctx)
                .await
                .map(|_| buffer.drain())
        };

        buffer.close();
        result.map_err(|cause| self.fail(&live.handle, cause))
    }

    /// Bidirectional streaming.
    ///
    /// A producer task pumps `incoming` into a buffer; each buffered item is
    /// passed to `handler`, whose responses are forwarded to the caller.
    /// Producer failures end the input and are logged, not returned.
    pub fn open_bidirectional_stream<S, E, H, R, HE>(
        &self,
        stream_id: impl Into<String>,
        incoming: S,
        mut handler: H,
    ) -> Result<CoordinatedStream<T>, StreamingError>
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
        H: FnMut(T) -> R + Send + 'static,
        R: Stream<Item = Result<T, HE>> + Send + 'static,
        HE: Into<BoxError> + Send + 'static,
    {
        let buffer = Arc::new(self.new_buffer());
        let guard = self.register(
            stream_id.into(),
            StreamPattern::Bidirectional,
            Some(buffer.clone()),
        )?;
        let live = guard.live.clone();

        let producer = {
            let this = self.clone();
            let live = live.clone();
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let id = live.handle.id();
                let mut ctx = CallContext::new(id, "");
                match this.pump(&live, &buffer, incoming, &mut ctx).await {
                    Ok(()) => {}
                    Err(_) if live.handle.is_closed() => {}
                    Err(cause) => {
                        this.metrics.record_error(id);
                        tracing::warn!("bidirectional stream {} producer failed: {}", id, cause);
                    }
                }
            })
        };

        let this = self.clone();
        let stream = async_stream::stream! {
            let _guard = guard;
            let handle = &live.handle;
            let mut producer = ProducerTask(Some(producer));
            let mut ctx = CallContext::new(handle.id(), "");
            let mut failure = None;

            'messages: while let Some(item) = buffer.get().await {
                if handle.is_closed() {
                    break;
                }

                let mut responses = Box::pin(handler(item));
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = live.closed() => None,
                        next = responses.next() => Some(next),
                    };
                    let response = match next {
                        Some(Some(response)) => response,
                        Some(None) => break,
                        None => break 'messages,
                    };

                    let step = match response {
                        Ok(message) => this.outbound(handle, message, &mut ctx).await,
                        Err(e) => Err(StreamingFailure::Handler(e.into())),
                    };
                    match step {
                        Ok(message) => {
                            yield Ok(message);
                        }
                        Err(cause) => {
                            failure = Some(cause);
                            break 'messages;
                        }
                    }
                }
            }

            if let Some(cause) = failure {
                let err = this.fail(handle, cause);
                buffer.close();
                producer.abort_and_join().await;
                yield Err(err);
            }
        };

        Ok(Box::pin(stream))
    }

    /// Single request, single response.
    pub async fn unary<F, Fut, E>(
        &self,
        stream_id: impl Into<String>,
        request: T,
        handler: F,
    ) -> Result<T, StreamingError>
    where
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let guard = self.register(stream_id.into(), StreamPattern::Unary, None)?;
        let handle = &guard.live.handle;
        let mut ctx = CallContext::new(handle.id(), "");

        let result = async {
            let request = self.inbound(request, &mut ctx).await?;
            self.metrics.record_received(handle.id(), request.encoded_len());
            let response = handler(request)
                .await
                .map_err(|e| StreamingFailure::Handler(e.into()))?;
            self.outbound(handle, response, &mut ctx).await
        }
        .await;

        result.map_err(|cause| self.fail(handle, cause))
    }

    pub fn get_metrics(&self, stream_id: &str) -> Option<StreamMetrics> {
        self.metrics.get(stream_id)
    }

    pub fn get_all_metrics(&self) -> HashMap<String, StreamMetrics> {
        self.metrics.get_all()
    }

    /// Live streams, including those currently signalling backpressure.
    pub fn get_active_streams(&self) -> Vec<StreamInfo> {
        self.streams
            .iter()
            .filter(|e| {
                matches!(
                    e.value().handle.state(),
                    StreamState::Active | StreamState::Backpressure
                )
            })
            .map(|e| e.value().handle.info())
            .collect()
    }

    pub fn get_stream(&self, stream_id: &str) -> Option<StreamInfo> {
        self.streams.get(stream_id).map(|l| l.handle.info())
    }

    /// Shared handle of a registered stream.
    ///
    /// The handle stays valid after the stream is deregistered, so callers
    /// can inspect how it ended.
    pub fn stream_handle(&self, stream_id: &str) -> Option<Arc<StreamHandle>> {
        self.streams.get(stream_id).map(|l| l.handle.clone())
    }

    /// Number of registered streams.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Cancel a stream and deregister it.
    ///
    /// Its buffer is closed and any wait on its source or buffer is woken,
    /// so the stream ends without waiting for more input.
    pub fn close_stream(&self, stream_id: &str) -> bool {
        match self.streams.remove(stream_id) {
            Some((_, live)) => {
                live.cancel();
                tracing::debug!("closing {} stream {}", live.handle.pattern(), stream_id);
                true
            }
            None => false,
        }
    }

    /// Cancel every registered stream. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let live: Vec<Arc<LiveStream<T>>> =
            self.streams.iter().map(|e| e.value().clone()).collect();
        for stream in &live {
            self.streams
                .remove_if(stream.handle.id(), |_, l| Arc::ptr_eq(l, stream));
            stream.cancel();
        }
        if !live.is_empty() {
            tracing::debug!("closed {} streams", live.len());
        }
        live.len()
    }

    fn new_buffer(&self) -> StreamBuffer<T> {
        StreamBuffer::new(self.config.max_buffer_size, self.config.backpressure_strategy)
    }

    fn register(
        &self,
        stream_id: String,
        pattern: StreamPattern,
        buffer: Option<Arc<StreamBuffer<T>>>,
    ) -> Result<StreamGuard<T>, StreamingError> {
        let max = self.config.max_concurrent_streams;
        if self.streams.len() >= max {
            return Err(StreamingError::new(
                pattern,
                stream_id,
                StreamingFailure::TooManyStreams { max },
            ));
        }

        let live = Arc::new(LiveStream {
            handle: Arc::new(StreamHandle::new(stream_id.clone(), pattern)),
            buffer,
            wake: Notify::new(),
        });
        match self.streams.entry(stream_id) {
            Entry::Occupied(mut entry) => {
                if !entry.get().handle.is_closed() {
                    return Err(StreamingError::new(
                        pattern,
                        entry.key().clone(),
                        StreamingFailure::DuplicateStream,
                    ));
                }
                entry.insert(live.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(live.clone());
            }
        }

        live.handle.transition(StreamState::Active);
        tracing::debug!("opened {} stream {}", pattern, live.handle.id());

        Ok(StreamGuard {
            streams: self.streams.clone(),
            live,
        })
    }

    /// Wait for the next upstream item, bounded by `stream_timeout`.
    ///
    /// Fails with `Closed` as soon as the stream is cancelled.
    async fn pull<S, E>(
        &self,
        live: &LiveStream<T>,
        source: &mut Pin<Box<S>>,
    ) -> Result<Option<T>, StreamingFailure>
    where
        S: Stream<Item = Result<T, E>>,
        E: Into<BoxError>,
    {
        let timeout = self.config.stream_timeout;
        tokio::select! {
            biased;
            _ = live.closed() => Err(StreamingFailure::Closed),
            next = tokio::time::timeout(timeout, source.next()) => match next {
                Ok(Some(Ok(item))) => Ok(Some(item)),
                Ok(Some(Err(e))) => Err(StreamingFailure::Upstream(e.into())),
                Ok(None) => Ok(None),
                Err(_) => Err(StreamingFailure::Timeout(timeout)),
            },
        }
    }

    fn check_size(&self, message: &T) -> Result<(), StreamingFailure> {
        let size = message.encoded_len();
        let max = self.config.max_message_size;
        if size > max {
            return Err(StreamingFailure::MessageTooLarge { size, max });
        }
        Ok(())
    }

    /// Size check and request interceptors for an incoming message.
    async fn inbound(&self, message: T, ctx: &mut CallContext) -> Result<T, StreamingFailure> {
        self.check_size(&message)?;
        self.interceptors.apply_request(message, ctx).await
    }

    /// Size check, response interceptors and send accounting.
    async fn outbound(
        &self,
        handle: &StreamHandle,
        message: T,
        ctx: &mut CallContext,
    ) -> Result<T, StreamingFailure> {
        self.check_size(&message)?;
        let message = self.interceptors.apply_response(message, ctx).await?;
        self.metrics.record_sent(handle.id(), message.encoded_len());
        Ok(message)
    }

    /// Move `incoming` into `buffer` until it ends, fails or the stream is
    /// closed. The buffer is closed on every exit.
    async fn pump<S, E>(
        &self,
        live: &LiveStream<T>,
        buffer: &StreamBuffer<T>,
        incoming: S,
        ctx: &mut CallContext,
    ) -> Result<(), StreamingFailure>
    where
        S: Stream<Item = Result<T, E>>,
        E: Into<BoxError>,
    {
        let result = self.feed(live, buffer, incoming, ctx).await;
        buffer.close();
        result
    }

    async fn feed<S, E>(
        &self,
        live: &LiveStream<T>,
        buffer: &StreamBuffer<T>,
        incoming: S,
        ctx: &mut CallContext,
    ) -> Result<(), StreamingFailure>
    where
        S: Stream<Item = Result<T, E>>,
        E: Into<BoxError>,
    {
        let mut incoming = Box::pin(incoming);
        let handle = &live.handle;
        let id = handle.id();

        loop {
            if handle.is_closed() {
                return Err(StreamingFailure::Closed);
            }
            let Some(item) = self.pull(live, &mut incoming).await? else {
                return Ok(());
            };

            let item = self.inbound(item, ctx).await?;
            let size = item.encoded_len();
            let outcome = buffer.offer(item).await;

            match outcome {
                PutOutcome::Closed => return Err(StreamingFailure::Closed),
                PutOutcome::Accepted => {
                    handle.transition(StreamState::Active);
                }
                PutOutcome::Evicted | PutOutcome::Rejected => {
                    handle.transition(StreamState::Backpressure);
                    self.metrics.record_backpressure(id);
                    self.metrics.record_dropped(id);
                    tracing::debug!("stream {} buffer full ({:?})", id, outcome);
                    if self.config.fail_on_backpressure {
                        return Err(StreamingFailure::Backpressure {
                            capacity: buffer.capacity(),
                        });
                    }
                }
            }

            if outcome.is_stored() {
                self.metrics.record_received(id, size);
            }
        }
    }

    /// Record a stream failure and build the caller-facing error.
    fn fail(&self, handle: &StreamHandle, cause: StreamingFailure) -> StreamingError {
        self.metrics.record_error(handle.id());
        handle.transition(StreamState::Error);
        tracing::debug!("{} stream {} failed: {}", handle.pattern(), handle.id(), cause);
        StreamingError::new(handle.pattern(), handle.id(), cause)
    }
}

/// Registry entry: the handle plus what cancelling it has to wake.
struct LiveStream<T> {
    handle: Arc<StreamHandle>,
    buffer: Option<Arc<StreamBuffer<T>>>,
    wake: Notify,
}

impl<T> LiveStream<T> {
    /// Mark the handle cancelled, close the buffer and wake every waiter.
    fn cancel(&self) {
        self.handle.cancel();
        if let Some(buffer) = &self.buffer {
            buffer.close();
        }
        self.wake.notify_waiters();
    }

    /// Resolves once the handle is closed.
    async fn closed(&self) {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent cancel is not missed
            notified.as_mut().enable();
            if self.handle.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// Marks the handle Closed and deregisters it when the stream ends.
struct StreamGuard<T> {
    streams: Registry<T>,
    live: Arc<LiveStream<T>>,
}

impl<T> Drop for StreamGuard<T> {
    fn drop(&mut self) {
        let live = &self.live;
        live.handle.transition(StreamState::Closed);
        self.streams
            .remove_if(live.handle.id(), |_, l| Arc::ptr_eq(l, live));
        tracing::debug!("{} stream {} closed", live.handle.pattern(), live.handle.id());
    }
}

/// Bidirectional input task, aborted when the stream goes away.
struct ProducerTask(Option<JoinHandle<()>>);

impl ProducerTask {
    async fn abort_and_join(&mut self) {
        if let Some(task) = self.0.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for ProducerTask {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            task.abort();
        }
    }
}
