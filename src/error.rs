//! Error Types
//!
//! Streaming, client and transport error taxonomy.

use crate::domain::value_objects::StreamPattern;
use std::time::Duration;

/// Boxed error used for failures coming from external collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why a stream failed.
#[derive(Debug, thiserror::Error)]
pub enum StreamingFailure {
    /// Buffer was full and the caller opted into failing on backpressure
    #[error("backpressure: buffer full ({capacity} items)")]
    Backpressure { capacity: usize },
    /// The upstream source produced an error
    #[error("upstream error: {0}")]
    Upstream(#[source] BoxError),
    /// The response handler produced an error
    #[error("handler error: {0}")]
    Handler(#[source] BoxError),
    /// An interceptor rejected the message
    #[error("interceptor {name} rejected message: {reason}")]
    Interceptor { name: String, reason: String },
    /// A message exceeded `max_message_size`
    #[error("message of {size} bytes exceeds limit of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },
    /// No item arrived within `stream_timeout`
    #[error("no message within {0:?}")]
    Timeout(Duration),
    /// A live stream already uses this id
    #[error("stream id already in use")]
    DuplicateStream,
    /// `max_concurrent_streams` reached
    #[error("concurrent stream limit of {max} reached")]
    TooManyStreams { max: usize },
    /// The stream was closed while in use
    #[error("stream closed")]
    Closed,
}

/// Error raised by a streaming operation, tagged with pattern and stream id.
#[derive(Debug, thiserror::Error)]
#[error("{pattern} stream {stream_id} failed: {cause}")]
pub struct StreamingError {
    pub pattern: StreamPattern,
    pub stream_id: String,
    #[source]
    pub cause: StreamingFailure,
}

impl StreamingError {
    pub fn new(pattern: StreamPattern, stream_id: impl Into<String>, cause: StreamingFailure) -> Self {
        Self {
            pattern,
            stream_id: stream_id.into(),
            cause,
        }
    }

    /// True when this is the opt-in "fail on backpressure" error.
    pub fn is_backpressure(&self) -> bool {
        matches!(self.cause, StreamingFailure::Backpressure { .. })
    }
}

/// Failure reported by a [`Transport`](crate::domain::ports::Transport).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Remote unreachable or connection dropped
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// Remote rejected the call (bad request, permission, not found...)
    #[error("rejected ({code}): {message}")]
    Rejected { code: String, message: String },
    /// Remote failed while processing
    #[error("internal: {0}")]
    Internal(String),
}

impl TransportError {
    /// Rejections are the caller's fault and are never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Rejected { .. })
    }
}

/// Error returned by [`RpcClient`](crate::application::RpcClient) calls.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// No healthy endpoint for the service
    #[error("service {service} unavailable: no healthy endpoints")]
    ServiceUnavailable { service: String },
    /// Circuit breaker rejected the call
    #[error("circuit open for service {service}")]
    CircuitOpen { service: String },
    /// The last attempt exceeded the configured timeout
    #[error("call {method} timed out after {timeout:?} ({attempts} attempts)")]
    Timeout {
        method: String,
        timeout: Duration,
        attempts: u32,
    },
    /// Transport failure after retries were exhausted (or not retryable)
    #[error("call {method} failed after {attempts} attempts: {source}")]
    Client {
        method: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },
    /// Failure while driving a response stream
    #[error(transparent)]
    Streaming(#[from] StreamingError),
}

impl RpcError {
    /// No capacity right now; the caller should retry later.
    pub fn is_retry_later(&self) -> bool {
        matches!(
            self,
            RpcError::ServiceUnavailable { .. } | RpcError::CircuitOpen { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
    #[error("{field} is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },
}
