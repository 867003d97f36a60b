//! Stream Interceptors
//!
//! Cross-cutting hooks applied to every message of a call, plus the two
//! built-in interceptors: credential injection and rate limiting.

use crate::domain::entities::CallContext;
use crate::domain::ports::TokenSupplier;
use crate::error::{ConfigError, StreamingFailure};
use crate::infrastructure::rate_limiter::{RateLimitConfig, WindowRateLimiter};
use async_trait::async_trait;
use std::sync::Arc;

/// Hook run on each request and response message.
///
/// Both methods default to passing the message through unchanged.
/// Implementations that keep state must synchronize it themselves.
#[async_trait]
pub trait StreamInterceptor<T: Send + 'static>: Send + Sync {
    /// Name used in logs and rejection errors.
    fn name(&self) -> &str;

    async fn intercept_request(
        &self,
        message: T,
        _ctx: &mut CallContext,
    ) -> Result<T, StreamingFailure> {
        Ok(message)
    }

    async fn intercept_response(
        &self,
        message: T,
        _ctx: &mut CallContext,
    ) -> Result<T, StreamingFailure> {
        Ok(message)
    }
}

/// Ordered list of interceptors.
///
/// Requests and responses both run first-to-last; the chain is not
/// unwound in reverse for responses.
pub struct InterceptorChain<T> {
    interceptors: Vec<Arc<dyn StreamInterceptor<T>>>,
}

impl<T: Send + 'static> InterceptorChain<T> {
    pub fn new() -> Self {
        Self {
            interceptors: Vec::new(),
        }
    }

    pub fn push(&mut self, interceptor: Arc<dyn StreamInterceptor<T>>) {
        self.interceptors.push(interceptor);
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, interceptor: impl StreamInterceptor<T> + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.interceptors.iter().map(|i| i.name().to_string()).collect()
    }

    pub async fn apply_request(
        &self,
        mut message: T,
        ctx: &mut CallContext,
    ) -> Result<T, StreamingFailure> {
        for interceptor in &self.interceptors {
            message = interceptor.intercept_request(message, ctx).await?;
        }
        Ok(message)
    }

    pub async fn apply_response(
        &self,
        mut message: T,
        ctx: &mut CallContext,
    ) -> Result<T, StreamingFailure> {
        for interceptor in &self.interceptors {
            message = interceptor.intercept_response(message, ctx).await?;
        }
        Ok(message)
    }
}

impl<T> Clone for InterceptorChain<T> {
    fn clone(&self) -> Self {
        Self {
            interceptors: self.interceptors.clone(),
        }
    }
}

impl<T: Send + 'static> Default for InterceptorChain<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Injects a credential into the call metadata.
pub struct AuthInterceptor {
    supplier: Arc<dyn TokenSupplier>,
    header: String,
    scheme: Option<String>,
}

impl AuthInterceptor {
    /// `authorization: Bearer <token>` from `supplier`.
    pub fn new(supplier: impl TokenSupplier + 'static) -> Self {
        Self {
            supplier: Arc::new(supplier),
            header: "authorization".to_string(),
            scheme: Some("Bearer".to_string()),
        }
    }

    /// Use a different metadata key.
    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.header = header.into();
        self
    }

    /// Send the raw token without a scheme prefix.
    pub fn without_scheme(mut self) -> Self {
        self.scheme = None;
        self
    }

    fn credential(&self) -> Result<String, StreamingFailure> {
        let token = self.supplier.token();
        if token.is_empty() {
            return Err(StreamingFailure::Interceptor {
                name: "auth".to_string(),
                reason: "token supplier returned an empty credential".to_string(),
            });
        }
        Ok(match &self.scheme {
            Some(scheme) => format!("{} {}", scheme, token),
            None => token,
        })
    }
}

#[async_trait]
impl<T: Send + 'static> StreamInterceptor<T> for AuthInterceptor {
    fn name(&self) -> &str {
        "auth"
    }

    async fn intercept_request(
        &self,
        message: T,
        ctx: &mut CallContext,
    ) -> Result<T, StreamingFailure> {
        let credential = self.credential()?;
        ctx.insert_metadata(self.header.clone(), credential);
        Ok(message)
    }
}

/// Suspends requests beyond `max_requests_per_second`.
pub struct RateLimitInterceptor {
    limiter: WindowRateLimiter,
}

impl RateLimitInterceptor {
    pub fn new(max_requests_per_second: u32) -> Result<Self, ConfigError> {
        Self::with_config(RateLimitConfig::per_second(max_requests_per_second))
    }

    /// Fails when the budget or the window is zero.
    pub fn with_config(config: RateLimitConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            limiter: WindowRateLimiter::new(config),
        })
    }

    pub fn limiter(&self) -> &WindowRateLimiter {
        &self.limiter
    }
}

#[async_trait]
impl<T: Send + 'static> StreamInterceptor<T> for RateLimitInterceptor {
    fn name(&self) -> &str {
        "rate_limit"
    }

    async fn intercept_request(
        &self,
        message: T,
        ctx: &mut CallContext,
    ) -> Result<T, StreamingFailure> {
        let waited = self.limiter.acquire().await;
        if !waited.is_zero() {
            tracing::debug!("stream {} throttled for {:?}", ctx.stream_id, waited);
        }
        Ok(message)
    }
}
