//! Transport Port
//!
//! Defines the interface for the actual network call.
//! Implementations wrap real RPC bindings; tests use in-memory fakes.

use crate::domain::entities::{CallContext, Payload};
use crate::domain::value_objects::EndpointAddress;
use crate::error::TransportError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

/// Stream of responses returned by a streaming invocation.
pub type ResponseStream<T> = BoxStream<'static, Result<T, TransportError>>;

/// Outbound port for issuing calls against one endpoint.
///
/// The client core never looks inside requests or responses beyond their
/// encoded size; serialization and connection handling live behind this
/// trait.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Request message. Cloned once per retry attempt.
    type Request: Payload + Clone + Sync;
    /// Response message.
    type Response: Payload;

    /// Issue a unary call.
    async fn invoke(
        &self,
        endpoint: &EndpointAddress,
        request: Self::Request,
        ctx: &CallContext,
        timeout: Duration,
    ) -> Result<Self::Response, TransportError>;

    /// Issue a server-streaming call.
    ///
    /// The default implementation adapts [`Transport::invoke`] into a single
    /// item stream.
    async fn invoke_streaming(
        &self,
        endpoint: &EndpointAddress,
        request: Self::Request,
        ctx: &CallContext,
        timeout: Duration,
    ) -> Result<ResponseStream<Self::Response>, TransportError> {
        let response = self.invoke(endpoint, request, ctx, timeout).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(response) })))
    }
}
