//! Seams to the transport layer.
//!
//! The cluster never opens connections itself. A transport supplies an
//! [`EndpointInvokerFactory`] that turns a discovered [`Endpoint`] into a live
//! [`EndpointInvoker`]; the directory owns the resulting invokers and tears
//! them down when discovery drops their endpoint.

use async_trait::async_trait;
use meshrpc_common::protocol::error::Result;
use meshrpc_common::protocol::{Endpoint, Invocation};
use serde_json::Value;
use std::sync::Arc;

/// Shared handle to one endpoint invoker.
pub type InvokerRef = Arc<dyn EndpointInvoker>;

/// One concrete network endpoint, ready to carry calls.
#[async_trait]
pub trait EndpointInvoker: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    fn address(&self) -> &str {
        &self.endpoint().address
    }

    fn weight(&self) -> u32 {
        self.endpoint().weight
    }

    fn is_available(&self) -> bool;

    /// Performs one call. Dropping the returned future abandons the call.
    async fn invoke(&self, invocation: &Invocation) -> Result<Value>;

    /// Releases the invoker's connections. Called once by the owner.
    async fn destroy(&self);
}

/// Builds invokers for newly discovered endpoints.
#[async_trait]
pub trait EndpointInvokerFactory: Send + Sync {
    /// May fail per endpoint; the directory retries on the next discovery round.
    async fn create(&self, endpoint: &Endpoint) -> Result<InvokerRef>;
}
