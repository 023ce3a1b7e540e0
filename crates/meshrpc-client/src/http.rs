//! HTTP/JSON-RPC endpoint invokers.
//!
//! Each call is POSTed as a JSON-RPC 2.0 envelope to `http://<address>/`.
//! Failures are mapped onto the cluster's retry classification:
//!
//! | Outcome | Error | Retried |
//! |---|---|---|
//! | connect/IO failure | `Transport` | yes |
//! | HTTP 5xx, JSON-RPC `SERVER_UNAVAILABLE` | `EndpointUnavailable` | yes |
//! | other JSON-RPC error object | `Rejected` | no |
//! | unreadable body, unexpected status | `InvalidResponse` | no |

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use meshrpc_cluster::{EndpointInvoker, EndpointInvokerFactory, InvokerRef};
use meshrpc_common::protocol::error::{MeshrpcError, Result};
use meshrpc_common::protocol::{Endpoint, Invocation, JsonRpcRequest, JsonRpcResponse};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

type HttpClient = Client<HttpConnector, Full<Bytes>>;

fn endpoint_uri(address: &str) -> Result<Uri> {
    format!("http://{}/", address)
        .parse::<Uri>()
        .map_err(|e| MeshrpcError::InvalidConfig(format!("invalid endpoint address {}: {}", address, e)))
}

/// Invoker for one HTTP endpoint.
pub struct HttpEndpointInvoker {
    endpoint: Endpoint,
    uri: Uri,
    client: HttpClient,
    available: AtomicBool,
}

impl HttpEndpointInvoker {
    /// Creates an invoker with its own connection pool.
    pub fn new(endpoint: Endpoint) -> Result<Self> {
        Self::with_client(endpoint, Client::builder(TokioExecutor::new()).build_http())
    }

    fn with_client(endpoint: Endpoint, client: HttpClient) -> Result<Self> {
        let uri = endpoint_uri(&endpoint.address)?;
        Ok(Self {
            endpoint,
            uri,
            client,
            available: AtomicBool::new(true),
        })
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    async fn post(&self, body: Vec<u8>) -> Result<(hyper::StatusCode, Bytes)> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.uri.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| MeshrpcError::Transport(format!("Failed to build request: {}", e)))?;

        let response = self.client.request(request).await.map_err(|e| {
            MeshrpcError::Transport(format!("HTTP request to {} failed: {}", self.endpoint.address, e))
        })?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| MeshrpcError::Transport(format!("Failed to read response: {}", e)))?
            .to_bytes();
        Ok((status, body))
    }
}

#[async_trait]
impl EndpointInvoker for HttpEndpointInvoker {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    async fn invoke(&self, invocation: &Invocation) -> Result<Value> {
        if !self.is_available() {
            return Err(MeshrpcError::EndpointUnavailable(format!(
                "{} has been destroyed",
                self.endpoint.address
            )));
        }

        let request = JsonRpcRequest::from(invocation);
        let body = serde_json::to_vec(&request)?;
        trace!(address = %self.endpoint.address, method = %invocation.method, "posting JSON-RPC request");

        let (status, body) = self.post(body).await?;
        if status.is_server_error() {
            return Err(MeshrpcError::EndpointUnavailable(format!(
                "{} answered {}",
                self.endpoint.address, status
            )));
        }
        if !status.is_success() {
            return Err(MeshrpcError::InvalidResponse(format!(
                "{} answered {}",
                self.endpoint.address, status
            )));
        }

        let response: JsonRpcResponse = serde_json::from_slice(&body)
            .map_err(|e| MeshrpcError::InvalidResponse(format!("Malformed JSON-RPC response: {}", e)))?;
        response.into_result()
    }

    async fn destroy(&self) {
        if self.available.swap(false, Ordering::AcqRel) {
            debug!(address = %self.endpoint.address, "HTTP invoker destroyed");
        }
    }
}

/// Creates [`HttpEndpointInvoker`]s sharing one connection pool.
#[derive(Clone)]
pub struct HttpInvokerFactory {
    client: HttpClient,
}

impl HttpInvokerFactory {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }
}

impl Default for HttpInvokerFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EndpointInvokerFactory for HttpInvokerFactory {
    async fn create(&self, endpoint: &Endpoint) -> Result<InvokerRef> {
        let invoker = HttpEndpointInvoker::with_client(endpoint.clone(), self.client.clone())?;
        debug!(endpoint = %endpoint, uri = %invoker.uri(), "created HTTP invoker");
        Ok(Arc::new(invoker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshrpc_common::protocol::ServiceKey;

    fn endpoint(address: &str) -> Endpoint {
        Endpoint::new(ServiceKey::new("calc.Math"), address)
    }

    #[tokio::test]
    async fn test_uri_from_address() {
        let invoker = HttpEndpointInvoker::new(endpoint("127.0.0.1:8080")).unwrap();
        assert_eq!(invoker.uri().to_string(), "http://127.0.0.1:8080/");
    }

    #[tokio::test]
    async fn test_invalid_address_is_rejected() {
        let factory = HttpInvokerFactory::new();
        let result = factory.create(&endpoint("not a host")).await;
        assert!(matches!(result, Err(MeshrpcError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_destroyed_invoker_refuses_calls() {
        let invoker = HttpEndpointInvoker::new(endpoint("127.0.0.1:1")).unwrap();
        invoker.destroy().await;
        assert!(!invoker.is_available());

        let call = Invocation::new(ServiceKey::new("calc.Math"), "add", vec![]);
        let err = invoker.invoke(&call).await.unwrap_err();
        assert!(matches!(err, MeshrpcError::EndpointUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        // Port 1 on loopback is never served in test environments
        let invoker = HttpEndpointInvoker::new(endpoint("127.0.0.1:1")).unwrap();
        let call = Invocation::new(ServiceKey::new("calc.Math"), "add", vec![]);
        let err = invoker.invoke(&call).await.unwrap_err();
        assert!(matches!(err, MeshrpcError::Transport(_)));
    }
}
