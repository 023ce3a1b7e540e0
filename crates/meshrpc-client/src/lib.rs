//! HTTP transport for MeshRPC.
//!
//! Provides the [`EndpointInvokerFactory`](meshrpc_cluster::EndpointInvokerFactory)
//! that a [`Directory`](meshrpc_cluster::Directory) uses to reach endpoints
//! speaking JSON-RPC 2.0 over HTTP/1.1.

pub mod http;

pub use http::{HttpEndpointInvoker, HttpInvokerFactory};
