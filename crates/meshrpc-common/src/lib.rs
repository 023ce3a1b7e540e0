//! MeshRPC Common Types
//!
//! Shared vocabulary of the MeshRPC client-side invocation pipeline:
//!
//! - [`protocol`] - service keys, endpoints, invocations, the JSON-RPC
//!   envelope, and the error taxonomy
//! - [`config`] - the cluster configuration surface
//! - [`rate_limit`] - per-call-site token bucket admission control
//!
//! # Example
//!
//! ```
//! use meshrpc_common::{Endpoint, Invocation, ServiceKey};
//! use serde_json::json;
//!
//! let service = ServiceKey::new("calculator").with_version("1.0");
//! let endpoint = Endpoint::new(service.clone(), "10.0.0.7:9001").with_weight(50);
//! let invocation = Invocation::new(service, "add", vec![json!(1), json!(2)]).with_timeout(500);
//!
//! assert_eq!(endpoint.to_string(), "calculator:1.0@10.0.0.7:9001");
//! assert_eq!(invocation.call_site(), "calculator:1.0.add");
//! ```

pub mod config;
pub mod protocol;
pub mod rate_limit;

pub use config::{ClusterConfig, LoadBalanceStrategy};
pub use protocol::*;
