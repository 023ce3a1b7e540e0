//! # MeshRPC
//!
//! Client-side invocation pipeline: service directory, routing, load
//! balancing and failover over a pluggable transport.
//!
//! ```no_run
//! use meshrpc::{ClusterConfig, ClusterInvoker, Directory, MemoryRegistry, ServiceKey};
//! # use meshrpc::EndpointInvokerFactory;
//! # use std::sync::Arc;
//! # async fn run(factory: Arc<dyn EndpointInvokerFactory>) -> meshrpc::Result<()> {
//! let service = ServiceKey::new("calc.Math");
//! let registry = Arc::new(MemoryRegistry::new());
//! let directory = Arc::new(Directory::subscribed(service, factory, registry)?);
//! let cluster = ClusterInvoker::new(directory, ClusterConfig::default())?;
//! let sum = cluster.call("add", vec![1.into(), 2.into()]).await?;
//! # Ok(())
//! # }
//! ```

pub use meshrpc_cluster::load_balance;
pub use meshrpc_cluster::{
    CallTracker, ClusterInvoker, Directory, DirectoryState, EndpointInvoker,
    EndpointInvokerFactory, ExclusionRouter, InvokerRef, LoadBalance, MemoryRegistry,
    NotifyListener, Registry, Router, RouterChain, SubscriptionId,
};
pub use meshrpc_common::config::{ClusterConfig, LoadBalanceStrategy};
pub use meshrpc_common::protocol::{
    Endpoint, Invocation, MeshrpcError, Result, RpcArgs, ServiceKey, DEFAULT_WEIGHT,
};
pub use meshrpc_common::rate_limit::{RateLimitConfig, RateLimiter};
