//! Client-side invocation pipeline for MeshRPC.
//!
//! ```text
//! Registry --notify--> Directory --list--> RouterChain --> LoadBalance --> EndpointInvoker
//!                                     ^                                        |
//!                                     +---- ClusterInvoker retry/failover -----+
//! ```
//!
//! - [`Directory`] tracks the live invokers of one service key and publishes
//!   them as atomically swapped snapshots.
//! - [`RouterChain`] narrows a snapshot for one attempt.
//! - [`LoadBalance`] picks one invoker under the configured strategy.
//! - [`ClusterInvoker`] drives the attempts, retries and rate limiting.
//!
//! The network side is abstracted behind [`EndpointInvoker`] and
//! [`EndpointInvokerFactory`]; discovery behind [`Registry`].

pub mod cluster_invoker;
pub mod directory;
pub mod invoker;
pub mod load_balance;
pub mod registry;
pub mod router;

#[cfg(test)]
mod testing;

pub use cluster_invoker::ClusterInvoker;
pub use directory::{Directory, DirectoryState};
pub use invoker::{EndpointInvoker, EndpointInvokerFactory, InvokerRef};
pub use load_balance::{CallTracker, LoadBalance};
pub use registry::{MemoryRegistry, NotifyListener, Registry, SubscriptionId};
pub use router::{ExclusionRouter, Router, RouterChain};
