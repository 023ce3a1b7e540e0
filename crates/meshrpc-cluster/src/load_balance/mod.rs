//! Endpoint selection strategies.
//!
//! [`LoadBalance`] is a closed set of strategies chosen from
//! [`ClusterConfig::load_balance_strategy`]. Every stateful strategy keeps its
//! tables per call site (`<service key>.<method>`) and stores addresses only,
//! never invokers, so a removed endpoint is forgotten once its entry ages out.
//!
//! | Strategy | Ties | State |
//! |---|---|---|
//! | weighted random | n/a | none |
//! | smooth weighted round robin | first encountered | atomic accumulators, lazy recycle |
//! | consistent hash | n/a | immutable ring per endpoint-set identity |
//! | LRU / LFU affinity | first encountered | bounded table, periodic reset |
//! | Peak-EWMA | uniformly random | latency estimate + in-flight counter |

mod affinity;
mod consistent_hash;
mod peak_ewma;
mod random;
mod round_robin;

pub use affinity::{AddressAffinity, AffinityMode};
pub use consistent_hash::ConsistentHash;
pub use peak_ewma::PeakEwma;
pub use random::WeightedRandom;
pub use round_robin::SmoothRoundRobin;

use meshrpc_common::config::{ClusterConfig, LoadBalanceStrategy};
use meshrpc_common::protocol::Invocation;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::invoker::InvokerRef;

pub enum LoadBalance {
    Random(WeightedRandom),
    RoundRobin(SmoothRoundRobin),
    ConsistentHash(ConsistentHash),
    Affinity(AddressAffinity),
    PeakEwma(PeakEwma),
}

impl LoadBalance {
    pub fn new(config: &ClusterConfig) -> Self {
        match config.load_balance_strategy {
            LoadBalanceStrategy::Random => Self::Random(WeightedRandom),
            LoadBalanceStrategy::RoundRobin => {
                Self::RoundRobin(SmoothRoundRobin::new(config.recycle_window()))
            }
            LoadBalanceStrategy::ConsistentHash => Self::ConsistentHash(ConsistentHash::new(
                config.virtual_nodes_per_endpoint,
                config.consistent_hash_arg_index,
            )),
            LoadBalanceStrategy::Lru => Self::Affinity(AddressAffinity::new(
                AffinityMode::Lru,
                config.affinity_capacity,
                config.affinity_expiry(),
            )),
            LoadBalanceStrategy::Lfu => Self::Affinity(AddressAffinity::new(
                AffinityMode::Lfu,
                config.affinity_capacity,
                config.affinity_expiry(),
            )),
            LoadBalanceStrategy::PeakEwma => Self::PeakEwma(PeakEwma::new(
                config.ewma_decay(),
                config.ewma_penalty_ms,
                config.recycle_window(),
            )),
        }
    }

    /// Strategy with every other option at its default.
    pub fn from_strategy(strategy: LoadBalanceStrategy) -> Self {
        Self::new(&ClusterConfig::default().with_strategy(strategy))
    }

    pub fn strategy(&self) -> LoadBalanceStrategy {
        match self {
            Self::Random(_) => LoadBalanceStrategy::Random,
            Self::RoundRobin(_) => LoadBalanceStrategy::RoundRobin,
            Self::ConsistentHash(_) => LoadBalanceStrategy::ConsistentHash,
            Self::Affinity(affinity) => match affinity.mode() {
                AffinityMode::Lru => LoadBalanceStrategy::Lru,
                AffinityMode::Lfu => LoadBalanceStrategy::Lfu,
            },
            Self::PeakEwma(_) => LoadBalanceStrategy::PeakEwma,
        }
    }

    /// Picks one of `invokers` for `invocation`.
    ///
    /// Returns `None` only when `invokers` is empty. The slice is never
    /// reordered.
    pub fn select(&self, invocation: &Invocation, invokers: &[InvokerRef]) -> Option<InvokerRef> {
        match invokers {
            [] => return None,
            [only] => return Some(Arc::clone(only)),
            _ => {}
        }

        let call_site = invocation.call_site();
        let selected = match self {
            Self::Random(random) => random.select(invokers),
            Self::RoundRobin(round_robin) => round_robin.select(&call_site, invokers),
            Self::ConsistentHash(ring) => ring.select(&call_site, invocation, invokers),
            Self::Affinity(affinity) => affinity.select(&call_site, invokers),
            Self::PeakEwma(ewma) => ewma.select(&call_site, invokers),
        };

        if let Some(invoker) = &selected {
            trace!(
                call_site = %call_site,
                address = %invoker.address(),
                strategy = %self.strategy(),
                candidates = invokers.len(),
                "selected endpoint"
            );
        }
        selected
    }

    /// Marks the start of a call on `invoker`.
    ///
    /// Finish the returned tracker with the call's outcome; dropping it
    /// unfinished only releases the in-flight slot.
    pub fn start(&self, invocation: &Invocation, invoker: &InvokerRef) -> CallTracker {
        let in_flight = match self {
            Self::PeakEwma(ewma) => Some(ewma.begin(&invocation.call_site(), invoker.address())),
            _ => None,
        };
        CallTracker {
            in_flight,
            started: Instant::now(),
        }
    }
}

/// One dispatched call, as seen by the load balancer.
pub struct CallTracker {
    in_flight: Option<peak_ewma::InFlight>,
    started: Instant,
}

impl CallTracker {
    /// Reports a completed round trip and returns its duration.
    pub fn finish(mut self) -> Duration {
        let rtt = self.started.elapsed();
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.complete(rtt);
        }
        rtt
    }
}
