//! Cluster configuration.
//!
//! A [`ClusterConfig`] drives one cluster invoker: which load-balance
//! strategy it uses, how many times it retries, how long each attempt may
//! take, and the tuning knobs of the individual strategies. It can be built
//! in code (all fields have defaults) or loaded from JSON using the
//! camelCase option names:
//!
//! ```
//! use meshrpc_common::config::{ClusterConfig, LoadBalanceStrategy};
//!
//! let config = ClusterConfig::from_json_str(
//!     r#"{"loadBalanceStrategy": "roundRobin", "retries": 3, "timeoutMs": 500}"#,
//! ).unwrap();
//! assert_eq!(config.load_balance_strategy, LoadBalanceStrategy::RoundRobin);
//! assert_eq!(config.retries, 3);
//! assert_eq!(config.virtual_nodes_per_endpoint, 128);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::protocol::error::{MeshrpcError, Result};

/// Endpoint selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadBalanceStrategy {
    /// Weighted random.
    #[default]
    Random,
    /// Smooth weighted round robin.
    RoundRobin,
    /// Consistent hashing on one call argument.
    ConsistentHash,
    /// Least recently used address affinity.
    Lru,
    /// Least frequently used address affinity.
    Lfu,
    /// Latency adaptive, peak EWMA.
    PeakEwma,
}

impl LoadBalanceStrategy {
    pub const ALL: [LoadBalanceStrategy; 6] = [
        LoadBalanceStrategy::Random,
        LoadBalanceStrategy::RoundRobin,
        LoadBalanceStrategy::ConsistentHash,
        LoadBalanceStrategy::Lru,
        LoadBalanceStrategy::Lfu,
        LoadBalanceStrategy::PeakEwma,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalanceStrategy::Random => "random",
            LoadBalanceStrategy::RoundRobin => "roundRobin",
            LoadBalanceStrategy::ConsistentHash => "consistentHash",
            LoadBalanceStrategy::Lru => "lru",
            LoadBalanceStrategy::Lfu => "lfu",
            LoadBalanceStrategy::PeakEwma => "peakEwma",
        }
    }
}

impl fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalanceStrategy {
    type Err = MeshrpcError;

    fn from_str(s: &str) -> Result<Self> {
        LoadBalanceStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| {
                MeshrpcError::InvalidConfig(format!(
                    "unknown load balance strategy '{}' (expected one of random, roundRobin, consistentHash, lru, lfu, peakEwma)",
                    s
                ))
            })
    }
}

/// Configuration for one cluster invoker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    pub load_balance_strategy: LoadBalanceStrategy,
    /// Retries after the first attempt. Total attempts = retries + 1.
    pub retries: usize,
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    /// Admitted calls per second per call site, 0 disables the limiter.
    pub rate_limit_per_second: f64,
    /// Token bucket capacity, 0 means twice the rate.
    pub rate_limit_burst: u32,
    /// Which call argument feeds the consistent hash.
    pub consistent_hash_arg_index: usize,
    pub virtual_nodes_per_endpoint: u32,
    /// Round robin entries unseen for this long are dropped.
    pub recycle_window_ms: u64,
    pub affinity_capacity: usize,
    /// The LRU/LFU table is reset after this long.
    pub affinity_expiry_ms: u64,
    /// Decay time constant for latency samples.
    pub ewma_decay_ms: u64,
    /// Cost charged to an endpoint with calls in flight but no latency sample.
    pub ewma_penalty_ms: f64,
    /// Wait before the first retry, 0 fails over immediately.
    pub retry_backoff_ms: u64,
    pub max_retry_backoff_ms: u64,
    pub retry_backoff_multiplier: f64,
    /// Skip endpoints that report themselves unavailable.
    pub check_available: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            load_balance_strategy: LoadBalanceStrategy::Random,
            retries: 2,
            timeout_ms: 1000,
            rate_limit_per_second: 0.0,
            rate_limit_burst: 0,
            consistent_hash_arg_index: 0,
            virtual_nodes_per_endpoint: 128,
            recycle_window_ms: 60_000,
            affinity_capacity: 32,
            affinity_expiry_ms: 300_000, // 5 minutes
            ewma_decay_ms: 10_000,
            ewma_penalty_ms: 100_000.0,
            retry_backoff_ms: 0,
            max_retry_backoff_ms: 1000,
            retry_backoff_multiplier: 2.0,
            check_available: true,
        }
    }
}

impl ClusterConfig {
    pub fn with_strategy(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.load_balance_strategy = strategy;
        self
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_rate_limit(mut self, per_second: f64) -> Self {
        self.rate_limit_per_second = per_second;
        self
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ClusterConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(MeshrpcError::InvalidConfig("timeoutMs must be > 0".into()));
        }
        if !self.rate_limit_per_second.is_finite() || self.rate_limit_per_second < 0.0 {
            return Err(MeshrpcError::InvalidConfig(
                "rateLimitPerSecond must be a finite number >= 0".into(),
            ));
        }
        if self.virtual_nodes_per_endpoint == 0 {
            return Err(MeshrpcError::InvalidConfig(
                "virtualNodesPerEndpoint must be > 0".into(),
            ));
        }
        if self.recycle_window_ms == 0 {
            return Err(MeshrpcError::InvalidConfig("recycleWindowMs must be > 0".into()));
        }
        if self.affinity_capacity == 0 {
            return Err(MeshrpcError::InvalidConfig("affinityCapacity must be > 0".into()));
        }
        if self.ewma_decay_ms == 0 {
            return Err(MeshrpcError::InvalidConfig("ewmaDecayMs must be > 0".into()));
        }
        if !self.ewma_penalty_ms.is_finite() || self.ewma_penalty_ms < 0.0 {
            return Err(MeshrpcError::InvalidConfig(
                "ewmaPenaltyMs must be a finite number >= 0".into(),
            ));
        }
        if !self.retry_backoff_multiplier.is_finite() || self.retry_backoff_multiplier < 1.0 {
            return Err(MeshrpcError::InvalidConfig(
                "retryBackoffMultiplier must be >= 1.0".into(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn recycle_window(&self) -> Duration {
        Duration::from_millis(self.recycle_window_ms)
    }

    pub fn affinity_expiry(&self) -> Duration {
        Duration::from_millis(self.affinity_expiry_ms)
    }

    pub fn ewma_decay(&self) -> Duration {
        Duration::from_millis(self.ewma_decay_ms)
    }

    /// Backoff before retry number `retry` (1-based), capped.
    pub fn retry_backoff(&self, retry: usize) -> Duration {
        if self.retry_backoff_ms == 0 || retry == 0 {
            return Duration::ZERO;
        }
        let factor = self.retry_backoff_multiplier.powi(retry as i32 - 1);
        let backoff_ms = (self.retry_backoff_ms as f64 * factor) as u64;
        Duration::from_millis(backoff_ms.min(self.max_retry_backoff_ms))
    }
}
