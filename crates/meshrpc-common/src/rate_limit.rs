//! Call admission control.
//!
//! A token bucket per call site (`<service key>.<method>`) gates how many
//! calls per second leave this process. A refused call never touches the
//! network; the cluster invoker turns the refusal into a retryable
//! [`MeshrpcError::RateLimited`](crate::MeshrpcError::RateLimited) so callers
//! back off exactly as they would after a transient failure.
//!
//! # Example
//!
//! ```
//! use meshrpc_common::rate_limit::{RateLimiter, RateLimitConfig};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::new(10.0, 2));
//! assert!(limiter.check("echo.ping").is_allowed());
//! assert!(limiter.check("echo.ping").is_allowed());
//! assert!(!limiter.check("echo.ping").is_allowed());
//!
//! // Call sites do not share buckets
//! assert!(limiter.check("echo.pong").is_allowed());
//! ```

use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::ClusterConfig;

/// Token bucket parameters shared by every call site of one limiter.
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitConfig {
    /// Sustained rate; anything <= 0 disables limiting
    pub requests_per_second: f64,
    /// Bucket capacity
    pub burst_size: u32,
    /// How often idle buckets are swept
    pub cleanup_interval: Duration,
    /// Buckets idle for longer than this are dropped
    pub entry_ttl: Duration,
}

impl RateLimitConfig {
    pub fn new(requests_per_second: f64, burst_size: u32) -> Self {
        Self {
            requests_per_second,
            burst_size,
            cleanup_interval: Duration::from_secs(60),
            entry_ttl: Duration::from_secs(300), // 5 minutes
        }
    }

    /// Burst defaults to twice the rate.
    pub fn per_second(rps: f64) -> Self {
        let burst_size = (rps * 2.0).ceil().max(1.0) as u32;
        Self::new(rps, burst_size)
    }

    pub fn from_cluster(config: &ClusterConfig) -> Self {
        if config.rate_limit_burst == 0 {
            Self::per_second(config.rate_limit_per_second)
        } else {
            Self::new(config.rate_limit_per_second, config.rate_limit_burst)
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.requests_per_second > 0.0
    }
}

impl Default for RateLimitConfig {
    /// Limiting disabled.
    fn default() -> Self {
        Self::new(0.0, 0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed,
    RateLimited { retry_after: Duration },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Allowed => None,
            Self::RateLimited { retry_after } => Some(*retry_after),
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(burst_size: u32, now: Instant) -> Self {
        Self {
            tokens: burst_size as f64,
            last_update: now,
        }
    }

    /// Refills for the time elapsed since the last update, then takes one token.
    fn try_consume(&mut self, config: &RateLimitConfig, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.requests_per_second)
            .min(config.burst_size as f64);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_next_token(&self, config: &RateLimitConfig) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / config.requests_per_second)
        }
    }
}

/// Per-call-site token bucket limiter.
///
/// Each bucket sits behind its own lock inside a sharded map, so call sites
/// never contend with each other.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Mutex<TokenBucket>>,
    last_cleanup: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(RateLimitConfig::default())
    }

    pub fn from_cluster(config: &ClusterConfig) -> Self {
        Self::new(RateLimitConfig::from_cluster(config))
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_enabled()
    }

    /// Takes one token for `call_site`, creating a full bucket on first use.
    pub fn check(&self, call_site: &str) -> RateLimitResult {
        if !self.is_enabled() {
            return RateLimitResult::Allowed;
        }

        let now = Instant::now();
        self.maybe_cleanup(now);

        if !self.buckets.contains_key(call_site) {
            self.buckets
                .entry(call_site.to_string())
                .or_insert_with(|| Mutex::new(TokenBucket::new(self.config.burst_size, now)));
        }

        let Some(bucket) = self.buckets.get(call_site) else {
            // Swept between insert and lookup; the next call recreates it
            return RateLimitResult::Allowed;
        };
        let mut bucket = bucket.lock();
        if bucket.try_consume(&self.config, now) {
            RateLimitResult::Allowed
        } else {
            RateLimitResult::RateLimited {
                retry_after: bucket.time_until_next_token(&self.config),
            }
        }
    }

    fn maybe_cleanup(&self, now: Instant) {
        {
            let mut last_cleanup = self.last_cleanup.lock();
            if now.saturating_duration_since(*last_cleanup) < self.config.cleanup_interval {
                return;
            }
            *last_cleanup = now;
        }

        let ttl = self.config.entry_ttl;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.get_mut().last_update) < ttl);
        let evicted = before.saturating_sub(self.buckets.len());
        if evicted > 0 {
            debug!(evicted, "dropped idle rate limit buckets");
        }
    }

    pub fn tracked_call_sites(&self) -> usize {
        self.buckets.len()
    }
}
