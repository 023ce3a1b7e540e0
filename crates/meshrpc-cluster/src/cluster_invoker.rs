//! Failover cluster invoker.
//!
//! One call walks `SELECT -> INVOKE -> (SUCCESS | RETRY -> SELECT | FAIL)`:
//!
//! 1. Read the directory (the first read waits for discovery, bounded by the
//!    call timeout).
//! 2. Drop unavailable invokers, then run the router chain with the
//!    addresses already tried by this call.
//! 3. Take a rate limiter token, then let the load balancer pick one
//!    invoker. A refused token fails the attempt before any selection.
//! 4. Invoke under the per-attempt timeout.
//! 5. A retryable failure excludes the endpoint and loops back to 1 while
//!    budget remains. Anything else is returned as is.

use meshrpc_common::config::ClusterConfig;
use meshrpc_common::protocol::error::{MeshrpcError, Result};
use meshrpc_common::protocol::{Invocation, RpcArgs};
use meshrpc_common::rate_limit::{RateLimitResult, RateLimiter};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::directory::Directory;
use crate::invoker::InvokerRef;
use crate::load_balance::LoadBalance;
use crate::router::RouterChain;

/// Per-call retry bookkeeping.
#[derive(Debug)]
struct CallAttempt {
    excluded: HashSet<String>,
    remaining_retries: usize,
    attempts: usize,
    last_error: Option<MeshrpcError>,
}

impl CallAttempt {
    fn new(retries: usize) -> Self {
        Self {
            excluded: HashSet::new(),
            remaining_retries: retries,
            attempts: 0,
            last_error: None,
        }
    }

    /// Error for a round that found nothing to select.
    fn no_candidate(self, service: String) -> MeshrpcError {
        match self.last_error {
            Some(last) => MeshrpcError::RetriesExhausted {
                attempts: self.attempts,
                source: Box::new(last),
            },
            None => MeshrpcError::NoAvailableEndpoint(service),
        }
    }
}

pub struct ClusterInvoker {
    directory: Arc<Directory>,
    router: RouterChain,
    load_balance: LoadBalance,
    rate_limiter: RateLimiter,
    config: ClusterConfig,
}

impl ClusterInvoker {
    /// Builds an invoker over `directory` after validating `config`.
    pub fn new(directory: Arc<Directory>, config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            directory,
            router: RouterChain::default(),
            load_balance: LoadBalance::new(&config),
            rate_limiter: RateLimiter::from_cluster(&config),
            config,
        })
    }

    pub fn with_router(mut self, router: RouterChain) -> Self {
        self.router = router;
        self
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn load_balance(&self) -> &LoadBalance {
        &self.load_balance
    }

    /// Calls `method` on the directory's service with default options.
    pub async fn call(&self, method: &str, args: RpcArgs) -> Result<Value> {
        let invocation = Invocation::new(self.directory.service_key().clone(), method, args);
        self.invoke(invocation).await
    }

    pub async fn invoke(&self, invocation: Invocation) -> Result<Value> {
        let service = self.directory.service_key().to_string();
        if self.directory.is_destroyed() {
            return Err(MeshrpcError::DirectoryDestroyed(service));
        }

        let timeout = invocation
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.timeout());
        let mut attempt = CallAttempt::new(invocation.retries.unwrap_or(self.config.retries));

        let mut invokers = match tokio::time::timeout(timeout, self.directory.list()).await {
            Ok(invokers) => invokers,
            Err(_) => {
                warn!(
                    service = %service,
                    timeout_ms = timeout.as_millis() as u64,
                    "no discovery round completed before the call timed out"
                );
                return Err(MeshrpcError::NoAvailableEndpoint(service));
            }
        };

        loop {
            let candidates = self.candidates(&invokers, &invocation, &attempt.excluded);
            if candidates.is_empty() {
                return Err(Self::give_up(attempt, &invocation, service));
            }

            // A refused attempt leaves the balancing state untouched
            let (address, err) = match self.admit(&invocation) {
                Err(limited) => {
                    attempt.attempts += 1;
                    (None, limited)
                }
                Ok(()) => {
                    let Some(invoker) = self.load_balance.select(&invocation, &candidates) else {
                        return Err(Self::give_up(attempt, &invocation, service));
                    };
                    attempt.attempts += 1;
                    match self.dispatch(&invocation, &invoker, timeout).await {
                        Ok(value) => {
                            if attempt.attempts > 1 {
                                debug!(
                                    service = %service,
                                    method = %invocation.method,
                                    address = %invoker.address(),
                                    attempts = attempt.attempts,
                                    "call succeeded after failover"
                                );
                            }
                            return Ok(value);
                        }
                        Err(e) => (Some(invoker.address().to_string()), e),
                    }
                }
            };

            let address_field = address.as_deref().unwrap_or("none");
            if !err.is_retryable() {
                debug!(
                    service = %service,
                    address = address_field,
                    error = %err,
                    "call failed with a non-retryable error"
                );
                return Err(err);
            }

            // A rate-limited attempt never reached an endpoint
            if let Some(address) = &address {
                attempt.excluded.insert(address.clone());
            }

            if attempt.remaining_retries == 0 {
                warn!(
                    service = %service,
                    method = %invocation.method,
                    attempts = attempt.attempts,
                    error = %err,
                    "retries exhausted"
                );
                return Err(MeshrpcError::RetriesExhausted {
                    attempts: attempt.attempts,
                    source: Box::new(err),
                });
            }
            attempt.remaining_retries -= 1;

            let backoff = self.config.retry_backoff(attempt.attempts);
            warn!(
                service = %service,
                method = %invocation.method,
                address = address_field,
                attempt = attempt.attempts,
                remaining = attempt.remaining_retries,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "call attempt failed, failing over"
            );
            attempt.last_error = Some(err);
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }

            invokers = self.directory.list().await;
        }
    }

    fn candidates(
        &self,
        invokers: &[InvokerRef],
        invocation: &Invocation,
        excluded: &HashSet<String>,
    ) -> Vec<InvokerRef> {
        if self.config.check_available {
            let available: Vec<InvokerRef> =
                invokers.iter().filter(|i| i.is_available()).cloned().collect();
            self.router.route(&available, invocation, excluded)
        } else {
            self.router.route(invokers, invocation, excluded)
        }
    }

    fn give_up(attempt: CallAttempt, invocation: &Invocation, service: String) -> MeshrpcError {
        let err = attempt.no_candidate(service);
        warn!(method = %invocation.method, error = %err, "no endpoint left to try");
        err
    }

    /// Takes one token from the call site's bucket.
    fn admit(&self, invocation: &Invocation) -> Result<()> {
        match self.rate_limiter.check(&invocation.call_site()) {
            RateLimitResult::Allowed => Ok(()),
            RateLimitResult::RateLimited { retry_after } => Err(MeshrpcError::RateLimited {
                retry_after_ms: retry_after.as_millis() as u64,
            }),
        }
    }

    async fn dispatch(
        &self,
        invocation: &Invocation,
        invoker: &InvokerRef,
        timeout: Duration,
    ) -> Result<Value> {
        let tracker = self.load_balance.start(invocation, invoker);
        match tokio::time::timeout(timeout, invoker.invoke(invocation)).await {
            Ok(Ok(value)) => {
                tracker.finish();
                Ok(value)
            }
            // A refused connection says nothing about latency
            Ok(Err(e)) if e.is_retryable() => Err(e),
            Ok(Err(e)) => {
                tracker.finish();
                Err(e)
            }
            Err(_) => {
                // The abandoned call's late result is dropped with its future
                tracker.finish();
                Err(MeshrpcError::Timeout(timeout.as_millis() as u64))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::EndpointInvoker;
    use crate::testing::{endpoint, invocation, service, Behavior, MockFactory, MockInvoker};
    use async_trait::async_trait;
    use meshrpc_common::config::LoadBalanceStrategy;
    use meshrpc_common::protocol::Endpoint;

    /// Hands out a fixed behavior per address.
    struct ScriptedFactory {
        scripts: Vec<(&'static str, Behavior)>,
        created: parking_lot::Mutex<Vec<Arc<MockInvoker>>>,
    }

    impl ScriptedFactory {
        fn new(scripts: Vec<(&'static str, Behavior)>) -> Self {
            Self {
                scripts,
                created: parking_lot::Mutex::new(Vec::new()),
            }
        }

        fn invoker(&self, address: &str) -> Arc<MockInvoker> {
            self.created
                .lock()
                .iter()
                .find(|i| i.address() == address)
                .cloned()
                .expect("invoker was never created")
        }
    }

    #[async_trait]
    impl crate::invoker::EndpointInvokerFactory for ScriptedFactory {
        async fn create(&self, endpoint: &Endpoint) -> Result<InvokerRef> {
            let behavior = self
                .scripts
                .iter()
                .find(|(address, _)| *address == endpoint.address)
                .map(|(_, behavior)| behavior.clone())
                .unwrap_or(Behavior::Echo);
            let invoker = Arc::new(MockInvoker::new(endpoint.clone(), behavior));
            self.created.lock().push(Arc::clone(&invoker));
            Ok(invoker)
        }
    }

    async fn cluster(
        scripts: Vec<(&'static str, Behavior)>,
        config: ClusterConfig,
    ) -> (ClusterInvoker, Arc<ScriptedFactory>) {
        let addresses: Vec<&'static str> = scripts.iter().map(|(address, _)| *address).collect();
        let factory = Arc::new(ScriptedFactory::new(scripts));
        let directory = Arc::new(Directory::new(service(), factory.clone()));
        directory.discover(addresses.into_iter().map(endpoint).collect());
        directory.list().await;
        (ClusterInvoker::new(directory, config).unwrap(), factory)
    }

    #[tokio::test]
    async fn test_failover_skips_failing_endpoint() {
        let config = ClusterConfig::default().with_retries(2);
        let (cluster, factory) = cluster(
            vec![
                ("bad:1", Behavior::FailTransient),
                ("ok:2", Behavior::Echo),
                ("ok:3", Behavior::Echo),
            ],
            config,
        )
        .await;

        let bad = factory.invoker("bad:1");
        for _ in 0..50 {
            let before = bad.calls();
            let value = cluster.call("echo", vec![]).await.unwrap();
            assert_ne!(value, serde_json::json!("bad:1"));
            // never retried within one call
            assert!(bad.calls() - before <= 1);
        }
        assert!(bad.calls() > 0);
    }

    #[tokio::test]
    async fn test_exhaustion_after_exactly_three_attempts() {
        let config = ClusterConfig::default()
            .with_retries(2)
            .with_strategy(LoadBalanceStrategy::RoundRobin);
        let (cluster, factory) = cluster(
            vec![
                ("a:1", Behavior::FailTransient),
                ("b:1", Behavior::FailTransient),
                ("c:1", Behavior::FailTransient),
                ("d:1", Behavior::FailTransient),
            ],
            config,
        )
        .await;

        let err = cluster.call("echo", vec![]).await.unwrap_err();
        match err {
            MeshrpcError::RetriesExhausted { attempts, ref source } => {
                assert_eq!(attempts, 3);
                assert!(matches!(**source, MeshrpcError::Transport(_)));
            }
            other => panic!("unexpected error: {other}"),
        }

        let total: usize = ["a:1", "b:1", "c:1", "d:1"]
            .iter()
            .map(|a| factory.invoker(a).calls())
            .sum();
        assert_eq!(total, 3);
        for address in ["a:1", "b:1", "c:1", "d:1"] {
            assert!(factory.invoker(address).calls() <= 1);
        }
    }

    #[tokio::test]
    async fn test_running_out_of_candidates_reports_last_cause() {
        let config = ClusterConfig::default().with_retries(5);
        let (cluster, _) = cluster(
            vec![("a:1", Behavior::FailTransient), ("b:1", Behavior::FailTransient)],
            config,
        )
        .await;

        match cluster.call("echo", vec![]).await.unwrap_err() {
            MeshrpcError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let config = ClusterConfig::default().with_retries(2);
        let (cluster, factory) = cluster(vec![("a:1", Behavior::Reject)], config).await;

        let err = cluster.call("pay", vec![]).await.unwrap_err();
        assert!(matches!(err, MeshrpcError::Rejected { code: -32000, .. }));
        assert_eq!(factory.invoker("a:1").calls(), 1);
    }

    #[tokio::test]
    async fn test_no_endpoint_is_fatal() {
        let directory = Arc::new(Directory::new(service(), Arc::new(MockFactory::new())));
        directory.discover(Vec::new());
        let cluster = ClusterInvoker::new(directory, ClusterConfig::default()).unwrap();

        let err = cluster.call("echo", vec![]).await.unwrap_err();
        assert!(matches!(err, MeshrpcError::NoAvailableEndpoint(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_first_round_wait_is_bounded_by_timeout() {
        let directory = Arc::new(Directory::new(service(), Arc::new(MockFactory::new())));
        let cluster =
            ClusterInvoker::new(directory, ClusterConfig::default().with_timeout_ms(30)).unwrap();

        let err = cluster.call("echo", vec![]).await.unwrap_err();
        assert!(matches!(err, MeshrpcError::NoAvailableEndpoint(_)));
    }

    #[tokio::test]
    async fn test_unavailable_endpoints_are_skipped() {
        let (cluster, factory) = cluster(
            vec![("down:1", Behavior::Echo), ("up:1", Behavior::Echo)],
            ClusterConfig::default(),
        )
        .await;
        factory.invoker("down:1").set_available(false);

        for _ in 0..20 {
            let value = cluster.call("echo", vec![]).await.unwrap();
            assert_eq!(value, serde_json::json!("up:1"));
        }
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out_and_fails_over() {
        let config = ClusterConfig::default()
            .with_timeout_ms(50)
            .with_retries(1)
            .with_strategy(LoadBalanceStrategy::RoundRobin);
        let (cluster, _) = cluster(
            vec![
                ("slow:1", Behavior::Sleep(Duration::from_secs(5))),
                ("fast:1", Behavior::Echo),
            ],
            config,
        )
        .await;

        // round robin tries slow:1 first
        let value = cluster.call("echo", vec![]).await.unwrap();
        assert_eq!(value, serde_json::json!("fast:1"));
    }

    #[tokio::test]
    async fn test_timeout_without_retries() {
        let config = ClusterConfig::default().with_timeout_ms(20).with_retries(0);
        let (cluster, _) =
            cluster(vec![("slow:1", Behavior::Sleep(Duration::from_secs(5)))], config).await;

        match cluster.call("echo", vec![]).await.unwrap_err() {
            MeshrpcError::RetriesExhausted { attempts: 1, source } => {
                assert!(matches!(*source, MeshrpcError::Timeout(20)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_without_network_call() {
        let config = ClusterConfig::default().with_rate_limit(1.0).with_retries(0);
        let (cluster, factory) = cluster(vec![("a:1", Behavior::Echo)], config).await;

        // burst of two tokens at one per second
        cluster.call("echo", vec![]).await.unwrap();
        cluster.call("echo", vec![]).await.unwrap();
        let err = cluster.call("echo", vec![]).await.unwrap_err();
        match err {
            MeshrpcError::RetriesExhausted { source, .. } => {
                assert!(matches!(*source, MeshrpcError::RateLimited { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(factory.invoker("a:1").calls(), 2);
    }

    #[tokio::test]
    async fn test_rate_limited_attempt_does_not_advance_round_robin() {
        let mut config = ClusterConfig::default()
            .with_strategy(LoadBalanceStrategy::RoundRobin)
            .with_rate_limit(10.0)
            .with_retries(0);
        config.rate_limit_burst = 2;
        let (cluster, factory) =
            cluster(vec![("a:1", Behavior::Echo), ("b:1", Behavior::Echo)], config).await;

        assert_eq!(cluster.call("echo", vec![]).await.unwrap(), serde_json::json!("a:1"));
        assert_eq!(cluster.call("echo", vec![]).await.unwrap(), serde_json::json!("b:1"));
        assert!(cluster.call("echo", vec![]).await.is_err());

        // one token back at ten per second
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cluster.call("echo", vec![]).await.unwrap(), serde_json::json!("a:1"));
        assert_eq!(factory.invoker("a:1").calls(), 2);
        assert_eq!(factory.invoker("b:1").calls(), 1);
    }

    #[tokio::test]
    async fn test_per_call_overrides() {
        let (cluster, factory) = cluster(
            vec![("a:1", Behavior::FailTransient), ("b:1", Behavior::FailTransient)],
            ClusterConfig::default().with_retries(5),
        )
        .await;

        let err = cluster
            .invoke(invocation("echo", vec![]).with_retries(0))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshrpcError::RetriesExhausted { attempts: 1, .. }));
        assert_eq!(factory.invoker("a:1").calls() + factory.invoker("b:1").calls(), 1);
    }

    #[tokio::test]
    async fn test_destroyed_directory_is_reported() {
        let (cluster, _) = cluster(vec![("a:1", Behavior::Echo)], ClusterConfig::default()).await;
        cluster.directory().destroy().await;

        let err = cluster.call("echo", vec![]).await.unwrap_err();
        assert!(matches!(err, MeshrpcError::DirectoryDestroyed(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let directory = Arc::new(Directory::new(service(), Arc::new(MockFactory::new())));
        let result = ClusterInvoker::new(directory, ClusterConfig::default().with_timeout_ms(0));
        assert!(matches!(result, Err(MeshrpcError::InvalidConfig(_))));
    }
}
