//! Candidate filtering applied before load balancing.

use meshrpc_common::protocol::Invocation;
use std::collections::HashSet;
use std::sync::Arc;

use crate::invoker::InvokerRef;

/// Narrows the candidate list for one attempt.
///
/// `excluded` holds the addresses already tried by the current call.
/// Implementations must not reorder the survivors: several balancers break
/// ties by list order.
pub trait Router: Send + Sync {
    fn name(&self) -> &str;

    fn filter(
        &self,
        invokers: &[InvokerRef],
        invocation: &Invocation,
        excluded: &HashSet<String>,
    ) -> Vec<InvokerRef>;
}

/// Drops endpoints that already failed during this call.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExclusionRouter;

impl Router for ExclusionRouter {
    fn name(&self) -> &str {
        "exclusion"
    }

    fn filter(
        &self,
        invokers: &[InvokerRef],
        _invocation: &Invocation,
        excluded: &HashSet<String>,
    ) -> Vec<InvokerRef> {
        if excluded.is_empty() {
            return invokers.to_vec();
        }
        invokers
            .iter()
            .filter(|invoker| !excluded.contains(invoker.address()))
            .cloned()
            .collect()
    }
}

/// Routers applied in order, each one seeing the previous one's output.
#[derive(Clone)]
pub struct RouterChain {
    routers: Vec<Arc<dyn Router>>,
}

impl RouterChain {
    /// A chain without any router; passes every candidate through.
    pub fn empty() -> Self {
        Self { routers: Vec::new() }
    }

    pub fn with(mut self, router: Arc<dyn Router>) -> Self {
        self.routers.push(router);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.routers.iter().map(|r| r.name()).collect()
    }

    pub fn route(
        &self,
        invokers: &[InvokerRef],
        invocation: &Invocation,
        excluded: &HashSet<String>,
    ) -> Vec<InvokerRef> {
        let mut candidates = invokers.to_vec();
        for router in &self.routers {
            if candidates.is_empty() {
                break;
            }
            candidates = router.filter(&candidates, invocation, excluded);
        }
        candidates
    }
}

impl Default for RouterChain {
    fn default() -> Self {
        Self::empty().with(Arc::new(ExclusionRouter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{addresses, invocation, weighted};

    struct EvenPortsOnly;

    impl Router for EvenPortsOnly {
        fn name(&self) -> &str {
            "even-ports"
        }

        fn filter(
            &self,
            invokers: &[InvokerRef],
            _invocation: &Invocation,
            _excluded: &HashSet<String>,
        ) -> Vec<InvokerRef> {
            invokers
                .iter()
                .filter(|i| {
                    i.address()
                        .rsplit(':')
                        .next()
                        .and_then(|port| port.parse::<u16>().ok())
                        .is_some_and(|port| port % 2 == 0)
                })
                .cloned()
                .collect()
        }
    }

    #[test]
    fn test_exclusion_keeps_order() {
        let invokers = weighted(&[("a:1", 1), ("b:1", 1), ("c:1", 1)]);
        let excluded: HashSet<String> = ["b:1".to_string()].into();

        let routed = ExclusionRouter.filter(&invokers, &invocation("m", vec![]), &excluded);
        assert_eq!(addresses(&routed), vec!["a:1", "c:1"]);
    }

    #[test]
    fn test_exclusion_without_exclusions_passes_everything() {
        let invokers = weighted(&[("a:1", 1), ("b:1", 1)]);
        let routed = ExclusionRouter.filter(&invokers, &invocation("m", vec![]), &HashSet::new());
        assert_eq!(routed.len(), 2);
    }

    #[test]
    fn test_chain_applies_routers_in_order() {
        let invokers = weighted(&[("a:1", 1), ("b:2", 1), ("c:4", 1)]);
        let chain = RouterChain::default().with(Arc::new(EvenPortsOnly));
        assert_eq!(chain.names(), vec!["exclusion", "even-ports"]);

        let excluded: HashSet<String> = ["b:2".to_string()].into();
        let routed = chain.route(&invokers, &invocation("m", vec![]), &excluded);
        assert_eq!(addresses(&routed), vec!["c:4"]);
    }

    #[test]
    fn test_empty_chain_is_identity() {
        let invokers = weighted(&[("a:1", 1)]);
        let excluded: HashSet<String> = ["a:1".to_string()].into();
        let routed = RouterChain::empty().route(&invokers, &invocation("m", vec![]), &excluded);
        assert_eq!(routed.len(), 1);
    }
}
