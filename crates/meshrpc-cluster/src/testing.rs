//! Mock endpoints shared by the unit tests of this crate.

use async_trait::async_trait;
use meshrpc_common::protocol::error::{MeshrpcError, Result};
use meshrpc_common::protocol::{Endpoint, Invocation, ServiceKey};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::invoker::{EndpointInvoker, EndpointInvokerFactory, InvokerRef};

#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    /// Answers with its own address
    Echo,
    FailTransient,
    Reject,
    Sleep(Duration),
}

pub(crate) struct MockInvoker {
    endpoint: Endpoint,
    behavior: Behavior,
    available: AtomicBool,
    pub(crate) calls: AtomicUsize,
    pub(crate) destroys: AtomicUsize,
}

impl MockInvoker {
    pub(crate) fn new(endpoint: Endpoint, behavior: Behavior) -> Self {
        Self {
            endpoint,
            behavior,
            available: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EndpointInvoker for MockInvoker {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn invoke(&self, _invocation: &Invocation) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Echo => Ok(json!(self.endpoint.address)),
            Behavior::FailTransient => Err(MeshrpcError::Transport(format!(
                "connection refused by {}",
                self.endpoint.address
            ))),
            Behavior::Reject => Err(MeshrpcError::Rejected {
                code: -32000,
                message: "insufficient funds".into(),
            }),
            Behavior::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(json!(self.endpoint.address))
            }
        }
    }

    async fn destroy(&self) {
        self.available.store(false, Ordering::SeqCst);
        self.destroys.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) fn service() -> ServiceKey {
    ServiceKey::new("test.Echo")
}

pub(crate) fn endpoint(address: &str) -> Endpoint {
    Endpoint::new(service(), address)
}

pub(crate) fn invocation(method: &str, args: Vec<Value>) -> Invocation {
    Invocation::new(service(), method, args)
}

/// Echoing invokers with the given weights.
pub(crate) fn weighted(specs: &[(&str, u32)]) -> Vec<InvokerRef> {
    specs
        .iter()
        .map(|(address, weight)| {
            let endpoint = endpoint(address).with_weight(*weight);
            Arc::new(MockInvoker::new(endpoint, Behavior::Echo)) as InvokerRef
        })
        .collect()
}

pub(crate) fn addresses(invokers: &[InvokerRef]) -> Vec<String> {
    invokers.iter().map(|i| i.address().to_string()).collect()
}

#[derive(Default)]
pub(crate) struct MockFactory {
    delay: Duration,
    failing: Mutex<HashSet<String>>,
    created: Mutex<Vec<Arc<MockInvoker>>>,
}

impl MockFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub(crate) fn fail_for(&self, address: &str) {
        self.failing.lock().insert(address.to_string());
    }

    pub(crate) fn heal(&self, address: &str) {
        self.failing.lock().remove(address);
    }

    pub(crate) fn created(&self) -> Vec<Arc<MockInvoker>> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl EndpointInvokerFactory for MockFactory {
    async fn create(&self, endpoint: &Endpoint) -> Result<InvokerRef> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.lock().contains(&endpoint.address) {
            return Err(MeshrpcError::Transport(format!("cannot connect to {}", endpoint.address)));
        }
        let invoker = Arc::new(MockInvoker::new(endpoint.clone(), Behavior::Echo));
        self.created.lock().push(Arc::clone(&invoker));
        Ok(invoker)
    }
}
