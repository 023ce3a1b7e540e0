//! Shared in-process endpoints for the workspace pipeline tests.

#![allow(dead_code)]

use async_trait::async_trait;
use meshrpc::{Endpoint, EndpointInvoker, EndpointInvokerFactory, Invocation, InvokerRef, MeshrpcError, Result, ServiceKey};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Endpoint with adjustable latency and failure switch.
pub struct SimEndpoint {
    endpoint: Endpoint,
    latency_ms: AtomicU64,
    failing: AtomicBool,
    pub calls: AtomicUsize,
    pub destroys: AtomicUsize,
}

impl SimEndpoint {
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EndpointInvoker for SimEndpoint {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn invoke(&self, invocation: &Invocation) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(MeshrpcError::Transport(format!("{} unreachable", self.endpoint.address)));
        }
        Ok(json!({"address": self.endpoint.address, "method": invocation.method}))
    }

    async fn destroy(&self) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
    }
}

/// Keeps every endpoint it creates, keyed by address, for later inspection.
#[derive(Default)]
pub struct SimFactory {
    endpoints: Mutex<HashMap<String, Arc<SimEndpoint>>>,
    created: AtomicUsize,
}

impl SimFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, address: &str) -> Arc<SimEndpoint> {
        self.endpoints
            .lock()
            .get(address)
            .cloned()
            .unwrap_or_else(|| panic!("{} was never created", address))
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EndpointInvokerFactory for SimFactory {
    async fn create(&self, endpoint: &Endpoint) -> Result<InvokerRef> {
        let sim = Arc::new(SimEndpoint {
            endpoint: endpoint.clone(),
            latency_ms: AtomicU64::new(0),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
        });
        self.endpoints
            .lock()
            .insert(endpoint.address.clone(), Arc::clone(&sim));
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(sim)
    }
}

pub fn inventory() -> ServiceKey {
    ServiceKey::new("warehouse.Inventory").with_group("eu")
}

pub fn endpoints(addresses: &[&str]) -> Vec<Endpoint> {
    addresses
        .iter()
        .map(|address| Endpoint::new(inventory(), *address))
        .collect()
}

pub fn address_of(value: &Value) -> String {
    value["address"].as_str().unwrap_or_default().to_string()
}
