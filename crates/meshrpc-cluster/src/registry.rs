//! Registry subscription seam and an in-memory registry.
//!
//! A [`Registry`] pushes the full live endpoint set of a service to its
//! subscribers whenever that set changes. Real backends (ZooKeeper, Redis,
//! ...) live outside this crate; [`MemoryRegistry`] serves static
//! deployments, tools and tests.

use meshrpc_common::protocol::error::Result;
use meshrpc_common::protocol::{Endpoint, ServiceKey};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

pub type SubscriptionId = u64;

/// Receives the complete endpoint set of a service on every change.
pub type NotifyListener = Arc<dyn Fn(Vec<Endpoint>) + Send + Sync>;

pub trait Registry: Send + Sync {
    fn subscribe(&self, service: &ServiceKey, listener: NotifyListener) -> Result<SubscriptionId>;

    fn unsubscribe(&self, service: &ServiceKey, id: SubscriptionId) -> Result<()>;
}

#[derive(Default)]
struct ServiceEntry {
    /// `None` until something was registered or published for the service
    endpoints: Option<Vec<Endpoint>>,
    listeners: Vec<(SubscriptionId, NotifyListener)>,
}

/// Registry held entirely in process memory.
///
/// Listeners are called synchronously, in order, and outside the registry's
/// state lock; they must not call back into the registry.
#[derive(Default)]
pub struct MemoryRegistry {
    services: RwLock<HashMap<ServiceKey, ServiceEntry>>,
    /// Serializes notification so listeners observe sets in write order
    notify: Mutex<()>,
    next_id: AtomicU64,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces (same service and address) one endpoint.
    pub fn register(&self, endpoint: Endpoint) {
        let service = endpoint.service.clone();
        self.update(&service, |endpoints| {
            match endpoints.iter().position(|e| *e == endpoint) {
                Some(index) => endpoints[index] = endpoint,
                None => endpoints.push(endpoint),
            }
        });
    }

    /// Returns whether the endpoint was registered.
    pub fn unregister(&self, endpoint: &Endpoint) -> bool {
        let mut removed = false;
        self.update(&endpoint.service, |endpoints| {
            let before = endpoints.len();
            endpoints.retain(|e| e != endpoint);
            removed = endpoints.len() != before;
        });
        removed
    }

    /// Replaces the whole endpoint set of a service.
    pub fn publish(&self, service: &ServiceKey, endpoints: Vec<Endpoint>) {
        self.update(service, move |current| *current = endpoints);
    }

    pub fn endpoints(&self, service: &ServiceKey) -> Vec<Endpoint> {
        self.services
            .read()
            .get(service)
            .and_then(|entry| entry.endpoints.clone())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, service: &ServiceKey) -> usize {
        self.services
            .read()
            .get(service)
            .map(|entry| entry.listeners.len())
            .unwrap_or(0)
    }

    fn update(&self, service: &ServiceKey, change: impl FnOnce(&mut Vec<Endpoint>)) {
        let _ordered = self.notify.lock();
        let (snapshot, listeners) = {
            let mut services = self.services.write();
            let entry = services.entry(service.clone()).or_default();
            let endpoints = entry.endpoints.get_or_insert_with(Vec::new);
            change(endpoints);
            let snapshot = endpoints.clone();
            (snapshot, Self::listeners_of(entry))
        };

        debug!(
            service = %service,
            endpoints = snapshot.len(),
            listeners = listeners.len(),
            "registry notifying subscribers"
        );
        for listener in listeners {
            listener(snapshot.clone());
        }
    }

    fn listeners_of(entry: &ServiceEntry) -> Vec<NotifyListener> {
        entry.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
    }
}

impl Registry for MemoryRegistry {
    /// Delivers the current set right away when the service is known.
    fn subscribe(&self, service: &ServiceKey, listener: NotifyListener) -> Result<SubscriptionId> {
        let _ordered = self.notify.lock();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let current = {
            let mut services = self.services.write();
            let entry = services.entry(service.clone()).or_default();
            entry.listeners.push((id, Arc::clone(&listener)));
            entry.endpoints.clone()
        };

        debug!(service = %service, subscription = id, "registry subscription added");
        if let Some(endpoints) = current {
            listener(endpoints);
        }
        Ok(id)
    }

    fn unsubscribe(&self, service: &ServiceKey, id: SubscriptionId) -> Result<()> {
        if let Some(entry) = self.services.write().get_mut(service) {
            entry.listeners.retain(|(existing, _)| *existing != id);
        }
        debug!(service = %service, subscription = id, "registry subscription removed");
        Ok(())
    }
}
