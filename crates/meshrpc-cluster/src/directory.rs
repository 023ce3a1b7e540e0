//! Service directory: the live invoker set of one service key.
//!
//! # Design
//!
//! Readers and the discovery path never share a lock:
//!
//! - The published invoker list lives behind an [`ArcSwap`]. A refresh builds
//!   a whole new list and swaps it in with one pointer store, so a reader
//!   holds either the previous list or the next one, never a mix.
//! - [`Directory::discover`] only overwrites a single-slot mailbox (a
//!   `tokio::sync::watch` channel) and returns. A burst of updates collapses
//!   into whatever set was written last.
//! - One background worker per directory drains the mailbox and runs the
//!   diff. It is the only writer of the published list apart from
//!   [`Directory::destroy`].
//!
//! # Diff round
//!
//! 1. Keep the invokers whose address is still discovered with the same
//!    weight and metadata, mark the rest invalid. A changed endpoint counts
//!    as one removal plus one creation.
//! 2. Create invokers for addresses not held yet, concurrently. A failed
//!    creation is logged and the address is skipped until the next round;
//!    a changed endpoint keeps its previous invoker in that case.
//! 3. Publish `kept + created` atomically.
//! 4. Destroy the invalid invokers in a background task.

use arc_swap::ArcSwap;
use futures::future::join_all;
use futures::FutureExt;
use meshrpc_common::protocol::error::Result;
use meshrpc_common::protocol::{Endpoint, ServiceKey};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::invoker::{EndpointInvokerFactory, InvokerRef};
use crate::registry::{NotifyListener, Registry, SubscriptionId};

/// Lifecycle of a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryState {
    /// No discovery round has completed yet
    Pending,
    Ready,
    /// Terminal
    Destroyed,
}

type Mailbox = Option<Arc<Vec<Endpoint>>>;

struct DirectoryInner {
    service: ServiceKey,
    factory: Arc<dyn EndpointInvokerFactory>,
    invokers: ArcSwap<Vec<InvokerRef>>,
    discovered: watch::Sender<Mailbox>,
    state: watch::Sender<DirectoryState>,
    /// Orders the worker's publish against destroy's final swap
    publish_lock: Mutex<()>,
    destroyed: AtomicBool,
    cancel: CancellationToken,
    subscription: Mutex<Option<(Arc<dyn Registry>, SubscriptionId)>>,
    rounds: AtomicU64,
}

/// Continuously updated invoker set for one service key.
///
/// Must be created inside a tokio runtime: construction spawns the diff
/// worker. Call [`destroy`](Self::destroy) to release the invokers; dropping
/// the directory without it stops the worker and tears the invokers down in
/// the background on a best-effort basis.
pub struct Directory {
    inner: Arc<DirectoryInner>,
}

impl Directory {
    pub fn new(service: ServiceKey, factory: Arc<dyn EndpointInvokerFactory>) -> Self {
        let (discovered, mailbox) = watch::channel(None);
        let (state, _) = watch::channel(DirectoryState::Pending);

        let inner = Arc::new(DirectoryInner {
            service,
            factory,
            invokers: ArcSwap::from_pointee(Vec::new()),
            discovered,
            state,
            publish_lock: Mutex::new(()),
            destroyed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            subscription: Mutex::new(None),
            rounds: AtomicU64::new(0),
        });

        tokio::spawn(DirectoryInner::run(Arc::clone(&inner), mailbox));
        Self { inner }
    }

    /// Creates a directory fed by `registry`.
    pub fn subscribed(
        service: ServiceKey,
        factory: Arc<dyn EndpointInvokerFactory>,
        registry: Arc<dyn Registry>,
    ) -> Result<Self> {
        let directory = Self::new(service, factory);
        directory.subscribe(registry)?;
        Ok(directory)
    }

    /// Routes the registry's notifications for this service into [`discover`](Self::discover).
    ///
    /// Replaces any previous subscription.
    pub fn subscribe(&self, registry: Arc<dyn Registry>) -> Result<()> {
        let weak: Weak<DirectoryInner> = Arc::downgrade(&self.inner);
        let listener: NotifyListener = Arc::new(move |endpoints: Vec<Endpoint>| {
            if let Some(inner) = weak.upgrade() {
                inner.discover(endpoints);
            }
        });

        let id = registry.subscribe(&self.inner.service, listener)?;
        let previous = self.inner.subscription.lock().replace((registry, id));
        if let Some((registry, id)) = previous {
            registry.unsubscribe(&self.inner.service, id)?;
        }
        info!(service = %self.inner.service, subscription = id, "directory subscribed to registry");
        Ok(())
    }

    /// Hands a freshly discovered endpoint set to the worker.
    ///
    /// Never blocks: it overwrites the pending set, if any, and returns.
    pub fn discover(&self, endpoints: Vec<Endpoint>) {
        self.inner.discover(endpoints);
    }

    /// Current invokers, waiting for the first discovery round if needed.
    ///
    /// Empty once the directory is destroyed.
    pub async fn list(&self) -> Arc<Vec<InvokerRef>> {
        let mut state = self.inner.state.subscribe();
        let settled = match state.wait_for(|s| *s != DirectoryState::Pending).await {
            Ok(state) => *state,
            Err(_) => DirectoryState::Destroyed,
        };

        match settled {
            DirectoryState::Destroyed => Arc::new(Vec::new()),
            _ => self.inner.invokers.load_full(),
        }
    }

    /// Current invokers without waiting; empty before the first round.
    pub fn snapshot(&self) -> Arc<Vec<InvokerRef>> {
        self.inner.invokers.load_full()
    }

    pub fn service_key(&self) -> &ServiceKey {
        &self.inner.service
    }

    pub fn state(&self) -> DirectoryState {
        *self.inner.state.borrow()
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == DirectoryState::Ready
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Number of discovery rounds published so far.
    pub fn applied_rounds(&self) -> u64 {
        self.inner.rounds.load(Ordering::SeqCst)
    }

    /// Unsubscribes, stops the worker and destroys every held invoker.
    ///
    /// Idempotent; only the first call does any work. A round still in
    /// flight finishes creating its invokers and destroys them instead of
    /// publishing.
    pub async fn destroy(&self) {
        let Some(invokers) = self.inner.shutdown() else {
            return;
        };

        join_all(invokers.iter().map(|invoker| invoker.destroy())).await;
        info!(
            service = %self.inner.service,
            destroyed = invokers.len(),
            "directory destroyed"
        );
    }
}

impl Drop for Directory {
    fn drop(&mut self) {
        let Some(invokers) = self.inner.shutdown() else {
            return;
        };
        if invokers.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    join_all(invokers.iter().map(|invoker| invoker.destroy())).await;
                });
            }
            Err(_) => warn!(
                service = %self.inner.service,
                leaked = invokers.len(),
                "directory dropped outside a runtime without destroy()"
            ),
        }
    }
}

impl DirectoryInner {
    fn discover(&self, endpoints: Vec<Endpoint>) {
        if self.destroyed.load(Ordering::SeqCst) {
            debug!(service = %self.service, "ignoring discovery for destroyed directory");
            return;
        }

        let mut seen = HashSet::new();
        let mut accepted = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            if endpoint.service != self.service {
                warn!(
                    service = %self.service,
                    endpoint = %endpoint,
                    "ignoring endpoint of another service"
                );
                continue;
            }
            if seen.insert(endpoint.address.clone()) {
                accepted.push(endpoint);
            }
        }

        debug!(service = %self.service, endpoints = accepted.len(), "discovered endpoint set");
        // Overwrites a set the worker has not picked up yet
        self.discovered.send_replace(Some(Arc::new(accepted)));
    }

    async fn run(inner: Arc<DirectoryInner>, mut mailbox: watch::Receiver<Mailbox>) {
        loop {
            tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => break,
                changed = mailbox.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let latest = mailbox.borrow_and_update().clone();
                    let Some(endpoints) = latest else {
                        continue;
                    };

                    let round = AssertUnwindSafe(inner.refresh(endpoints)).catch_unwind().await;
                    if round.is_err() {
                        error!(
                            service = %inner.service,
                            "discovery round panicked, keeping the previous invoker list"
                        );
                    }
                }
            }
        }
        debug!(service = %inner.service, "directory worker stopped");
    }

    async fn refresh(&self, discovered: Arc<Vec<Endpoint>>) {
        let current = self.invokers.load_full();

        let wanted: HashMap<&str, &Endpoint> = discovered
            .iter()
            .map(|endpoint| (endpoint.address.as_str(), endpoint))
            .collect();

        let mut kept = Vec::with_capacity(current.len());
        let mut changed = Vec::new();
        let mut invalid = Vec::new();
        for invoker in current.iter() {
            match wanted.get(invoker.address()) {
                Some(endpoint) if same_advertisement(invoker.endpoint(), endpoint) => {
                    kept.push(Arc::clone(invoker))
                }
                Some(_) => changed.push(Arc::clone(invoker)),
                None => invalid.push(Arc::clone(invoker)),
            }
        }

        let held: HashSet<&str> = kept.iter().map(|i| i.address()).collect();
        let to_create: Vec<&Endpoint> = discovered
            .iter()
            .filter(|endpoint| !held.contains(endpoint.address.as_str()))
            .collect();

        let results = join_all(to_create.iter().map(|endpoint| async move {
            (*endpoint, self.factory.create(endpoint).await)
        }))
        .await;

        let mut created = Vec::with_capacity(results.len());
        let mut failed = HashSet::new();
        for (endpoint, result) in results {
            match result {
                Ok(invoker) => created.push(invoker),
                Err(e) => {
                    warn!(
                        service = %self.service,
                        address = %endpoint.address,
                        error = %e,
                        "failed to create invoker, will retry on next discovery"
                    );
                    failed.insert(endpoint.address.as_str());
                }
            }
        }

        // A changed endpoint whose replacement failed keeps serving as before
        let mut replaced = 0;
        for invoker in changed {
            if failed.contains(invoker.address()) {
                kept.push(invoker);
            } else {
                replaced += 1;
                invalid.push(invoker);
            }
        }

        let added = created.len() - replaced;
        let removed = invalid.len() - replaced;
        let mut next = kept;
        next.extend(created.iter().cloned());
        let total = next.len();

        {
            let _publish = self.publish_lock.lock();
            if self.cancel.is_cancelled() {
                drop(_publish);
                debug!(service = %self.service, "directory destroyed mid-round, discarding it");
                Self::destroy_in_background(created);
                return;
            }
            self.invokers.store(Arc::new(next));
            self.state.send_if_modified(|state| {
                if *state == DirectoryState::Pending {
                    *state = DirectoryState::Ready;
                    true
                } else {
                    false
                }
            });
        }
        self.rounds.fetch_add(1, Ordering::SeqCst);

        info!(service = %self.service, added, removed, replaced, total, "directory refreshed");
        Self::destroy_in_background(invalid);
    }

    fn destroy_in_background(invokers: Vec<InvokerRef>) {
        if invokers.is_empty() {
            return;
        }
        tokio::spawn(async move {
            join_all(invokers.iter().map(|invoker| invoker.destroy())).await;
        });
    }

    /// Marks the directory terminal and takes the published list.
    ///
    /// Returns `None` when already shut down.
    fn shutdown(&self) -> Option<Arc<Vec<InvokerRef>>> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return None;
        }

        if let Some((registry, id)) = self.subscription.lock().take() {
            if let Err(e) = registry.unsubscribe(&self.service, id) {
                warn!(service = %self.service, error = %e, "failed to unsubscribe from registry");
            }
        }

        self.cancel.cancel();
        let _publish = self.publish_lock.lock();
        let invokers = self.invokers.swap(Arc::new(Vec::new()));
        self.state.send_replace(DirectoryState::Destroyed);
        Some(invokers)
    }
}

/// Whether an invoker built for `held` still matches what discovery reports.
fn same_advertisement(held: &Endpoint, discovered: &Endpoint) -> bool {
    held.weight == discovered.weight && held.metadata == discovered.metadata
}
