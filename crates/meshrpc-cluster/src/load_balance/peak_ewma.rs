use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::invoker::InvokerRef;

#[derive(Debug, Clone, Copy)]
struct Estimate {
    cost_ms: f64,
    sampled: bool,
    updated: Instant,
}

struct EndpointLoad {
    in_flight: AtomicU64,
    estimate: Mutex<Estimate>,
    last_touched_ms: AtomicU64,
}

impl EndpointLoad {
    fn new() -> Self {
        Self {
            in_flight: AtomicU64::new(0),
            estimate: Mutex::new(Estimate {
                cost_ms: 0.0,
                sampled: false,
                updated: Instant::now(),
            }),
            last_touched_ms: AtomicU64::new(0),
        }
    }

    /// Peak-sensitive: a slower sample replaces the estimate outright, a
    /// faster one is blended in by how long the estimate has gone unrefreshed.
    fn observe(&self, rtt: Duration, decay: Duration) {
        let rtt_ms = rtt.as_secs_f64() * 1000.0;
        let now = Instant::now();
        let mut estimate = self.estimate.lock();

        if !estimate.sampled {
            estimate.cost_ms = rtt_ms;
            estimate.sampled = true;
        } else if rtt_ms > estimate.cost_ms {
            estimate.cost_ms = rtt_ms;
        } else {
            let elapsed = now.saturating_duration_since(estimate.updated);
            let weight = (-elapsed.as_secs_f64() / decay.as_secs_f64()).exp();
            estimate.cost_ms = estimate.cost_ms * weight + rtt_ms * (1.0 - weight);
        }
        estimate.updated = now;
    }

    fn cost(&self, penalty_ms: f64) -> f64 {
        let in_flight = self.in_flight.load(Ordering::Acquire) as f64;
        let estimate = *self.estimate.lock();

        if !estimate.sampled {
            if in_flight == 0.0 {
                0.0
            } else {
                penalty_ms + in_flight
            }
        } else {
            estimate.cost_ms * (in_flight + 1.0)
        }
    }
}

/// Releases its in-flight slot on drop.
pub(crate) struct InFlight {
    load: Arc<EndpointLoad>,
    decay: Duration,
}

impl InFlight {
    pub(crate) fn complete(self, rtt: Duration) {
        self.load.observe(rtt, self.decay);
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.load.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Default)]
struct CallSiteLoads {
    endpoints: DashMap<String, Arc<EndpointLoad>>,
    last_recycle_ms: AtomicU64,
}

/// Latency adaptive selection (Peak-EWMA).
///
/// Cost of an endpoint is its latency estimate times `in_flight + 1`. An
/// endpoint without any sample costs nothing while idle and `penalty +
/// in_flight` once busy, so untested endpoints get tried without being
/// flooded. The cheapest endpoint wins; ties are broken uniformly at random.
pub struct PeakEwma {
    loads: DashMap<String, Arc<CallSiteLoads>>,
    decay: Duration,
    penalty_ms: f64,
    recycle_window: Duration,
    epoch: Instant,
}

impl PeakEwma {
    pub fn new(decay: Duration, penalty_ms: f64, recycle_window: Duration) -> Self {
        Self {
            loads: DashMap::new(),
            decay,
            penalty_ms,
            recycle_window,
            epoch: Instant::now(),
        }
    }

    pub fn select(&self, call_site: &str, invokers: &[InvokerRef]) -> Option<InvokerRef> {
        let loads = self.call_site(call_site);
        let now = self.now_ms();

        let mut lowest = f64::INFINITY;
        let mut tied: Vec<&InvokerRef> = Vec::new();
        for invoker in invokers {
            let load = Self::load(&loads, invoker.address());
            load.last_touched_ms.store(now, Ordering::Relaxed);
            let cost = load.cost(self.penalty_ms);

            if cost < lowest {
                lowest = cost;
                tied.clear();
                tied.push(invoker);
            } else if cost == lowest {
                tied.push(invoker);
            }
        }

        let selected = match tied.len() {
            0 => None,
            1 => Some(tied[0]),
            n => Some(tied[rand::rng().random_range(0..n)]),
        };
        self.recycle(call_site, &loads, now);
        selected.map(Arc::clone)
    }

    /// Feeds one round-trip sample for `address`.
    pub fn record(&self, call_site: &str, address: &str, rtt: Duration) {
        let loads = self.call_site(call_site);
        Self::load(&loads, address).observe(rtt, self.decay);
    }

    /// Current cost of `address`, `None` when it is not tracked.
    pub fn cost(&self, call_site: &str, address: &str) -> Option<f64> {
        let loads = self.loads.get(call_site)?;
        let load = loads.endpoints.get(address)?;
        Some(load.cost(self.penalty_ms))
    }

    pub(crate) fn begin(&self, call_site: &str, address: &str) -> InFlight {
        let loads = self.call_site(call_site);
        let load = Self::load(&loads, address);
        load.in_flight.fetch_add(1, Ordering::AcqRel);
        load.last_touched_ms.store(self.now_ms(), Ordering::Relaxed);
        InFlight {
            load,
            decay: self.decay,
        }
    }

    fn call_site(&self, call_site: &str) -> Arc<CallSiteLoads> {
        if let Some(loads) = self.loads.get(call_site) {
            return Arc::clone(loads.value());
        }
        self.loads
            .entry(call_site.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn load(loads: &CallSiteLoads, address: &str) -> Arc<EndpointLoad> {
        if let Some(load) = loads.endpoints.get(address) {
            return Arc::clone(load.value());
        }
        loads
            .endpoints
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(EndpointLoad::new()))
            .value()
            .clone()
    }

    /// Forgets idle endpoints nobody selected for a whole recycle window.
    fn recycle(&self, call_site: &str, loads: &CallSiteLoads, now: u64) {
        let window = self.recycle_window.as_millis() as u64;
        let last = loads.last_recycle_ms.load(Ordering::Acquire);
        if now.saturating_sub(last) < window
            || loads
                .last_recycle_ms
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return;
        }

        let before = loads.endpoints.len();
        loads.endpoints.retain(|_, load| {
            load.in_flight.load(Ordering::Acquire) > 0
                || now.saturating_sub(load.last_touched_ms.load(Ordering::Relaxed)) < window
        });
        let evicted = before.saturating_sub(loads.endpoints.len());
        if evicted > 0 {
            debug!(call_site, evicted, "recycled idle latency estimates");
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}
