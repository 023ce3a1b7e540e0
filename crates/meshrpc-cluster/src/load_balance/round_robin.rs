use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::invoker::InvokerRef;

struct WeightedEntry {
    weight: AtomicI64,
    current: AtomicI64,
    last_seen_ms: AtomicU64,
}

impl WeightedEntry {
    fn new(weight: i64) -> Self {
        Self {
            weight: AtomicI64::new(weight),
            current: AtomicI64::new(0),
            last_seen_ms: AtomicU64::new(0),
        }
    }
}

#[derive(Default)]
struct CallSiteTable {
    entries: DashMap<String, Arc<WeightedEntry>>,
    last_recycle_ms: AtomicU64,
}

/// Smooth weighted round robin (nginx style).
///
/// Each round adds every candidate's weight to its accumulator, picks the
/// largest accumulator (first encountered on ties) and subtracts the round's
/// total weight from the winner. Over `total` selections every endpoint is
/// picked exactly `weight` times, spread out instead of in bursts.
///
/// Accumulators are atomics so concurrent selections on one call site never
/// corrupt them. Entries unseen for a whole recycle window are dropped, at
/// most once per window per call site.
pub struct SmoothRoundRobin {
    tables: DashMap<String, Arc<CallSiteTable>>,
    recycle_window: Duration,
    epoch: Instant,
}

impl SmoothRoundRobin {
    pub fn new(recycle_window: Duration) -> Self {
        Self {
            tables: DashMap::new(),
            recycle_window,
            epoch: Instant::now(),
        }
    }

    pub fn select(&self, call_site: &str, invokers: &[InvokerRef]) -> Option<InvokerRef> {
        let table = self.table(call_site);
        let now = self.now_ms();

        let mut total: i64 = 0;
        let mut best: Option<(i64, &InvokerRef, Arc<WeightedEntry>)> = None;
        for invoker in invokers {
            let weight = i64::from(invoker.weight());
            let entry = table
                .entries
                .entry(invoker.address().to_string())
                .or_insert_with(|| Arc::new(WeightedEntry::new(weight)))
                .clone();

            if entry.weight.swap(weight, Ordering::Relaxed) != weight {
                entry.current.store(0, Ordering::Relaxed);
            }
            let current = entry.current.fetch_add(weight, Ordering::AcqRel) + weight;
            entry.last_seen_ms.store(now, Ordering::Relaxed);
            total += weight;

            if best.as_ref().map_or(true, |(max, _, _)| current > *max) {
                best = Some((current, invoker, entry));
            }
        }

        let (_, selected, entry) = best?;
        entry.current.fetch_sub(total, Ordering::AcqRel);
        self.recycle(call_site, &table, now);
        Some(Arc::clone(selected))
    }

    /// Endpoints currently holding an accumulator for `call_site`.
    pub fn tracked_endpoints(&self, call_site: &str) -> usize {
        self.tables
            .get(call_site)
            .map(|table| table.entries.len())
            .unwrap_or(0)
    }

    fn table(&self, call_site: &str) -> Arc<CallSiteTable> {
        if let Some(table) = self.tables.get(call_site) {
            return Arc::clone(table.value());
        }
        self.tables
            .entry(call_site.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn recycle(&self, call_site: &str, table: &CallSiteTable, now: u64) {
        let window = self.recycle_window.as_millis() as u64;
        let last = table.last_recycle_ms.load(Ordering::Acquire);
        if now.saturating_sub(last) < window {
            return;
        }
        if table
            .last_recycle_ms
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // another selection is recycling this window
            return;
        }

        let before = table.entries.len();
        table
            .entries
            .retain(|_, entry| now.saturating_sub(entry.last_seen_ms.load(Ordering::Relaxed)) < window);
        let evicted = before.saturating_sub(table.entries.len());
        if evicted > 0 {
            debug!(call_site, evicted, "recycled idle round robin entries");
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}
