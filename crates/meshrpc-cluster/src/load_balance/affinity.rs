use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::invoker::InvokerRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityMode {
    /// Least recently used address first
    Lru,
    /// Least frequently used address first
    Lfu,
}

#[derive(Debug, Default, Clone, Copy)]
struct Usage {
    last_used: u64,
    uses: u64,
}

struct AffinityTable {
    entries: HashMap<String, Usage>,
    clock: u64,
    reset_at: Instant,
}

impl AffinityTable {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            clock: 0,
            reset_at: Instant::now(),
        }
    }
}

/// LRU/LFU address affinity.
///
/// Keeps a bounded usage table per call site and hands out the eligible
/// address that was used least recently (LRU) or least often (LFU). Unknown
/// addresses enter with zero usage, so a fresh endpoint is tried first. The
/// whole table is cleared once per expiry window.
pub struct AddressAffinity {
    mode: AffinityMode,
    tables: DashMap<String, Arc<Mutex<AffinityTable>>>,
    capacity: usize,
    expiry: Duration,
}

impl AddressAffinity {
    pub fn new(mode: AffinityMode, capacity: usize, expiry: Duration) -> Self {
        Self {
            mode,
            tables: DashMap::new(),
            capacity: capacity.max(1),
            expiry,
        }
    }

    pub fn mode(&self) -> AffinityMode {
        self.mode
    }

    pub fn select(&self, call_site: &str, invokers: &[InvokerRef]) -> Option<InvokerRef> {
        let table = self
            .tables
            .entry(call_site.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(AffinityTable::new())))
            .clone();
        let mut table = table.lock();

        if table.reset_at.elapsed() >= self.expiry {
            debug!(call_site, tracked = table.entries.len(), "affinity table expired");
            table.entries.clear();
            table.reset_at = Instant::now();
        }

        for invoker in invokers {
            table.entries.entry(invoker.address().to_string()).or_default();
        }

        let mut best: Option<(u64, &InvokerRef)> = None;
        for invoker in invokers {
            let usage = table.entries.get(invoker.address()).copied().unwrap_or_default();
            let rank = self.rank(&usage);
            if best.map_or(true, |(lowest, _)| rank < lowest) {
                best = Some((rank, invoker));
            }
        }
        let (_, selected) = best?;

        table.clock += 1;
        let clock = table.clock;
        if let Some(usage) = table.entries.get_mut(selected.address()) {
            usage.last_used = clock;
            usage.uses += 1;
        }

        if table.entries.len() > self.capacity {
            let eligible: HashSet<&str> = invokers.iter().map(|i| i.address()).collect();
            self.evict(&mut table, &eligible, selected.address());
        }
        Some(Arc::clone(selected))
    }

    /// Addresses tracked for `call_site`.
    pub fn tracked_addresses(&self, call_site: &str) -> usize {
        self.tables
            .get(call_site)
            .map(|table| table.lock().entries.len())
            .unwrap_or(0)
    }

    fn rank(&self, usage: &Usage) -> u64 {
        match self.mode {
            AffinityMode::Lru => usage.last_used,
            AffinityMode::Lfu => usage.uses,
        }
    }

    /// Drops addresses that are no longer candidates first, then the coldest
    /// candidates, until the table fits. The current winner always stays.
    fn evict(&self, table: &mut AffinityTable, eligible: &HashSet<&str>, keep: &str) {
        let mut victims: Vec<(bool, u64, String)> = table
            .entries
            .iter()
            .filter(|(address, _)| address.as_str() != keep)
            .map(|(address, usage)| {
                (eligible.contains(address.as_str()), self.rank(usage), address.clone())
            })
            .collect();
        victims.sort();

        let excess = table.entries.len() - self.capacity;
        for (_, _, address) in victims.into_iter().take(excess) {
            table.entries.remove(&address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::weighted;

    fn picks(affinity: &AddressAffinity, invokers: &[InvokerRef], rounds: usize) -> Vec<String> {
        (0..rounds)
            .map(|_| affinity.select("svc.m", invokers).unwrap().address().to_string())
            .collect()
    }

    #[test]
    fn test_lru_rotates_through_addresses() {
        let lru = AddressAffinity::new(AffinityMode::Lru, 32, Duration::from_secs(300));
        let invokers = weighted(&[("a:1", 1), ("b:1", 1), ("c:1", 1)]);
        assert_eq!(
            picks(&lru, &invokers, 6),
            vec!["a:1", "b:1", "c:1", "a:1", "b:1", "c:1"]
        );
    }

    #[test]
    fn test_lru_prefers_newcomer() {
        let lru = AddressAffinity::new(AffinityMode::Lru, 32, Duration::from_secs(300));
        picks(&lru, &weighted(&[("a:1", 1), ("b:1", 1)]), 4);

        let grown = weighted(&[("a:1", 1), ("b:1", 1), ("c:1", 1)]);
        assert_eq!(picks(&lru, &grown, 1), vec!["c:1"]);
    }

    #[test]
    fn test_lfu_lets_newcomer_catch_up() {
        let lfu = AddressAffinity::new(AffinityMode::Lfu, 32, Duration::from_secs(300));
        picks(&lfu, &weighted(&[("a:1", 1), ("b:1", 1)]), 6);

        let grown = weighted(&[("a:1", 1), ("b:1", 1), ("c:1", 1)]);
        assert_eq!(picks(&lfu, &grown, 3), vec!["c:1", "c:1", "c:1"]);
        assert_eq!(picks(&lfu, &grown, 1), vec!["a:1"]);
    }

    #[test]
    fn test_table_is_bounded() {
        let lru = AddressAffinity::new(AffinityMode::Lru, 2, Duration::from_secs(300));
        picks(&lru, &weighted(&[("a:1", 1), ("b:1", 1)]), 2);
        picks(&lru, &weighted(&[("c:1", 1), ("d:1", 1)]), 2);
        assert_eq!(lru.tracked_addresses("svc.m"), 2);

        // a and b were evicted, so they come back as fresh entries
        let back = weighted(&[("a:1", 1), ("c:1", 1)]);
        assert_eq!(picks(&lru, &back, 1), vec!["a:1"]);
    }

    #[test]
    fn test_table_resets_after_expiry() {
        let lfu = AddressAffinity::new(AffinityMode::Lfu, 32, Duration::from_millis(30));
        let invokers = weighted(&[("a:1", 1), ("b:1", 1)]);
        picks(&lfu, &weighted(&[("b:1", 1)]), 1);
        picks(&lfu, &invokers, 1);

        std::thread::sleep(Duration::from_millis(50));
        // b's history is gone, so order decides again
        let after = weighted(&[("b:1", 1), ("a:1", 1)]);
        assert_eq!(picks(&lfu, &after, 1), vec!["b:1"]);
    }
}
