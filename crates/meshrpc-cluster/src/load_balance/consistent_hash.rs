use dashmap::DashMap;
use meshrpc_common::protocol::Invocation;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::debug;

use crate::invoker::InvokerRef;

/// Immutable ring for one endpoint set.
struct HashRing {
    identity: u64,
    points: BTreeMap<u32, String>,
}

impl HashRing {
    fn build(identity: u64, invokers: &[InvokerRef], virtual_nodes: u32) -> Self {
        let mut points = BTreeMap::new();
        let groups = virtual_nodes.div_ceil(4);
        for invoker in invokers {
            let address = invoker.address();
            let mut placed = 0;
            for group in 0..groups {
                let digest = md5::compute(format!("{}{}", address, group));
                for slot in 0..4 {
                    if placed == virtual_nodes {
                        break;
                    }
                    points.insert(point(&digest.0, slot), address.to_string());
                    placed += 1;
                }
            }
        }
        Self { identity, points }
    }

    /// First point clockwise from `hash`, wrapping around.
    fn locate(&self, hash: u32) -> Option<&str> {
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, address)| address.as_str())
    }
}

/// Little-endian u32 from the `slot`-th 4-byte window of an md5 digest.
fn point(digest: &[u8; 16], slot: usize) -> u32 {
    let offset = slot * 4;
    u32::from_le_bytes([
        digest[offset],
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ])
}

fn key_hash(key: &str) -> u32 {
    point(&md5::compute(key.as_bytes()).0, 0)
}

/// Identity of an endpoint set, independent of list order.
fn set_identity(invokers: &[InvokerRef]) -> u64 {
    let mut addresses: Vec<&str> = invokers.iter().map(|i| i.address()).collect();
    addresses.sort_unstable();
    let mut hasher = DefaultHasher::new();
    addresses.hash(&mut hasher);
    hasher.finish()
}

fn routing_key(argument: Option<&Value>) -> String {
    match argument {
        Some(Value::String(raw)) => raw.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Rings kept per call site. Failover retries select over subsets of the
/// full set, so more than one ring is live at a time.
const RINGS_PER_CALL_SITE: usize = 4;

/// Consistent hashing over `virtual_nodes` points per endpoint.
///
/// Rings are immutable and cached per call site by the identity of the
/// endpoint set they were built from, newest first. A concurrent selection
/// sees either a whole old ring or a whole new one.
pub struct ConsistentHash {
    rings: DashMap<String, Vec<Arc<HashRing>>>,
    virtual_nodes: u32,
    arg_index: usize,
}

impl ConsistentHash {
    pub fn new(virtual_nodes: u32, arg_index: usize) -> Self {
        Self {
            rings: DashMap::new(),
            virtual_nodes: virtual_nodes.max(1),
            arg_index,
        }
    }

    pub fn select(
        &self,
        call_site: &str,
        invocation: &Invocation,
        invokers: &[InvokerRef],
    ) -> Option<InvokerRef> {
        let ring = self.ring(call_site, invokers);
        let key = routing_key(invocation.arg(self.arg_index));
        let address = ring.locate(key_hash(&key))?;

        invokers
            .iter()
            .find(|invoker| invoker.address() == address)
            .or_else(|| invokers.first())
            .map(Arc::clone)
    }

    fn ring(&self, call_site: &str, invokers: &[InvokerRef]) -> Arc<HashRing> {
        let identity = set_identity(invokers);
        if let Some(rings) = self.rings.get(call_site) {
            if let Some(ring) = rings.iter().find(|ring| ring.identity == identity) {
                return Arc::clone(ring);
            }
        }

        let ring = Arc::new(HashRing::build(identity, invokers, self.virtual_nodes));
        debug!(
            call_site,
            endpoints = invokers.len(),
            points = ring.points.len(),
            "built consistent hash ring"
        );

        let mut rings = self.rings.entry(call_site.to_string()).or_default();
        // Another selection may have built the same ring meanwhile
        rings.retain(|cached| cached.identity != identity);
        rings.insert(0, Arc::clone(&ring));
        rings.truncate(RINGS_PER_CALL_SITE);
        ring
    }
}
