use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use super::endpoint::ServiceKey;

pub type RequestId = u64;
pub type MethodName = String;
pub type RpcArgs = Vec<serde_json::Value>;

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A logical call against a service, independent of which endpoint serves it.
///
/// `timeout_ms` and `retries` override the cluster configuration for this
/// call only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Invocation {
    pub id: RequestId,
    pub service: ServiceKey,
    pub method: MethodName,
    pub args: RpcArgs,
    pub timeout_ms: Option<u64>,
    pub retries: Option<usize>,
}

impl Invocation {
    pub fn new(service: ServiceKey, method: impl Into<String>, args: RpcArgs) -> Self {
        Invocation {
            id: generate_request_id(),
            service,
            method: method.into(),
            args,
            timeout_ms: None,
            retries: None,
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Key scoping per-method load-balance state: `<service key>.<method>`.
    pub fn call_site(&self) -> String {
        format!("{}.{}", self.service, self.method)
    }

    pub fn arg(&self, index: usize) -> Option<&serde_json::Value> {
        self.args.get(index)
    }
}

fn generate_request_id() -> RequestId {
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let counter = REQUEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst);

    // Upper 32 bits from the clock, lower 32 bits from the counter
    (timestamp & 0xFFFFFFFF00000000) | (counter & 0xFFFFFFFF)
}
