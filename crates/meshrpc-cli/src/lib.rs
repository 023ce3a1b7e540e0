// Copyright 2025 MeshRPC Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # MeshRPC CLI
//!
//! Helpers behind the `meshrpc` binary: turning command-line input into
//! endpoints, call arguments and a validated [`ClusterConfig`].
//!
//! ## Key Commands
//!
//! - `meshrpc call`: run one call through the full cluster pipeline and print
//!   the raw JSON result

use anyhow::{bail, Context, Result};
use meshrpc_common::config::{ClusterConfig, LoadBalanceStrategy};
use meshrpc_common::protocol::{Endpoint, RpcArgs, ServiceKey};
use std::path::Path;

/// Parses `host:port` or `host:port=weight`.
pub fn parse_endpoint(service: &ServiceKey, raw: &str) -> Result<Endpoint> {
    let (address, weight) = match raw.split_once('=') {
        Some((address, weight)) => {
            let weight: u32 = weight
                .trim()
                .parse()
                .with_context(|| format!("Invalid weight in endpoint '{}'", raw))?;
            (address.trim(), Some(weight))
        }
        None => (raw.trim(), None),
    };

    if address.is_empty() {
        bail!("Invalid endpoint '{}': empty address", raw);
    }
    if address.contains("://") {
        bail!("Invalid endpoint '{}': expected host:port without a scheme", raw);
    }

    let endpoint = Endpoint::new(service.clone(), address);
    Ok(match weight {
        Some(weight) => endpoint.with_weight(weight),
        None => endpoint,
    })
}

/// A JSON array becomes the argument list, any other value a single argument.
pub fn parse_call_args(raw: &str) -> Result<RpcArgs> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| anyhow::anyhow!("Invalid JSON in args: {}", e))?;
    Ok(match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    })
}

/// Command-line overrides applied on top of the configuration file.
#[derive(Debug, Default, Clone)]
pub struct CallOverrides {
    pub strategy: Option<LoadBalanceStrategy>,
    pub retries: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub rate_limit: Option<f64>,
}

pub fn resolve_config(file: Option<&Path>, overrides: &CallOverrides) -> Result<ClusterConfig> {
    let mut config = match file {
        Some(path) => ClusterConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ClusterConfig::default(),
    };

    if let Some(strategy) = overrides.strategy {
        config = config.with_strategy(strategy);
    }
    if let Some(retries) = overrides.retries {
        config = config.with_retries(retries);
    }
    if let Some(timeout_ms) = overrides.timeout_ms {
        config = config.with_timeout_ms(timeout_ms);
    }
    if let Some(rate) = overrides.rate_limit {
        config = config.with_rate_limit(rate);
    }

    config.validate()?;
    Ok(config)
}
