//! Service and endpoint identity.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use super::error::MeshrpcError;

/// Weight assumed for endpoints that do not advertise one.
pub const DEFAULT_WEIGHT: u32 = 100;

fn default_weight() -> u32 {
    DEFAULT_WEIGHT
}

/// Logical identity of a remote service.
///
/// Rendered (and parsed) as `[group/]name[:version]`, which is the single
/// string used to scope directories and load-balance statistics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl ServiceKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: None,
            version: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(group) = &self.group {
            write!(f, "{}/", group)?;
        }
        write!(f, "{}", self.name)?;
        if let Some(version) = &self.version {
            write!(f, ":{}", version)?;
        }
        Ok(())
    }
}

impl FromStr for ServiceKey {
    type Err = MeshrpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (group, rest) = match s.split_once('/') {
            Some((group, rest)) => (Some(group), rest),
            None => (None, s),
        };
        let (name, version) = match rest.split_once(':') {
            Some((name, version)) => (name, Some(version)),
            None => (rest, None),
        };

        if name.is_empty() {
            return Err(MeshrpcError::InvalidConfig(format!(
                "service key '{}' has an empty name",
                s
            )));
        }

        let non_empty = |part: Option<&str>| part.filter(|p| !p.is_empty()).map(str::to_string);
        Ok(Self {
            name: name.to_string(),
            group: non_empty(group),
            version: non_empty(version),
        })
    }
}

/// One network-reachable instance of a service, as reported by discovery.
///
/// Two endpoints are the same endpoint when their service key and address
/// match; weight and metadata do not take part in identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub service: ServiceKey,
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Endpoint {
    pub fn new(service: ServiceKey, address: impl Into<String>) -> Self {
        Self {
            service,
            address: address.into(),
            weight: DEFAULT_WEIGHT,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.service == other.service && self.address == other.address
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.service.hash(state);
        self.address.hash(state);
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service, self.address)
    }
}
