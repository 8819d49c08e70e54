//! Runtime configuration for clients and resources.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Error variants related to the configuration of a cluster client.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A flat, string-keyed property bag.
///
/// The recognized qualified keys are `cluster.seed` (comma-separated
/// `host:port` seed list), `serializer.*` and `transport.*`; unrecognized
/// keys are carried through untouched for the pluggable layers to consume.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Properties {
    entries: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|v| v.as_str())
    }

    /// All entries under `prefix.`, with the prefix stripped.
    pub fn scoped(&self, prefix: &str) -> Properties {
        let qualified = format!("{}.", prefix);
        let entries = self
            .entries
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(&qualified).map(|rest| (rest.to_string(), v.clone())))
            .collect();
        Properties { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The runtime config for a cluster client.
///
/// Use `Config::build("cluster-name".into()) .. .validate()` to construct.
#[derive(Clone, Debug)]
pub struct Config {
    /// The application specific name of this cluster.
    pub cluster_name: String,
    /// Seed addresses, parsed from the `cluster.seed` property.
    pub seeds: Vec<String>,
    /// The maximum time to await a submitted operation before it fails with
    /// a timeout. The operation may still be applied later; at-most-once
    /// semantics are the Raft client's concern.
    pub request_timeout_ms: u64,
    /// The full property bag, for the serializer and transport layers.
    pub properties: Properties,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            request_timeout_ms: None,
            properties: Properties::new(),
        }
    }
}

/// A configuration builder.
pub struct ConfigBuilder {
    cluster_name: String,
    request_timeout_ms: Option<u64>,
    properties: Properties,
}

impl ConfigBuilder {
    /// Set the `cluster.seed` property from a comma-separated `host:port` list.
    pub fn seeds(mut self, seeds: &str) -> Self {
        self.properties.set("cluster.seed", seeds);
        self
    }

    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout_ms = Some(ms);
        self
    }

    pub fn property(mut self, key: &str, value: &str) -> Self {
        self.properties.set(key, value);
        self
    }

    /// Validate the state of this builder, returning a config on success.
    pub fn validate(self) -> Result<Config, ConfigError> {
        if self.cluster_name.is_empty() {
            return Err(ConfigError::Invalid("cluster_name must not be empty".into()));
        }
        let request_timeout_ms = self.request_timeout_ms.unwrap_or(5_000);
        if request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be > 0".into()));
        }
        let seeds = match self.properties.get("cluster.seed") {
            None => Vec::new(),
            Some(raw) => {
                let mut seeds = Vec::new();
                for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                    let mut parts = entry.rsplitn(2, ':');
                    let port = parts.next().and_then(|p| p.parse::<u16>().ok());
                    let host = parts.next().filter(|h| !h.is_empty());
                    if port.is_none() || host.is_none() {
                        return Err(ConfigError::Invalid(format!("malformed seed address {:?}", entry)));
                    }
                    seeds.push(entry.to_string());
                }
                seeds
            }
        };
        Ok(Config {
            cluster_name: self.cluster_name,
            seeds,
            request_timeout_ms,
            properties: self.properties,
        })
    }
}

/// Ordering policy for the value bags of a multimap, fixed at configure time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueOrder {
    /// Values iterate in insertion order; duplicates allowed.
    Insertion,
    /// Values iterate in their natural (byte-wise) order; duplicates allowed.
    Natural,
    /// Values iterate in insertion order; duplicate values are rejected.
    Dedup,
}

impl Default for ValueOrder {
    fn default() -> Self {
        ValueOrder::Insertion
    }
}

/// Per-resource configuration, replicated through the log by a `Configure`
/// operation and handed to the owning state machine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    entries: BTreeMap<String, String>,
}

impl ResourceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|v| v.as_str())
    }

    pub fn with_value_order(mut self, order: ValueOrder) -> Self {
        let value = match order {
            ValueOrder::Insertion => "insertion",
            ValueOrder::Natural => "natural",
            ValueOrder::Dedup => "dedup",
        };
        self.set("value_order", value);
        self
    }

    pub fn value_order(&self) -> ValueOrder {
        match self.get("value_order") {
            Some("natural") => ValueOrder::Natural,
            Some("dedup") => ValueOrder::Dedup,
            _ => ValueOrder::Insertion,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_parsing() {
        let config = Config::build("test".into()).seeds("10.0.0.1:7000, 10.0.0.2:7000").validate().unwrap();
        assert_eq!(config.seeds, vec!["10.0.0.1:7000".to_string(), "10.0.0.2:7000".to_string()]);

        assert!(Config::build("test".into()).seeds("nonsense").validate().is_err());
        assert!(Config::build("test".into()).seeds(":7000").validate().is_err());
    }

    #[test]
    fn scoped_properties() {
        let config = Config::build("test".into())
            .property("serializer.buffer", "4096")
            .property("transport.nodelay", "true")
            .validate()
            .unwrap();
        assert_eq!(config.properties.scoped("serializer").get("buffer"), Some("4096"));
        assert_eq!(config.properties.scoped("transport").get("nodelay"), Some("true"));
        assert!(config.properties.scoped("unknown").is_empty());
    }

    #[test]
    fn value_order_round_trip() {
        let config = ResourceConfig::new().with_value_order(ValueOrder::Natural);
        assert_eq!(config.value_order(), ValueOrder::Natural);
        assert_eq!(ResourceConfig::new().value_order(), ValueOrder::Insertion);
    }
}
