use serde::{Deserialize, Serialize};
use std::env;

use crate::event_sourcing::core::{
    ArchiveBehavior, EngineError, EngineResult, NumericSnapshotBehavior, UnhandledEventPolicy,
};

pub const ENV_SNAPSHOT_THRESHOLD: &str = "ENGINE_SNAPSHOT_THRESHOLD";
pub const ENV_ARCHIVE_BEHAVIOR: &str = "ENGINE_ARCHIVE_BEHAVIOR";
pub const ENV_UNHANDLED_EVENTS: &str = "ENGINE_UNHANDLED_EVENTS";
pub const ENV_SCYLLA_NODE: &str = "SCYLLA_NODE";
pub const ENV_SCYLLA_KEYSPACE: &str = "SCYLLA_KEYSPACE";
pub const ENV_METRICS_PORT: &str = "METRICS_PORT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub snapshot_threshold: u64,
    pub archive_behavior: ArchiveBehavior,
    pub unhandled_events: UnhandledEventPolicy,
    pub scylla_node: String,
    pub keyspace: String,
    pub metrics_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_threshold: 100,
            archive_behavior: ArchiveBehavior::Keep,
            unhandled_events: UnhandledEventPolicy::Skip,
            scylla_node: "127.0.0.1:9042".to_string(),
            keyspace: "event_engine".to_string(),
            metrics_port: 9090,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> EngineResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key/value source; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> EngineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_SNAPSHOT_THRESHOLD) {
            config.snapshot_threshold = value.trim().parse().map_err(|_| {
                EngineError::Configuration(format!("{ENV_SNAPSHOT_THRESHOLD} is not a number: {value}"))
            })?;
        }
        if let Some(value) = lookup(ENV_ARCHIVE_BEHAVIOR) {
            config.archive_behavior = value.trim().parse()?;
        }
        if let Some(value) = lookup(ENV_UNHANDLED_EVENTS) {
            config.unhandled_events = match value.trim().to_lowercase().as_str() {
                "skip" => UnhandledEventPolicy::Skip,
                "reject" | "strict" => UnhandledEventPolicy::Reject,
                other => {
                    return Err(EngineError::Configuration(format!(
                        "{ENV_UNHANDLED_EVENTS} must be skip or reject, got {other}"
                    )))
                }
            };
        }
        if let Some(value) = lookup(ENV_SCYLLA_NODE) {
            config.scylla_node = value;
        }
        if let Some(value) = lookup(ENV_SCYLLA_KEYSPACE) {
            config.keyspace = value;
        }
        if let Some(value) = lookup(ENV_METRICS_PORT) {
            config.metrics_port = value.trim().parse().map_err(|_| {
                EngineError::Configuration(format!("{ENV_METRICS_PORT} is not a port: {value}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.snapshot_threshold == 0 {
            return Err(EngineError::Configuration(
                "snapshot threshold must be greater than zero".to_string(),
            ));
        }
        if self.keyspace.is_empty() || !self.keyspace.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(EngineError::Configuration(format!("invalid keyspace name: {:?}", self.keyspace)));
        }
        Ok(())
    }

    pub fn snapshot_behavior(&self) -> EngineResult<NumericSnapshotBehavior> {
        NumericSnapshotBehavior::new(self.snapshot_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.snapshot_behavior().unwrap().threshold(), 100);
    }

    #[test]
    fn test_overrides_from_environment() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_SNAPSHOT_THRESHOLD, "25"),
            (ENV_ARCHIVE_BEHAVIOR, "store_to_archive_table"),
            (ENV_UNHANDLED_EVENTS, "reject"),
            (ENV_SCYLLA_KEYSPACE, "orders"),
            (ENV_METRICS_PORT, "9100"),
        ]))
        .unwrap();

        assert_eq!(config.snapshot_threshold, 25);
        assert_eq!(config.archive_behavior, ArchiveBehavior::StoreToArchiveTable);
        assert_eq!(config.unhandled_events, UnhandledEventPolicy::Reject);
        assert_eq!(config.keyspace, "orders");
        assert_eq!(config.metrics_port, 9100);
    }

    #[test]
    fn test_invalid_values_are_configuration_errors() {
        for pairs in [
            [(ENV_SNAPSHOT_THRESHOLD, "0")],
            [(ENV_SNAPSHOT_THRESHOLD, "many")],
            [(ENV_UNHANDLED_EVENTS, "ignore")],
            [(ENV_ARCHIVE_BEHAVIOR, "shred")],
            [(ENV_SCYLLA_KEYSPACE, "drop table;")],
        ] {
            let err = EngineConfig::from_lookup(lookup(&pairs)).unwrap_err();
            assert!(matches!(err, EngineError::Configuration(_)), "{pairs:?}");
        }
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: EngineConfig = serde_json::from_str(r#"{"snapshot_threshold": 10}"#).unwrap();
        assert_eq!(config.snapshot_threshold, 10);
        assert_eq!(config.keyspace, "event_engine");
    }
}
