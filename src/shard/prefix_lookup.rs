//! Lookup on the leading segment of the shard key.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use super::{to_backends, Backend, BackendDefaults, BackendDefinition, ShardError, DEFAULT_BACKEND_KEY};

const DEFAULT_PREFIX_SPLITTER: &str = "-";

#[derive(Debug, Deserialize)]
struct PrefixLookupConfig {
    #[serde(default)]
    prefix_splitter: String,
    #[serde(default)]
    backends: HashMap<String, BackendDefinition>,
}

/// Routes on the key up to and including the first splitter, falling
/// back to the `default` backend when the prefix is unknown.
#[derive(Debug)]
pub struct PrefixLookupStrategy {
    backends: HashMap<String, Arc<Backend>>,
    prefix_splitter: String,
}

impl PrefixLookupStrategy {
    pub fn from_config(config: &Value, defaults: &BackendDefaults) -> Result<Self, ShardError> {
        let cfg = PrefixLookupConfig::deserialize(config)?;

        if cfg.backends.is_empty() {
            return Err(ShardError::NoBackends);
        }

        let prefix_splitter = if cfg.prefix_splitter.is_empty() {
            DEFAULT_PREFIX_SPLITTER.to_string()
        } else {
            cfg.prefix_splitter
        };

        Ok(Self {
            backends: to_backends(&cfg.backends, defaults)?,
            prefix_splitter,
        })
    }

    pub fn shard(&self, key: &str) -> Option<Arc<Backend>> {
        let prefix = match key.find(&self.prefix_splitter) {
            Some(idx) => &key[..idx + self.prefix_splitter.len()],
            None => key,
        };

        self.backends
            .get(prefix)
            .or_else(|| self.backends.get(DEFAULT_BACKEND_KEY))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strategy(config: Value) -> Result<PrefixLookupStrategy, ShardError> {
        PrefixLookupStrategy::from_config(&config, &BackendDefaults::default())
    }

    #[test]
    fn test_shard_on_default_splitter() {
        let s = strategy(json!({
            "backends": {
                "GK-": {"backend_name": "go-kilat", "backend": "http://go-kilat"},
                "R-": {"backend_name": "go-ride", "backend": "http://go-ride"}
            }
        }))
        .unwrap();

        assert_eq!(s.shard("GK-1234").unwrap().name(), "go-kilat");
        assert_eq!(s.shard("R-77-88").unwrap().name(), "go-ride");
    }

    #[test]
    fn test_shard_on_custom_splitter() {
        let s = strategy(json!({
            "prefix_splitter": "_",
            "backends": {
                "GK_": {"backend_name": "go-kilat", "backend": "http://go-kilat"}
            }
        }))
        .unwrap();

        assert_eq!(s.shard("GK_1234").unwrap().name(), "go-kilat");
        assert!(s.shard("GK-1234").is_none());
    }

    #[test]
    fn test_unknown_prefix_falls_back_to_default() {
        let s = strategy(json!({
            "backends": {
                "GK-": {"backend_name": "go-kilat", "backend": "http://go-kilat"},
                "default": {"backend_name": "sm", "backend": "http://sm"}
            }
        }))
        .unwrap();

        assert_eq!(s.shard("XX-1").unwrap().name(), "sm");
        assert_eq!(s.shard("nosplitter").unwrap().name(), "sm");
    }

    #[test]
    fn test_unknown_prefix_without_default_is_none() {
        let s = strategy(json!({
            "backends": {
                "GK-": {"backend_name": "go-kilat", "backend": "http://go-kilat"}
            }
        }))
        .unwrap();

        assert!(s.shard("XX-1").is_none());
    }

    #[test]
    fn test_no_backends_fails() {
        let err = strategy(json!({"prefix_splitter": "-"})).unwrap_err();
        assert_eq!(err.to_string(), "no backends specified");
    }

    #[test]
    fn test_array_config_fails() {
        assert!(matches!(strategy(json!([])), Err(ShardError::Config(_))));
    }
}
