//! Exact-match lookup table.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use super::{to_backends, Backend, BackendDefaults, BackendDefinition, ShardError};

/// Maps a shard key to the backend configured under exactly that key.
#[derive(Debug)]
pub struct LookupStrategy {
    backends: HashMap<String, Arc<Backend>>,
}

impl LookupStrategy {
    /// `config` is an object of shard key to backend definition.
    pub fn from_config(config: &Value, defaults: &BackendDefaults) -> Result<Self, ShardError> {
        let definitions = HashMap::<String, BackendDefinition>::deserialize(config)?;
        Ok(Self {
            backends: to_backends(&definitions, defaults)?,
        })
    }

    pub fn shard(&self, key: &str) -> Option<Arc<Backend>> {
        self.backends.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strategy(config: Value) -> Result<LookupStrategy, ShardError> {
        LookupStrategy::from_config(&config, &BackendDefaults::default())
    }

    #[test]
    fn test_lookup_exact_key() {
        let lookup = strategy(json!({
            "GF-": {"backend_name": "foobar", "backend": "http://go-food"},
            "R-": {"timeout": 100.0, "backend_name": "foobar", "backend": "http://go-ride"}
        }))
        .unwrap();

        let backend = lookup.shard("R-").unwrap();
        assert_eq!(backend.url().as_str(), "http://go-ride/");
    }

    #[test]
    fn test_lookup_miss_is_not_an_error() {
        let lookup = strategy(json!({
            "GF-": {"backend_name": "foobar", "backend": "http://go-food"}
        }))
        .unwrap();

        assert!(lookup.shard("unknown").is_none());
    }

    #[test]
    fn test_empty_config_is_valid() {
        let lookup = strategy(json!({})).unwrap();
        assert!(lookup.shard("anything").is_none());
    }

    #[test]
    fn test_bad_timeout_type_fails() {
        let err = strategy(json!({
            "R-": {"timeout": "abc", "backend_name": "foobar", "backend": "http://go-ride"}
        }))
        .unwrap_err();
        assert!(matches!(err, ShardError::Config(_)));
    }

    #[test]
    fn test_array_config_fails() {
        let err = strategy(json!([])).unwrap_err();
        assert!(matches!(err, ShardError::Config(_)));
    }

    #[test]
    fn test_missing_backend_url_fails() {
        let err = strategy(json!({"R-": {"backend_name": "foobar"}})).unwrap_err();
        assert!(err.to_string().contains("missing backend url in shard config:"));
    }
}
