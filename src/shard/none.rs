//! Single-backend strategy for ACLs that do not shard.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use super::{Backend, BackendDefaults, BackendDefinition, ShardError};

/// Always returns the one configured backend, whatever the key.
#[derive(Debug)]
pub struct NoStrategy {
    backend: Arc<Backend>,
}

impl NoStrategy {
    /// `config` is a single backend definition.
    pub fn from_config(config: &Value, defaults: &BackendDefaults) -> Result<Self, ShardError> {
        let definition = BackendDefinition::deserialize(config)?;
        let backend =
            Backend::from_definition(&definition, defaults).map_err(|source| ShardError::Backend {
                key: definition.backend_name.clone(),
                source,
            })?;

        Ok(Self {
            backend: Arc::new(backend),
        })
    }

    pub fn shard(&self, _key: &str) -> Arc<Backend> {
        Arc::clone(&self.backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_same_backend_for_every_key() {
        let s = NoStrategy::from_config(
            &json!({"backend_name": "foobar", "backend": "http://localhost"}),
            &BackendDefaults::default(),
        )
        .unwrap();

        let a = s.shard("1");
        let b = s.shard("");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.url().as_str(), "http://localhost/");
    }

    #[test]
    fn test_array_config_fails() {
        let err = NoStrategy::from_config(&json!([]), &BackendDefaults::default()).unwrap_err();
        assert!(matches!(err, ShardError::Config(_)));
    }

    #[test]
    fn test_missing_url_fails() {
        let err =
            NoStrategy::from_config(&json!({"backend_name": "foobar"}), &BackendDefaults::default())
                .unwrap_err();
        assert!(err.to_string().contains("missing backend url in shard config:"));
    }
}
