//! Named matcher and sharder strategies available to endpoints.
//!
//! The registry is built once at startup and shared read-only; tests
//! build their own with `Registry::empty()` and register what they need.

use std::collections::HashMap;

use crate::proxy::MatcherKind;
use crate::shard::{self, BackendDefaults, SharderFactory};

#[derive(Debug, Clone)]
pub struct Registry {
    matchers: HashMap<String, MatcherKind>,
    sharders: HashMap<String, SharderFactory>,
    defaults: BackendDefaults,
}

impl Registry {
    /// A registry with no strategies.
    pub fn empty(defaults: BackendDefaults) -> Self {
        Self {
            matchers: HashMap::new(),
            sharders: HashMap::new(),
            defaults,
        }
    }

    /// Every built-in matcher and sharder, with the given backend defaults.
    pub fn with_defaults(defaults: BackendDefaults) -> Self {
        let mut registry = Self::empty(defaults);
        for kind in MatcherKind::ALL {
            registry.register_matcher(kind.name(), kind);
        }
        for (name, factory) in shard::builtin() {
            registry.register_sharder(name, factory);
        }
        registry
    }

    pub fn register_matcher(&mut self, name: &str, kind: MatcherKind) -> &mut Self {
        self.matchers.insert(name.to_string(), kind);
        self
    }

    pub fn register_sharder(&mut self, name: &str, factory: SharderFactory) -> &mut Self {
        self.sharders.insert(name.to_string(), factory);
        self
    }

    pub fn matcher(&self, name: &str) -> Option<MatcherKind> {
        self.matchers.get(name).copied()
    }

    pub fn sharder(&self, name: &str) -> Option<SharderFactory> {
        self.sharders.get(name).copied()
    }

    pub fn backend_defaults(&self) -> &BackendDefaults {
        &self.defaults
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults(BackendDefaults::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::{ShardError, Sharder};
    use serde_json::Value;

    fn failing(_: &Value, _: &BackendDefaults) -> Result<Sharder, ShardError> {
        Err(ShardError::NoBackends)
    }

    #[test]
    fn test_default_registry_has_builtins() {
        let registry = Registry::default();
        for name in ["header", "multi-headers", "param", "path", "body"] {
            assert!(registry.matcher(name).is_some(), "matcher {}", name);
        }
        for name in ["lookup", "prefix-lookup", "modulo", "hashring", "s2", "none"] {
            assert!(registry.sharder(name).is_some(), "sharder {}", name);
        }
        assert!(registry.matcher("invalid").is_none());
        assert!(registry.sharder("invalid").is_none());
    }

    #[test]
    fn test_empty_registry_isolated_from_builtins() {
        let mut registry = Registry::empty(BackendDefaults::default());
        registry
            .register_matcher("custom-path", MatcherKind::Path)
            .register_sharder("always-fails", failing);

        assert_eq!(registry.matcher("custom-path"), Some(MatcherKind::Path));
        assert!(registry.matcher("path").is_none());
        assert!(registry.sharder("lookup").is_none());

        let factory = registry.sharder("always-fails").unwrap();
        assert!(factory(&Value::Null, registry.backend_defaults()).is_err());
    }
}
