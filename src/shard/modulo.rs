//! Integer modulo sharding.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use super::{to_backends, Backend, BackendDefaults, BackendDefinition, ShardError};

/// Backends are keyed `"0"`..`"N-1"`; an integer key `k` goes to bucket
/// `k mod N`. Negative keys use the euclidean remainder.
#[derive(Debug)]
pub struct ModuloStrategy {
    backends: HashMap<String, Arc<Backend>>,
}

impl ModuloStrategy {
    pub fn from_config(config: &Value, defaults: &BackendDefaults) -> Result<Self, ShardError> {
        let definitions = HashMap::<String, BackendDefinition>::deserialize(config)?;
        Ok(Self {
            backends: to_backends(&definitions, defaults)?,
        })
    }

    pub fn shard(&self, key: &str) -> Result<Option<Arc<Backend>>, ShardError> {
        let id: i64 = key.parse().map_err(|source| ShardError::NotAnInteger {
            key: key.to_string(),
            source,
        })?;

        if self.backends.is_empty() {
            return Ok(None);
        }

        let bucket = id.rem_euclid(self.backends.len() as i64);
        Ok(self.backends.get(&bucket.to_string()).cloned())
    }
}
