//! Sharding strategies.
//!
//! A sharder resolves the shard key extracted from a request to one of
//! the backends configured for an ACL. The set of strategies is closed:
//! each is a variant of `Sharder`, constructed from its raw JSON
//! `shard_config` by a `SharderFactory` registered under a fixed name.

mod backend;
mod hashring;
mod lookup;
mod modulo;
mod none;
mod prefix_lookup;
mod s2;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

pub use backend::{Backend, BackendDefaults, BackendDefinition, BackendError};
pub use hashring::HashRingStrategy;
pub use lookup::LookupStrategy;
pub use modulo::ModuloStrategy;
pub use none::NoStrategy;
pub use prefix_lookup::PrefixLookupStrategy;
pub use s2::S2Strategy;

/// Key under which prefix and geo strategies keep their fallback backend.
pub(crate) const DEFAULT_BACKEND_KEY: &str = "default";

/// Builds a `Sharder` from a raw `shard_config`.
pub type SharderFactory = fn(&Value, &BackendDefaults) -> Result<Sharder, ShardError>;

/// Errors from building or querying a sharder.
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error("{0}")]
    Config(#[from] serde_json::Error),

    #[error("failed to validate backend definition for {key}: {source}")]
    Backend {
        key: String,
        #[source]
        source: BackendError,
    },

    #[error("no backends specified")]
    NoBackends,

    #[error("No Shard Backends Specified Or Specified Incorrectly")]
    NoRingBackends,

    #[error("Invalid range key format: {0}")]
    InvalidRangeFormat(String),

    #[error("Invalid range key {start}-{end} for backends")]
    InvalidRange { start: usize, end: usize },

    #[error("Overlap seen in range key {0}")]
    Overlap(usize),

    #[error("Shard is out of bounds Max {max} found {found}")]
    OutOfBounds { max: i64, found: usize },

    #[error("Shard is missing coverage for {0}")]
    MissingCoverage(usize),

    #[error("missing required config: shard_key_separator")]
    MissingSeparator,

    #[error("invalid shard_key_position: {0}")]
    InvalidPosition(i64),

    #[error("Bad S2 ID found in backends: {0}")]
    BadCellId(String),

    #[error("Overlapping S2 IDs found in backends: {0:?}")]
    OverlappingCells(Vec<String>),

    #[error("not an integer key: {key}")]
    NotAnInteger {
        key: String,
        #[source]
        source: std::num::ParseIntError,
    },

    #[error("{0}")]
    InvalidLocation(&'static str),

    #[error("fail to find backend")]
    NoGeoBackend,
}

/// A constructed sharding strategy.
#[derive(Debug)]
pub enum Sharder {
    Lookup(LookupStrategy),
    PrefixLookup(PrefixLookupStrategy),
    Modulo(ModuloStrategy),
    HashRing(HashRingStrategy),
    S2(S2Strategy),
    None(NoStrategy),
}

impl Sharder {
    /// Resolves `key` to a backend.
    ///
    /// `Ok(None)` means the strategy has no backend for this key, which
    /// callers must keep apart from an actual failure.
    pub fn shard(&self, key: &str) -> Result<Option<Arc<Backend>>, ShardError> {
        match self {
            Sharder::Lookup(s) => Ok(s.shard(key)),
            Sharder::PrefixLookup(s) => Ok(s.shard(key)),
            Sharder::Modulo(s) => s.shard(key),
            Sharder::HashRing(s) => Ok(s.shard(key)),
            Sharder::S2(s) => s.shard(key),
            Sharder::None(s) => Ok(Some(s.shard(key))),
        }
    }
}

/// The strategies every proxy ships with, by configuration name.
pub fn builtin() -> Vec<(&'static str, SharderFactory)> {
    vec![
        ("lookup", new_lookup as SharderFactory),
        ("prefix-lookup", new_prefix_lookup as SharderFactory),
        ("modulo", new_modulo as SharderFactory),
        ("hashring", new_hashring as SharderFactory),
        ("s2", new_s2 as SharderFactory),
        ("none", new_none as SharderFactory),
    ]
}

fn new_lookup(cfg: &Value, defaults: &BackendDefaults) -> Result<Sharder, ShardError> {
    LookupStrategy::from_config(cfg, defaults).map(Sharder::Lookup)
}

fn new_prefix_lookup(cfg: &Value, defaults: &BackendDefaults) -> Result<Sharder, ShardError> {
    PrefixLookupStrategy::from_config(cfg, defaults).map(Sharder::PrefixLookup)
}

fn new_modulo(cfg: &Value, defaults: &BackendDefaults) -> Result<Sharder, ShardError> {
    ModuloStrategy::from_config(cfg, defaults).map(Sharder::Modulo)
}

fn new_hashring(cfg: &Value, defaults: &BackendDefaults) -> Result<Sharder, ShardError> {
    HashRingStrategy::from_config(cfg, defaults).map(Sharder::HashRing)
}

fn new_s2(cfg: &Value, defaults: &BackendDefaults) -> Result<Sharder, ShardError> {
    S2Strategy::from_config(cfg, defaults).map(Sharder::S2)
}

fn new_none(cfg: &Value, defaults: &BackendDefaults) -> Result<Sharder, ShardError> {
    NoStrategy::from_config(cfg, defaults).map(Sharder::None)
}

/// Validates every definition, then builds the backends keyed like the input.
pub(crate) fn to_backends(
    definitions: &HashMap<String, BackendDefinition>,
    defaults: &BackendDefaults,
) -> Result<HashMap<String, Arc<Backend>>, ShardError> {
    for (key, definition) in definitions {
        definition.validate().map_err(|source| ShardError::Backend {
            key: key.clone(),
            source,
        })?;
    }

    definitions
        .iter()
        .map(|(key, definition)| {
            Backend::from_definition(definition, defaults)
                .map(|backend| (key.clone(), Arc::new(backend)))
                .map_err(|source| ShardError::Backend {
                    key: key.clone(),
                    source,
                })
        })
        .collect()
}
