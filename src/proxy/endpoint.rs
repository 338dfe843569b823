//! Endpoints bind a matcher and a sharder for one ACL.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::matcher::{BoundMatcher, MatchError};
use super::request::RequestView;
use crate::registry::Registry;
use crate::shard::{Backend, ShardError, Sharder};

/// Declarative endpoint, as stored with the ACL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub matcher: String,
    pub shard_expr: String,
    pub shard_func: String,
    #[serde(default)]
    pub shard_config: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("failed to find ShardFunc for: {0}")]
    SharderNotFound(String),

    #[error("failed to get sharder for {expr}: {source}")]
    Sharder {
        expr: String,
        #[source]
        source: ShardError,
    },

    #[error("failed to generate shard key func for {expr}: {source}")]
    Matcher {
        expr: String,
        #[source]
        source: MatchError,
    },

    #[error("failed to find shard key: {0}")]
    ShardKey(#[source] MatchError),

    #[error(transparent)]
    Shard(#[from] ShardError),
}

/// A built endpoint. Immutable and shared by every request routed to its ACL.
#[derive(Debug)]
pub struct Endpoint {
    matcher: BoundMatcher,
    sharder: Sharder,
}

impl Endpoint {
    /// Resolves the named strategies in `registry` and builds them.
    ///
    /// The sharder is resolved and constructed before the matcher, so a
    /// config with both names wrong reports the sharder.
    pub fn new(config: &EndpointConfig, registry: &Registry) -> Result<Self, EndpointError> {
        let factory = registry
            .sharder(&config.shard_func)
            .ok_or_else(|| EndpointError::SharderNotFound(config.shard_func.clone()))?;

        let sharder = factory(&config.shard_config, registry.backend_defaults()).map_err(
            |source| EndpointError::Sharder {
                expr: config.shard_expr.clone(),
                source,
            },
        )?;

        let matcher = registry
            .matcher(&config.matcher)
            .ok_or_else(|| MatchError::NotFound(config.matcher.clone()))
            .and_then(|kind| kind.bind(&config.shard_expr))
            .map_err(|source| EndpointError::Matcher {
                expr: config.shard_expr.clone(),
                source,
            })?;

        Ok(Self { matcher, sharder })
    }

    /// Picks the backend for `req`.
    ///
    /// `Ok(None)` means the shard key was extracted but no backend owns it.
    pub fn shard(&self, req: &RequestView<'_>) -> Result<Option<Arc<Backend>>, EndpointError> {
        let key = self
            .matcher
            .shard_key(req)
            .map_err(EndpointError::ShardKey)?;
        Ok(self.sharder.shard(&key)?)
    }

    /// Whether `shard` needs the request body buffered into the view.
    pub fn reads_body(&self) -> bool {
        self.matcher.reads_body()
    }
}
