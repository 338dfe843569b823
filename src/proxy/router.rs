//! Criterion-based routing table.
//!
//! Maps incoming requests to ACLs. The table is keyed by criterion
//! string, so at most one ACL occupies a criterion and an upsert
//! replaces it in place.

use std::sync::Arc;

use dashmap::DashMap;

use super::acl::Acl;
use super::criterion::{Criterion, CriterionError};
use super::request::RequestView;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("route not found: {0}")]
    NotFound(String),

    #[error("failed to parse criterion {criterion}: {source}")]
    Criterion {
        criterion: String,
        #[source]
        source: CriterionError,
    },
}

#[derive(Debug)]
struct Route {
    criterion: Criterion,
    acl: Arc<Acl>,
}

/// Routes requests to ACLs.
///
/// Thread-safe: readers and the route-sync writer share the table
/// through a sharded concurrent map, and each entry is swapped whole.
/// When several criteria match, the most specific one wins (see
/// `Criterion::score`); equal scores go to the smallest criterion string.
#[derive(Debug, Default)]
pub struct Router {
    routes: DashMap<String, Arc<Route>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles `criterion` and points it at `acl`, replacing any previous entry.
    pub fn upsert_route(&self, criterion: &str, acl: Arc<Acl>) -> Result<(), RouterError> {
        let compiled = Criterion::parse(criterion).map_err(|source| RouterError::Criterion {
            criterion: criterion.to_string(),
            source,
        })?;

        self.routes.insert(
            criterion.to_string(),
            Arc::new(Route {
                criterion: compiled,
                acl,
            }),
        );
        Ok(())
    }

    /// Upserts `acl` under its own criterion.
    pub fn upsert_acl(&self, acl: Acl) -> Result<(), RouterError> {
        let criterion = acl.criterion.clone();
        self.upsert_route(&criterion, Arc::new(acl))
    }

    /// Removes the entry for `criterion`, returning the ACL it held.
    pub fn remove_route(&self, criterion: &str) -> Option<Arc<Acl>> {
        self.routes
            .remove(criterion)
            .map(|(_, route)| Arc::clone(&route.acl))
    }

    /// Finds the ACL for `req`.
    pub fn route(&self, req: &RequestView<'_>) -> Result<Arc<Acl>, RouterError> {
        let mut best: Option<(u32, Arc<Route>)> = None;

        for entry in self.routes.iter() {
            let route = entry.value();
            let Some(score) = route.criterion.score(req) else {
                continue;
            };

            let is_better = match &best {
                None => true,
                Some((best_score, best_route)) => {
                    score > *best_score
                        || (score == *best_score
                            && route.criterion.as_str() < best_route.criterion.as_str())
                }
            };

            if is_better {
                best = Some((score, Arc::clone(route)));
            }
        }

        best.map(|(_, route)| Arc::clone(&route.acl))
            .ok_or_else(|| RouterError::NotFound(req.uri.to_string()))
    }

    /// `(id, criterion)` of every route, ordered by criterion.
    pub fn routes(&self) -> Vec<(String, String)> {
        let mut routes: Vec<(String, String)> = self
            .routes
            .iter()
            .map(|entry| (entry.value().acl.id.clone(), entry.key().clone()))
            .collect();
        routes.sort_by(|a, b| a.1.cmp(&b.1));
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
