//! Loads ACLs from the config store and keeps a consumer in sync with it.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use super::{ConfigStore, StoreError, StoreEvent};
use crate::proxy::{Acl, AclConfig, EndpointError};
use crate::registry::Registry;

/// Store key of one ACL: `/<namespace>/acls/<id>/acl`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AclKey(String);

impl AclKey {
    pub fn new(namespace: &str, id: &str) -> Self {
        Self(format!("/{}/acls/{}/acl", namespace, id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for AclKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl fmt::Display for AclKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("store request failed for {key}: {source}")]
    Store {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to decode ACL at {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode {acl}: {source}")]
    Encode {
        acl: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to create a new Endpoint for key: {key}: {source}")]
    Endpoint {
        key: String,
        #[source]
        source: EndpointError,
    },
}

/// Outcome of loading the namespace into a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bootstrapped {
    /// ACLs handed to the consumer without error.
    pub applied: usize,
    /// Store revision the namespace was read at.
    pub revision: i64,
}

/// Reads and writes ACLs under one namespace of a `ConfigStore`.
///
/// Every load rebuilds the ACL's endpoint from its stored config, so the
/// bootstrap and watch paths validate entries the same way.
#[derive(Clone)]
pub struct RouteLoader {
    store: Arc<dyn ConfigStore>,
    registry: Arc<Registry>,
    namespace: String,
}

impl RouteLoader {
    pub fn new(store: Arc<dyn ConfigStore>, registry: Arc<Registry>, namespace: &str) -> Self {
        Self {
            store,
            registry,
            namespace: namespace.to_string(),
        }
    }

    /// Prefix holding every ACL of the namespace.
    pub fn acls_prefix(&self) -> String {
        format!("/{}/acls/", self.namespace)
    }

    pub fn key_for(&self, id: &str) -> AclKey {
        AclKey::new(&self.namespace, id)
    }

    fn is_acl_key(&self, key: &str) -> bool {
        key.starts_with(&self.acls_prefix()) && key.ends_with("/acl")
    }

    fn decode(&self, key: &str, value: &str) -> Result<Acl, LoaderError> {
        let config = AclConfig::from_json(value).map_err(|source| LoaderError::Decode {
            key: key.to_string(),
            source,
        })?;
        Acl::load(config, &self.registry).map_err(|source| LoaderError::Endpoint {
            key: key.to_string(),
            source,
        })
    }

    /// Every ACL in the namespace, ordered by key. Fails on the first
    /// entry that does not load.
    pub async fn list_all(&self) -> Result<Vec<Acl>, LoaderError> {
        let prefix = self.acls_prefix();
        let listing = self
            .store
            .list(&prefix)
            .await
            .map_err(|source| LoaderError::Store { key: prefix, source })?;

        listing
            .entries
            .iter()
            .filter(|kv| self.is_acl_key(&kv.key))
            .map(|kv| self.decode(&kv.key, &kv.value))
            .collect()
    }

    /// Validates and stores `config`, returning the key it was written to.
    pub async fn put_acl(&self, config: &AclConfig) -> Result<AclKey, LoaderError> {
        let key = self.key_for(&config.id);

        Acl::load(config.clone(), &self.registry).map_err(|source| LoaderError::Endpoint {
            key: key.to_string(),
            source,
        })?;
        let value = config.to_json().map_err(|source| LoaderError::Encode {
            acl: config.to_string(),
            source,
        })?;

        self.store
            .put(key.as_str(), &value)
            .await
            .map_err(|source| LoaderError::Store {
                key: key.to_string(),
                source,
            })?;
        Ok(key)
    }

    pub async fn get_acl(&self, key: &AclKey) -> Result<Acl, LoaderError> {
        let value = self
            .store
            .get(key.as_str())
            .await
            .map_err(|source| LoaderError::Store {
                key: key.to_string(),
                source,
            })?;
        self.decode(key.as_str(), &value)
    }

    /// Removes the ACL at `key`, returning whether it existed.
    pub async fn del_acl(&self, key: &AclKey) -> Result<bool, LoaderError> {
        self.store
            .delete(key.as_str())
            .await
            .map_err(|source| LoaderError::Store {
                key: key.to_string(),
                source,
            })
    }

    /// Hands every loadable ACL in the namespace to `upsert`.
    ///
    /// Entries that fail to load or upsert are logged and skipped. An
    /// empty namespace is not an error.
    pub async fn bootstrap_routes<F, E>(&self, mut upsert: F) -> Result<Bootstrapped, LoaderError>
    where
        F: FnMut(Acl) -> Result<(), E>,
        E: fmt::Display,
    {
        let prefix = self.acls_prefix();
        tracing::info!(prefix = %prefix, "bootstrapping router from store");

        let listing = self
            .store
            .list(&prefix)
            .await
            .map_err(|source| LoaderError::Store {
                key: prefix.clone(),
                source,
            })?;
        if listing.entries.is_empty() {
            tracing::info!(prefix = %prefix, "namespace is empty, starting with no routes");
        }

        let mut applied = 0;
        for kv in listing.entries.iter().filter(|kv| self.is_acl_key(&kv.key)) {
            let acl = match self.decode(&kv.key, &kv.value) {
                Ok(acl) => acl,
                Err(e) => {
                    tracing::error!(key = %kv.key, error = %e, "skipping ACL");
                    continue;
                }
            };

            let label = acl.to_string();
            match upsert(acl) {
                Ok(()) => {
                    tracing::info!(acl = %label, "upserted route");
                    applied += 1;
                }
                Err(e) => tracing::error!(acl = %label, error = %e, "failed to upsert route"),
            }
        }

        Ok(Bootstrapped {
            applied,
            revision: listing.revision,
        })
    }

    /// Applies store changes to the consumer until `shutdown` flips to
    /// true or the watch ends.
    ///
    /// Changes from `from_revision` on are replayed first. Puts are loaded
    /// and passed to `upsert`; deletes pass the previous config to
    /// `delete`. An update that changes the criterion also deletes the
    /// route under the old one. A bad event is logged and skipped.
    pub async fn watch_routes<U, D, E>(
        &self,
        mut shutdown: watch::Receiver<bool>,
        from_revision: Option<i64>,
        mut upsert: U,
        mut delete: D,
    ) where
        U: FnMut(Acl) -> Result<(), E>,
        D: FnMut(&AclConfig) -> Result<(), E>,
        E: fmt::Display,
    {
        let prefix = self.acls_prefix();
        let mut events = match self.store.watch(&prefix, from_revision).await {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(prefix = %prefix, error = %e, "failed to start watch");
                return;
            }
        };
        tracing::info!(prefix = %prefix, from_revision = ?from_revision, "watching store for route changes");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let event = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                event = events.recv() => event,
            };

            let Some(event) = event else {
                tracing::info!(prefix = %prefix, "watch ended");
                return;
            };
            if !self.is_acl_key(event.key()) {
                tracing::debug!(key = event.key(), "ignoring non-ACL key");
                continue;
            }

            match event {
                StoreEvent::Put {
                    key,
                    value,
                    prev_value,
                } => {
                    let acl = match self.decode(&key, &value) {
                        Ok(acl) => acl,
                        Err(e) => {
                            tracing::error!(key = %key, error = %e, "error in fetching ACL");
                            continue;
                        }
                    };

                    let replaced = prev_value
                        .as_deref()
                        .and_then(|prev| AclConfig::from_json(prev).ok())
                        .filter(|prev| prev.criterion != acl.criterion);
                    if let Some(prev) = replaced {
                        match delete(&prev) {
                            Ok(()) => tracing::info!(acl = %prev, "deleted route of previous criterion"),
                            Err(e) => tracing::error!(acl = %prev, error = %e, "failed to delete route"),
                        }
                    }

                    let label = acl.to_string();
                    match upsert(acl) {
                        Ok(()) => tracing::info!(acl = %label, "upserted route"),
                        Err(e) => tracing::error!(acl = %label, error = %e, "failed to upsert route"),
                    }
                }
                StoreEvent::Delete { key, prev_value } => {
                    let Some(prev) = prev_value else {
                        tracing::warn!(key = %key, "delete event without previous value");
                        continue;
                    };
                    let config = match AclConfig::from_json(&prev) {
                        Ok(config) => config,
                        Err(e) => {
                            tracing::error!(key = %key, error = %e, "error in unmarshalling deleted ACL");
                            continue;
                        }
                    };
                    match delete(&config) {
                        Ok(()) => tracing::info!(acl = %config, "deleted route"),
                        Err(e) => tracing::error!(acl = %config, error = %e, "failed to delete route"),
                    }
                }
            }
        }

        tracing::info!(prefix = %prefix, "stopping store watch on shutdown");
    }
}
