//! ACL storage and hot reload.
//!
//! ACLs live in a key-value store as JSON, one key per ACL. The
//! `RouteLoader` reads and writes them, and the `RouteSyncService` keeps
//! the router in step with the store for the life of the process.

mod etcd;
#[cfg(test)]
pub(crate) mod memory;
mod route_loader;
mod route_sync;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use etcd::EtcdStore;
pub use route_loader::{AclKey, Bootstrapped, LoaderError, RouteLoader};
pub use route_sync::RouteSyncService;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("etcd request failed: {0}")]
    Etcd(#[from] etcd_client::Error),
}

/// A stored key and its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Entries under a prefix and the store revision they were read at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub revision: i64,
    pub entries: Vec<KeyValue>,
}

/// A change observed under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// The key was created or updated. `prev_value` is set on updates.
    Put {
        key: String,
        value: String,
        prev_value: Option<String>,
    },
    /// The key was removed. `prev_value` is what it held before.
    Delete {
        key: String,
        prev_value: Option<String>,
    },
}

impl StoreEvent {
    pub fn key(&self) -> &str {
        match self {
            StoreEvent::Put { key, .. } | StoreEvent::Delete { key, .. } => key,
        }
    }
}

/// Events from a prefix watch. The channel closes when the watch ends.
pub type WatchEvents = mpsc::Receiver<StoreEvent>;

/// Key-value store holding the ACLs.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<String, StoreError>;

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Removes `key`, returning whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Every entry under `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Listing, StoreError>;

    /// Starts watching every key under `prefix`. With `from_revision`,
    /// changes made at or after that revision are delivered first.
    async fn watch(&self, prefix: &str, from_revision: Option<i64>)
        -> Result<WatchEvents, StoreError>;
}
