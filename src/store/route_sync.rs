//! Background service keeping the router in step with the store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pingora_core::server::ShutdownWatch;
use pingora_core::services::background::BackgroundService;

use super::RouteLoader;
use crate::proxy::{AclConfig, Router, RouterError};

/// Bootstraps the router once, marks the process ready, then applies
/// store changes until the server shuts down.
pub struct RouteSyncService {
    loader: RouteLoader,
    router: Arc<Router>,
    ready: Arc<AtomicBool>,
}

impl RouteSyncService {
    pub fn new(loader: RouteLoader, router: Arc<Router>, ready: Arc<AtomicBool>) -> Self {
        Self {
            loader,
            router,
            ready,
        }
    }

    /// Loads the namespace and returns the revision to watch from.
    async fn bootstrap(&self) -> Option<i64> {
        let from_revision = match self
            .loader
            .bootstrap_routes(|acl| self.router.upsert_acl(acl))
            .await
        {
            Ok(bootstrapped) => {
                tracing::info!(
                    applied = bootstrapped.applied,
                    revision = bootstrapped.revision,
                    "router bootstrap complete"
                );
                Some(bootstrapped.revision + 1)
            }
            Err(e) => {
                tracing::error!(error = %e, "router bootstrap failed, serving with an empty table");
                None
            }
        };
        self.ready.store(true, Ordering::SeqCst);
        from_revision
    }

    async fn sync(&self, shutdown: ShutdownWatch) {
        let from_revision = self.bootstrap().await;
        self.loader
            .watch_routes(
                shutdown,
                from_revision,
                |acl| self.router.upsert_acl(acl),
                |config: &AclConfig| {
                    if self.router.remove_route(&config.criterion).is_none() {
                        tracing::debug!(acl = %config, "deleted ACL had no route");
                    }
                    Ok::<(), RouterError>(())
                },
            )
            .await;
    }
}

#[async_trait]
impl BackgroundService for RouteSyncService {
    async fn start(&self, shutdown: ShutdownWatch) {
        self.sync(shutdown).await;
    }
}
