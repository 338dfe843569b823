//! etcd v3 implementation of `ConfigStore`.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, Event, EventType, GetOptions, SortOrder, SortTarget, WatchOptions,
};
use tokio::sync::mpsc;

use super::{ConfigStore, KeyValue, Listing, StoreError, StoreEvent, WatchEvents};

const WATCH_BUFFER: usize = 64;

/// `ConfigStore` backed by an etcd cluster.
///
/// The client multiplexes over a shared channel, so each call works on a
/// cheap clone of it.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(endpoints: &[String], dial_timeout: Duration) -> Result<Self, StoreError> {
        let options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        let client = Client::connect(endpoints, Some(options)).await?;
        tracing::info!(endpoints = ?endpoints, "connected to etcd");
        Ok(Self { client })
    }
}

#[async_trait]
impl ConfigStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<String, StoreError> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(kv.value_str()?.to_string()),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.put(key, value, None).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut client = self.client.clone();
        let resp = client.delete(key, None).await?;
        Ok(resp.deleted() > 0)
    }

    async fn list(&self, prefix: &str) -> Result<Listing, StoreError> {
        let mut client = self.client.clone();
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Ascend);
        let resp = client.get(prefix, Some(options)).await?;

        let entries = resp
            .kvs()
            .iter()
            .map(|kv| {
                Ok(KeyValue {
                    key: kv.key_str()?.to_string(),
                    value: kv.value_str()?.to_string(),
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(Listing {
            revision: resp.header().map(|h| h.revision()).unwrap_or_default(),
            entries,
        })
    }

    async fn watch(
        &self,
        prefix: &str,
        from_revision: Option<i64>,
    ) -> Result<WatchEvents, StoreError> {
        let mut client = self.client.clone();
        let mut options = WatchOptions::new().with_prefix().with_prev_key();
        if let Some(revision) = from_revision {
            options = options.with_start_revision(revision);
        }
        let (watcher, mut stream) = client.watch(prefix, Some(options)).await?;

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            // Dropping the watcher cancels the watch on the server.
            let _watcher = watcher;
            loop {
                let message = tokio::select! {
                    _ = tx.closed() => return,
                    message = stream.message() => message,
                };

                let resp = match message {
                    Ok(Some(resp)) => resp,
                    Ok(None) => {
                        tracing::info!(prefix = %prefix, "etcd watch stream closed");
                        return;
                    }
                    Err(e) => {
                        tracing::error!(prefix = %prefix, error = %e, "etcd watch failed");
                        return;
                    }
                };

                if resp.canceled() {
                    tracing::warn!(
                        prefix = %prefix,
                        reason = resp.cancel_reason(),
                        compact_revision = resp.compact_revision(),
                        "etcd watch canceled"
                    );
                    return;
                }

                for event in resp.events() {
                    match to_store_event(event) {
                        Ok(Some(event)) => {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(prefix = %prefix, error = %e, "skipping undecodable etcd event")
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

fn to_store_event(event: &Event) -> Result<Option<StoreEvent>, StoreError> {
    let Some(kv) = event.kv() else {
        return Ok(None);
    };
    let key = kv.key_str()?.to_string();
    let prev_value = event
        .prev_kv()
        .map(|prev| prev.value_str().map(str::to_string))
        .transpose()?;

    let event = match event.event_type() {
        EventType::Put => StoreEvent::Put {
            key,
            value: kv.value_str()?.to_string(),
            prev_value,
        },
        EventType::Delete => StoreEvent::Delete { key, prev_value },
    };
    Ok(Some(event))
}
