//! In-memory `ConfigStore` for tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ConfigStore, KeyValue, Listing, StoreError, StoreEvent, WatchEvents};

#[derive(Default)]
struct State {
    data: BTreeMap<String, String>,
    revision: i64,
    /// Every put and delete, tagged with the revision it created.
    history: Vec<(i64, StoreEvent)>,
}

/// Store revisions start at 1 for the first write, like etcd's.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    watchers: Mutex<Vec<(String, mpsc::Sender<StoreEvent>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes `key` without notifying watchers or recording history.
    pub fn seed(&self, key: &str, value: &str) {
        let mut state = self.state.lock().unwrap();
        state.revision += 1;
        state.data.insert(key.to_string(), value.to_string());
    }

    /// Ends every open watch.
    pub fn close_watches(&self) {
        self.watchers.lock().unwrap().clear();
    }

    /// Records `event` and hands it to matching watchers. Called with the
    /// state lock held so a watch starting concurrently sees it once.
    fn publish(&self, state: &mut State, event: StoreEvent) {
        state.revision += 1;
        state.history.push((state.revision, event.clone()));

        let mut watchers = self.watchers.lock().unwrap();
        watchers.retain(|(prefix, tx)| {
            if !event.key().starts_with(prefix.as_str()) {
                return !tx.is_closed();
            }
            tx.try_send(event.clone()).is_ok()
        });
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<String, StoreError> {
        self.state
            .lock()
            .unwrap()
            .data
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let prev_value = state.data.insert(key.to_string(), value.to_string());
        let event = StoreEvent::Put {
            key: key.to_string(),
            value: value.to_string(),
            prev_value,
        };
        self.publish(&mut state, event);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        let Some(prev) = state.data.remove(key) else {
            return Ok(false);
        };
        let event = StoreEvent::Delete {
            key: key.to_string(),
            prev_value: Some(prev),
        };
        self.publish(&mut state, event);
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Listing, StoreError> {
        let state = self.state.lock().unwrap();
        let entries = state
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| KeyValue {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();

        Ok(Listing {
            revision: state.revision,
            entries,
        })
    }

    async fn watch(
        &self,
        prefix: &str,
        from_revision: Option<i64>,
    ) -> Result<WatchEvents, StoreError> {
        let (tx, rx) = mpsc::channel(64);
        let state = self.state.lock().unwrap();

        if let Some(from) = from_revision {
            let missed = state
                .history
                .iter()
                .filter(|(revision, event)| *revision >= from && event.key().starts_with(prefix));
            for (_, event) in missed {
                let _ = tx.try_send(event.clone());
            }
        }

        self.watchers.lock().unwrap().push((prefix.to_string(), tx));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_revision_follows_writes() {
        let store = MemoryStore::new();
        assert_eq!(store.list("/").await.unwrap().revision, 0);

        store.put("/a", "1").await.unwrap();
        store.put("/a", "2").await.unwrap();
        assert!(!store.delete("/missing").await.unwrap());
        assert_eq!(store.list("/").await.unwrap().revision, 2);
    }

    #[tokio::test]
    async fn test_put_carries_previous_value() {
        let store = MemoryStore::new();
        let mut events = store.watch("/", None).await.unwrap();

        store.put("/a", "1").await.unwrap();
        store.put("/a", "2").await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            StoreEvent::Put {
                key: "/a".to_string(),
                value: "1".to_string(),
                prev_value: None
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            StoreEvent::Put {
                key: "/a".to_string(),
                value: "2".to_string(),
                prev_value: Some("1".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_watch_replays_from_revision() {
        let store = MemoryStore::new();
        store.put("/a", "1").await.unwrap();
        let revision = store.list("/").await.unwrap().revision;
        store.put("/b", "2").await.unwrap();
        store.put("/other", "x").await.unwrap();

        let mut events = store.watch("/b", Some(revision + 1)).await.unwrap();
        assert_eq!(events.recv().await.unwrap().key(), "/b");

        store.delete("/b").await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            StoreEvent::Delete { prev_value: Some(v), .. } if v == "2"
        ));
    }
}
