use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use super::{next_last_modified, DocumentStore, StoreError, StoreEvent, DOCUMENT_TTL, SUBSCRIPTION_CAPACITY};
use crate::models::DocumentState;

struct StoredSnapshot {
    data: String,
    version: i64,
    last_modified: i64,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    docs: HashMap<String, StoredSnapshot>,
    channels: HashMap<String, broadcast::Sender<StoreEvent>>,
}

impl Inner {
    fn publish(&mut self, doc_id: &str, event: StoreEvent) {
        if let Some(tx) = self.channels.get(doc_id) {
            if tx.send(event).is_err() {
                // nobody listening anymore
                self.channels.remove(doc_id);
            }
        }
    }

    fn live(&mut self, doc_id: &str) -> Option<&StoredSnapshot> {
        let expired = self
            .docs
            .get(doc_id)
            .is_some_and(|s| s.expires_at <= Instant::now());
        if expired {
            debug!("Snapshot for document {} expired", doc_id);
            self.docs.remove(doc_id);
        }
        self.docs.get(doc_id)
    }
}

/// In-process store with the same semantics as [`super::PgStore`].
///
/// Replicas sharing one `Arc<MemoryStore>` see each other's updates, which is
/// what the tests and single-process development runs rely on.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    ttl: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_ttl(DOCUMENT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ttl,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // state stays consistent even if a holder panicked mid-test
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn save_document(&self, doc_id: &str, state: &mut DocumentState) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let (current_version, previous_modified) = inner
            .live(doc_id)
            .map(|s| (s.version, s.last_modified))
            .unwrap_or((0, 0));

        state.version = current_version + 1;
        state.last_modified = next_last_modified(previous_modified.max(state.last_modified));
        let data = serde_json::to_string(state)?;

        inner.docs.insert(
            doc_id.to_string(),
            StoredSnapshot {
                data,
                version: state.version,
                last_modified: state.last_modified,
                expires_at: Instant::now() + self.ttl,
            },
        );
        inner.publish(doc_id, StoreEvent::Updated(state.clone()));
        Ok(())
    }

    async fn load_document(&self, doc_id: &str) -> Result<DocumentState, StoreError> {
        let mut inner = self.lock();
        match inner.live(doc_id) {
            Some(snapshot) => Ok(serde_json::from_str(&snapshot.data)?),
            None => Ok(DocumentState::default()),
        }
    }

    async fn delete_document(&self, doc_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.docs.remove(doc_id);
        inner.publish(doc_id, StoreEvent::Deleted);
        Ok(())
    }

    async fn subscribe(&self, doc_id: &str) -> Result<broadcast::Receiver<StoreEvent>, StoreError> {
        let mut inner = self.lock();
        let tx = inner
            .channels
            .entry(doc_id.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIPTION_CAPACITY).0);
        Ok(tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tab;

    fn state_with(content: &str) -> DocumentState {
        DocumentState {
            tabs: vec![Tab {
                id: "1".into(),
                name: "Main".into(),
                content: content.into(),
                notes: "# notes".into(),
            }],
            active_tab_id: "1".into(),
            language: "rust".into(),
            origin: Some("replica-a".into()),
            ..DocumentState::default()
        }
    }

    #[tokio::test]
    async fn save_then_load_bumps_version_by_one() {
        let store = MemoryStore::new();
        let mut state = state_with("fn main() {}");
        store.save_document("doc", &mut state).await.unwrap();
        let first = store.load_document("doc").await.unwrap();
        assert_eq!(first.version, 1);

        let mut next = state_with("fn main() { println!(); }");
        store.save_document("doc", &mut next).await.unwrap();
        let second = store.load_document("doc").await.unwrap();

        assert_eq!(second.version, first.version + 1);
        assert!(second.last_modified > first.last_modified);
        assert_eq!(second.tabs, next.tabs);
        assert_eq!(second.language, "rust");
        assert_eq!(second.active_tab_id, "1");
    }

    #[tokio::test]
    async fn missing_document_loads_blank() {
        let store = MemoryStore::new();
        let state = store.load_document("nope").await.unwrap();
        assert!(state.is_blank());
        assert_eq!(state.language, "plaintext");
    }

    #[tokio::test]
    async fn subscribers_see_saves_and_deletes() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe("doc").await.unwrap();
        let mut other = store.subscribe("other").await.unwrap();

        let mut state = state_with("hello");
        store.save_document("doc", &mut state).await.unwrap();
        match rx.recv().await.unwrap() {
            StoreEvent::Updated(s) => {
                assert_eq!(s.version, 1);
                assert_eq!(s.origin.as_deref(), Some("replica-a"));
                assert_eq!(s.tabs[0].content, "hello");
            }
            StoreEvent::Deleted => panic!("expected update"),
        }

        store.delete_document("doc").await.unwrap();
        assert!(matches!(rx.recv().await.unwrap(), StoreEvent::Deleted));
        assert!(store.load_document("doc").await.unwrap().is_blank());
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn expired_snapshots_are_gone() {
        let store = MemoryStore::with_ttl(Duration::from_millis(20));
        let mut state = state_with("short lived");
        store.save_document("doc", &mut state).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(store.load_document("doc").await.unwrap().is_blank());
        let mut again = state_with("again");
        store.save_document("doc", &mut again).await.unwrap();
        assert_eq!(again.version, 1);
    }
}
