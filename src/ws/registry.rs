use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::db::DocumentStore;

use super::hub::{spawn_hub, HubConfig, HubHandle};

/// All live document hubs of this process.
pub struct HubRegistry {
    hubs: Mutex<Hubs>,
    store: Arc<dyn DocumentStore>,
    config: HubConfig,
}

#[derive(Default)]
struct Hubs {
    live: HashMap<String, HubHandle>,
    /// Evicted hubs still flushing their last snapshot.
    closing: HashMap<String, HubHandle>,
}

impl HubRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, config: HubConfig) -> Arc<Self> {
        Arc::new(Self {
            hubs: Mutex::new(Hubs::default()),
            store,
            config,
        })
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Hub for `doc_id`, started if needed, with one more client attached.
    ///
    /// Attaching under the registry lock keeps the idle sweeper from evicting
    /// a hub a client is about to join. If the previous hub of this document
    /// is still saving, the new one starts only after it stopped, so it loads
    /// what the old one wrote.
    pub async fn get_or_create(&self, doc_id: &str) -> HubHandle {
        loop {
            let stopping = {
                let mut hubs = self.hubs.lock().await;
                if let Some(hub) = hubs.live.get(doc_id).filter(|h| !h.is_closed()) {
                    hub.attach();
                    return hub.clone();
                }
                match hubs.closing.get(doc_id).filter(|h| !h.is_closed()) {
                    Some(old) => old.clone(),
                    None => {
                        hubs.closing.remove(doc_id);
                        info!("Starting hub for document {}", doc_id);
                        let hub = spawn_hub(doc_id, self.store.clone(), self.config.clone());
                        hub.attach();
                        hubs.live.insert(doc_id.to_string(), hub.clone());
                        return hub;
                    }
                }
            };
            debug!("Waiting for the previous hub of document {} to stop", doc_id);
            stopping.stopped().await;
        }
    }

    pub async fn get(&self, doc_id: &str) -> Option<HubHandle> {
        self.hubs.lock().await.live.get(doc_id).cloned()
    }

    pub async fn handles(&self) -> Vec<HubHandle> {
        self.hubs.lock().await.live.values().cloned().collect()
    }

    /// Shut down hubs that have had no attached clients for at least `timeout`.
    ///
    /// `idle_since` remembers when each hub was first seen idle between sweeps.
    /// Returns the evicted document ids.
    pub async fn evict_idle(&self, idle_since: &mut HashMap<String, Instant>, timeout: Duration) -> Vec<String> {
        let mut evicted = Vec::new();
        {
            let mut hubs = self.hubs.lock().await;
            let now = Instant::now();

            idle_since.retain(|doc_id, _| hubs.live.get(doc_id).is_some_and(|h| h.attached_clients() == 0));
            let mut expired = Vec::new();
            for (doc_id, hub) in hubs.live.iter() {
                if hub.attached_clients() > 0 {
                    continue;
                }
                let since = *idle_since.entry(doc_id.clone()).or_insert(now);
                if now.duration_since(since) >= timeout {
                    expired.push(doc_id.clone());
                }
            }

            for doc_id in expired {
                idle_since.remove(&doc_id);
                if let Some(hub) = hubs.live.remove(&doc_id) {
                    hubs.closing.insert(doc_id.clone(), hub.clone());
                    evicted.push((doc_id, hub));
                }
            }
        }

        // saving may be slow; other documents must not wait for it
        for (doc_id, hub) in &evicted {
            info!("Evicting idle hub for document {}", doc_id);
            hub.shutdown().await;
        }

        let mut hubs = self.hubs.lock().await;
        hubs.closing.retain(|_, h| !h.is_closed());
        evicted.into_iter().map(|(doc_id, _)| doc_id).collect()
    }

    /// Sweep for idle hubs every `timeout / 4`, at least once a second.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, timeout: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let period = (timeout / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut idle_since = HashMap::new();
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else { break };
                registry.evict_idle(&mut idle_since, timeout).await;
            }
        })
    }

    /// Stop every hub, saving pending snapshots.
    pub async fn shutdown_all(&self) {
        let (live, closing): (Vec<_>, Vec<_>) = {
            let mut hubs = self.hubs.lock().await;
            (hubs.live.drain().collect(), hubs.closing.drain().map(|(_, h)| h).collect())
        };
        for (doc_id, hub) in live {
            info!("Stopping hub for document {}", doc_id);
            hub.shutdown().await;
        }
        for hub in closing {
            hub.stopped().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, StoreError, StoreEvent};
    use crate::models::{decode_client_message, DocumentState};
    use async_trait::async_trait;
    use tokio::sync::broadcast;

    /// Memory store whose saves take `delay`.
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
    }

    #[async_trait]
    impl DocumentStore for SlowStore {
        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn save_document(&self, doc_id: &str, state: &mut DocumentState) -> Result<(), StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.save_document(doc_id, state).await
        }

        async fn load_document(&self, doc_id: &str) -> Result<DocumentState, StoreError> {
            self.inner.load_document(doc_id).await
        }

        async fn delete_document(&self, doc_id: &str) -> Result<(), StoreError> {
            self.inner.delete_document(doc_id).await
        }

        async fn subscribe(&self, doc_id: &str) -> Result<broadcast::Receiver<StoreEvent>, StoreError> {
            self.inner.subscribe(doc_id).await
        }
    }

    async fn slow_registry() -> Arc<HubRegistry> {
        let store = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(600),
        });
        let registry = HubRegistry::new(store, HubConfig::default());

        // leave an unsaved change behind in an idle hub
        let hub = registry.get_or_create("idle").await;
        let conn = uuid::Uuid::new_v4();
        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        hub.register(conn, tx);
        let language = decode_client_message(r#"{"type":"setLanguage","language":"go"}"#).unwrap();
        hub.dispatch(conn, language);
        hub.unregister(conn);
        hub.snapshot().await.unwrap();
        registry
    }

    #[tokio::test]
    async fn same_document_shares_one_hub() {
        let registry = HubRegistry::new(Arc::new(MemoryStore::new()), HubConfig::default());
        let a = registry.get_or_create("doc").await;
        let b = registry.get_or_create("doc").await;
        let other = registry.get_or_create("other").await;

        assert_eq!(a.attached_clients(), 2);
        assert_eq!(b.attached_clients(), 2);
        assert_eq!(other.attached_clients(), 1);
        assert_eq!(registry.handles().await.len(), 2);
        registry.shutdown_all().await;
        assert!(registry.get("doc").await.is_none());
    }

    #[tokio::test]
    async fn idle_hubs_are_evicted_after_timeout() {
        let registry = HubRegistry::new(Arc::new(MemoryStore::new()), HubConfig::default());
        let busy = registry.get_or_create("busy").await;
        let idle = registry.get_or_create("idle").await;
        idle.unregister(uuid::Uuid::new_v4());

        let mut idle_since = HashMap::new();
        let timeout = Duration::from_millis(30);
        assert!(registry.evict_idle(&mut idle_since, timeout).await.is_empty());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.evict_idle(&mut idle_since, timeout).await, vec!["idle".to_string()]);

        assert!(registry.get("idle").await.is_none());
        assert!(idle.is_closed());
        assert_eq!(busy.attached_clients(), 1);
        assert!(registry.get("busy").await.is_some());
    }

    #[tokio::test]
    async fn slow_eviction_does_not_block_other_documents() {
        let registry = slow_registry().await;
        let sweeper = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let mut idle_since = HashMap::new();
                registry.evict_idle(&mut idle_since, Duration::ZERO).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let other = registry.get_or_create("unrelated").await;
        assert!(started.elapsed() < Duration::from_millis(300), "blocked for {:?}", started.elapsed());
        assert!(registry.get("unrelated").await.is_some());
        assert!(other.snapshot().await.is_some());

        assert_eq!(sweeper.await.unwrap(), vec!["idle".to_string()]);
    }

    #[tokio::test]
    async fn reopening_a_closing_document_waits_for_its_save() {
        let registry = slow_registry().await;
        let sweeper = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let mut idle_since = HashMap::new();
                registry.evict_idle(&mut idle_since, Duration::ZERO).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reopened = registry.get_or_create("idle").await;
        let snapshot = reopened.snapshot().await.unwrap();
        assert_eq!(snapshot.state.language, "go");
        assert_eq!(snapshot.state.version, 1);
        sweeper.await.unwrap();
    }
}
