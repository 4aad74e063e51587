use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::db::DocumentStore;
use crate::models::DocumentState;

use super::hub::HubCommand;

/// How often and how patiently a failed save is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based), doubling each time.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

/// Background writer for one document.
///
/// The hub hands over the latest snapshot; saves happen in order and a burst
/// of snapshots collapses into saving only the newest one.
pub struct Persister {
    tx: watch::Sender<Option<DocumentState>>,
    task: JoinHandle<()>,
}

impl Persister {
    pub fn spawn(
        doc_id: String,
        store: Arc<dyn DocumentStore>,
        hub_tx: mpsc::UnboundedSender<HubCommand>,
        retry: RetryPolicy,
    ) -> Self {
        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(persist_loop(doc_id, store, hub_tx, rx, retry));
        Self { tx, task }
    }

    pub fn publish(&self, state: DocumentState) {
        self.tx.send_replace(Some(state));
    }

    /// Save whatever is still pending, then stop.
    pub async fn flush(self) {
        let Persister { tx, task } = self;
        drop(tx);
        if let Err(e) = task.await {
            error!("Persister task failed: {}", e);
        }
    }
}

async fn persist_loop(
    doc_id: String,
    store: Arc<dyn DocumentStore>,
    hub_tx: mpsc::UnboundedSender<HubCommand>,
    mut rx: watch::Receiver<Option<DocumentState>>,
    retry: RetryPolicy,
) {
    // a pending value is still delivered after the sender is gone
    while rx.changed().await.is_ok() {
        let latest = rx.borrow_and_update().clone();
        let Some(mut state) = latest else {
            continue;
        };

        let mut attempt = 0;
        loop {
            match store.save_document(&doc_id, &mut state).await {
                Ok(()) => {
                    debug!("Saved document {} at version {}", doc_id, state.version);
                    let _ = hub_tx.send(HubCommand::Saved(state));
                    break;
                }
                Err(e) if attempt + 1 < retry.attempts => {
                    warn!(
                        "Saving document {} failed (attempt {}/{}): {}",
                        doc_id,
                        attempt + 1,
                        retry.attempts,
                        e
                    );
                    tokio::time::sleep(retry.delay(attempt)).await;
                    if rx.has_changed().unwrap_or(false) {
                        debug!("Newer snapshot of {} supersedes the failed one", doc_id);
                        break;
                    }
                    attempt += 1;
                }
                Err(e) => {
                    error!("Giving up saving document {} after {} attempts: {}", doc_id, retry.attempts, e);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, StoreError, StoreEvent};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::broadcast;

    struct FlakyStore {
        inner: MemoryStore,
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl DocumentStore for FlakyStore {
        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn save_document(&self, doc_id: &str, state: &mut DocumentState) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
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

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(200));
        assert_eq!(policy.delay(1), Duration::from_millis(400));
        assert_eq!(policy.delay(2), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn flush_saves_latest_snapshot_and_reports_version() {
        let store = Arc::new(MemoryStore::new());
        let (hub_tx, mut hub_rx) = mpsc::unbounded_channel();
        let persister = Persister::spawn("doc".into(), store.clone(), hub_tx, fast_retry());

        for lang in ["c", "go", "rust"] {
            persister.publish(DocumentState {
                language: lang.into(),
                ..DocumentState::untitled()
            });
        }
        persister.flush().await;

        let saved = store.load_document("doc").await.unwrap();
        assert_eq!(saved.language, "rust");
        let mut last = None;
        while let Ok(cmd) = hub_rx.try_recv() {
            if let HubCommand::Saved(saved) = cmd {
                last = Some(saved.version);
            }
        }
        assert_eq!(last, Some(saved.version));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        });
        let (hub_tx, _hub_rx) = mpsc::unbounded_channel();
        let persister = Persister::spawn("doc".into(), store.clone(), hub_tx, fast_retry());
        persister.publish(DocumentState::untitled());
        persister.flush().await;

        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.load_document("doc").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn gives_up_after_configured_attempts() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures_left: AtomicU32::new(10),
            calls: AtomicU32::new(0),
        });
        let (hub_tx, mut hub_rx) = mpsc::unbounded_channel();
        let persister = Persister::spawn("doc".into(), store.clone(), hub_tx, fast_retry());
        persister.publish(DocumentState::untitled());
        persister.flush().await;

        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert!(store.load_document("doc").await.unwrap().is_blank());
        assert!(hub_rx.try_recv().is_err());
    }
}
