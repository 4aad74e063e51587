//! Document store: durable snapshots plus publish/subscribe fan-out between
//! replicas.
//!
//! Every save writes the snapshot, publishes it on the document's update
//! channel and refreshes its expiry as one unit, so a replica never sees a
//! published update that was not written (or the reverse).

pub mod memstore;
pub mod pgstore;

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::models::DocumentState;

pub use memstore::MemoryStore;
pub use pgstore::PgStore;

/// Snapshots expire after 7 days without a save.
pub const DOCUMENT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Capacity of each per-document subscription channel.
pub const SUBSCRIPTION_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode or decode document state: {0}")]
    Codec(#[from] serde_json::Error),
}

/// What a subscriber receives for a document.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Updated(DocumentState),
    Deleted,
}

#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Verify the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Persist `state`, bumping `state.version` to stored + 1 and stamping
    /// `state.last_modified`, then publish it to subscribers.
    async fn save_document(&self, doc_id: &str, state: &mut DocumentState) -> Result<(), StoreError>;

    /// Stored snapshot, or a blank default when there is none.
    async fn load_document(&self, doc_id: &str) -> Result<DocumentState, StoreError>;

    /// Remove the snapshot and publish a deletion notice.
    async fn delete_document(&self, doc_id: &str) -> Result<(), StoreError>;

    /// Receive every snapshot published for `doc_id` from now on.
    async fn subscribe(&self, doc_id: &str) -> Result<broadcast::Receiver<StoreEvent>, StoreError>;
}

/// Subscribe to `doc_id` and return the loop that feeds every event to
/// `handler`, until the subscription closes or the handler breaks.
///
/// The subscription is live once this returns, so callers can load the
/// current snapshot afterwards without missing an update in between.
pub async fn subscribe_to_updates<F>(
    store: &dyn DocumentStore,
    doc_id: &str,
    mut handler: F,
) -> Result<impl Future<Output = ()> + Send + 'static, StoreError>
where
    F: FnMut(StoreEvent) -> ControlFlow<()> + Send + 'static,
{
    let mut rx = store.subscribe(doc_id).await?;
    let doc_id = doc_id.to_string();
    Ok(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if handler(event).is_break() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Subscriber for document {} lagged, skipped {} updates", doc_id, skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Subscription for document {} ended", doc_id);
    })
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// A save always moves `last_modified` forward, even within the same millisecond.
pub(crate) fn next_last_modified(previous: i64) -> i64 {
    now_millis().max(previous + 1)
}
