use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use sqlx::types::Json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{next_last_modified, DocumentStore, StoreError, StoreEvent, DOCUMENT_TTL, SUBSCRIPTION_CAPACITY};
use crate::models::DocumentState;

pub const UPDATE_CHANNEL: &str = "colabri_doc_updates";
pub const DELETE_CHANNEL: &str = "colabri_doc_deleted";

const REAP_INTERVAL: Duration = Duration::from_secs(60 * 60);

const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS doc_snapshots (
        doc_id TEXT PRIMARY KEY,
        version BIGINT NOT NULL,
        last_modified BIGINT NOT NULL,
        data JSONB NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )
"#;

/// Notification payload. The snapshot itself can exceed the NOTIFY size limit,
/// so listeners fetch it from the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyHeader {
    pub doc_id: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

type Channels = Arc<Mutex<HashMap<String, broadcast::Sender<StoreEvent>>>>;

/// Postgres-backed document store.
///
/// Snapshots live in `doc_snapshots` as JSONB. Saves and deletes issue
/// `pg_notify` inside the same transaction as the write, and a single
/// `LISTEN` connection per process fans notifications out to the per-document
/// subscribers.
pub struct PgStore {
    pool: PgPool,
    channels: Channels,
    tasks: Vec<JoinHandle<()>>,
}

impl PgStore {
    /// Connect, make sure the schema exists and start the listener and
    /// expiry reaper.
    ///
    /// Update notifications written by `instance_id` are not fetched or
    /// delivered; this process already holds that state.
    pub async fn connect(database_url: &str, instance_id: &str) -> Result<Arc<Self>, StoreError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url)
            .await?;

        sqlx::query(CREATE_TABLE_SQL).execute(&pool).await?;
        info!("Database connection pool created successfully");

        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen_all([UPDATE_CHANNEL, DELETE_CHANNEL]).await?;

        let channels: Channels = Arc::new(Mutex::new(HashMap::new()));
        let dispatcher = tokio::spawn(dispatch_notifications(
            listener,
            pool.clone(),
            channels.clone(),
            instance_id.to_string(),
        ));
        let reaper = tokio::spawn(reap_expired(pool.clone()));

        Ok(Arc::new(Self {
            pool,
            channels,
            tasks: vec![dispatcher, reaper],
        }))
    }

    fn log_pool_stats(&self, action: &str, doc_id: &str) {
        let idle = self.pool.num_idle() as u32;
        let size = self.pool.size();
        debug!(
            "{} document {}. Pool connections: {} idle, {} in use",
            action,
            doc_id,
            idle,
            size.saturating_sub(idle)
        );
    }
}

impl Drop for PgStore {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn save_document(&self, doc_id: &str, state: &mut DocumentState) -> Result<(), StoreError> {
        self.log_pool_stats("Saving", doc_id);

        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                error!(
                    "Failed to acquire connection from pool: {}. Pool state: {} idle, {} total",
                    e,
                    self.pool.num_idle(),
                    self.pool.size()
                );
                return Err(e.into());
            }
        };

        // Serialize writers of the same document, including the very first save.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;

        let current = sqlx::query_as::<_, (i64, i64)>(
            "SELECT version, last_modified FROM doc_snapshots WHERE doc_id = $1 AND expires_at > now()",
        )
        .bind(doc_id)
        .fetch_optional(&mut *tx)
        .await?;
        let (current_version, previous_modified) = current.unwrap_or((0, 0));

        state.version = current_version + 1;
        state.last_modified = next_last_modified(previous_modified.max(state.last_modified));

        sqlx::query(
            r#"
            INSERT INTO doc_snapshots (doc_id, version, last_modified, data, expires_at)
            VALUES ($1, $2, $3, $4, now() + make_interval(secs => $5))
            ON CONFLICT (doc_id) DO UPDATE
            SET version = EXCLUDED.version,
                last_modified = EXCLUDED.last_modified,
                data = EXCLUDED.data,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(doc_id)
        .bind(state.version)
        .bind(state.last_modified)
        .bind(Json(&*state))
        .bind(DOCUMENT_TTL.as_secs_f64())
        .execute(&mut *tx)
        .await?;

        let header = NotifyHeader {
            doc_id: doc_id.to_string(),
            version: state.version,
            origin: state.origin.clone(),
        };
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(UPDATE_CHANNEL)
            .bind(serde_json::to_string(&header)?)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn load_document(&self, doc_id: &str) -> Result<DocumentState, StoreError> {
        self.log_pool_stats("Loading", doc_id);
        Ok(fetch_snapshot(&self.pool, doc_id).await?.unwrap_or_default())
    }

    async fn delete_document(&self, doc_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM doc_snapshots WHERE doc_id = $1")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;

        let header = NotifyHeader {
            doc_id: doc_id.to_string(),
            version: 0,
            origin: None,
        };
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(DELETE_CHANNEL)
            .bind(serde_json::to_string(&header)?)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn subscribe(&self, doc_id: &str) -> Result<broadcast::Receiver<StoreEvent>, StoreError> {
        let mut channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
        let tx = channels
            .entry(doc_id.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIPTION_CAPACITY).0);
        Ok(tx.subscribe())
    }
}

async fn fetch_snapshot(pool: &PgPool, doc_id: &str) -> Result<Option<DocumentState>, StoreError> {
    let row = sqlx::query_as::<_, (Json<DocumentState>,)>(
        "SELECT data FROM doc_snapshots WHERE doc_id = $1 AND expires_at > now()",
    )
    .bind(doc_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(Json(state),)| state))
}

fn has_subscribers(channels: &Channels, doc_id: &str) -> bool {
    let mut channels = channels.lock().unwrap_or_else(|p| p.into_inner());
    match channels.get(doc_id) {
        Some(tx) if tx.receiver_count() > 0 => true,
        Some(_) => {
            channels.remove(doc_id);
            false
        }
        None => false,
    }
}

fn deliver(channels: &Channels, doc_id: &str, event: StoreEvent) {
    let channels = channels.lock().unwrap_or_else(|p| p.into_inner());
    if let Some(tx) = channels.get(doc_id) {
        let _ = tx.send(event);
    }
}

impl NotifyHeader {
    fn written_by(&self, instance_id: &str) -> bool {
        self.origin.as_deref() == Some(instance_id)
    }
}

async fn dispatch_notifications(mut listener: PgListener, pool: PgPool, channels: Channels, instance_id: String) {
    loop {
        let notification = match listener.recv().await {
            Ok(n) => n,
            Err(e) => {
                // the listener reconnects on the next recv
                error!("Notification listener error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let header: NotifyHeader = match serde_json::from_str(notification.payload()) {
            Ok(h) => h,
            Err(e) => {
                warn!("Ignoring malformed notification on {}: {}", notification.channel(), e);
                continue;
            }
        };
        if !has_subscribers(&channels, &header.doc_id) {
            continue;
        }

        match notification.channel() {
            UPDATE_CHANNEL if header.written_by(&instance_id) => {
                debug!("Skipping own update of {} at version {}", header.doc_id, header.version)
            }
            UPDATE_CHANNEL => match fetch_snapshot(&pool, &header.doc_id).await {
                Ok(Some(state)) => deliver(&channels, &header.doc_id, StoreEvent::Updated(state)),
                Ok(None) => debug!("Snapshot for {} vanished before it could be fetched", header.doc_id),
                Err(e) => error!("Failed to fetch snapshot for {}: {}", header.doc_id, e),
            },
            DELETE_CHANNEL => deliver(&channels, &header.doc_id, StoreEvent::Deleted),
            other => debug!("Notification on unexpected channel {}", other),
        }
    }
}

async fn reap_expired(pool: PgPool) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    loop {
        interval.tick().await;
        match sqlx::query("DELETE FROM doc_snapshots WHERE expires_at <= now()")
            .execute(&pool)
            .await
        {
            Ok(result) if result.rows_affected() > 0 => {
                info!("Removed {} expired document snapshots", result.rows_affected())
            }
            Ok(_) => {}
            Err(e) => error!("Failed to remove expired snapshots: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_header_wire_format() {
        let header = NotifyHeader {
            doc_id: "room-1".into(),
            version: 7,
            origin: Some("replica-a".into()),
        };
        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(json, serde_json::json!({"docId": "room-1", "version": 7, "origin": "replica-a"}));

        let deleted: NotifyHeader = serde_json::from_str(r#"{"docId":"room-1"}"#).unwrap();
        assert_eq!(deleted.version, 0);
        assert!(deleted.origin.is_none());
    }

    #[test]
    fn own_updates_are_recognized_by_origin() {
        let header = NotifyHeader {
            doc_id: "room-1".into(),
            version: 3,
            origin: Some("replica-a".into()),
        };
        assert!(header.written_by("replica-a"));
        assert!(!header.written_by("replica-b"));

        let anonymous = NotifyHeader { origin: None, ..header };
        assert!(!anonymous.written_by("replica-a"));
    }
}
