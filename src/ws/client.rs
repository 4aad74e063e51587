use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::decode_client_message;
use crate::utils::scope_guard::ScopeGuard;

use super::registry::HubRegistry;

/// Drive one client socket attached to the hub of `doc_id`.
pub async fn serve_connection(socket: WebSocket, doc_id: String, registry: Arc<HubRegistry>) {
    let conn = Uuid::new_v4();
    info!("WebSocket connection established for document {} with connection id {}", doc_id, conn);

    let hub = registry.get_or_create(&doc_id).await;
    let detach = hub.clone();
    // runs on every exit path below
    let _guard = ScopeGuard::new(move || detach.unregister(conn));

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(registry.config().outbound_capacity);
    if !hub.register(conn, outbound_tx) {
        warn!("Hub for document {} is gone, closing connection {}", doc_id, conn);
        return;
    }

    let (mut sender, mut receiver) = socket.split();

    // Writer: drain the outbound queue. It ends when the hub drops the queue.
    let mut send_task = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    // Reader: decode frames and hand them to the hub.
    let reader_hub = hub.clone();
    let reader_doc = doc_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => match decode_client_message(&text) {
                    Ok(message) => {
                        debug!("Received {} from {} in document {}", message.kind(), conn, reader_doc);
                        if !reader_hub.dispatch(conn, message) {
                            break;
                        }
                    }
                    Err(e) => warn!("Malformed message from {} in document {}: {}", conn, reader_doc, e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("WebSocket read error for {} in document {}: {}", conn, reader_doc, e);
                    break;
                }
            }
        }
    });

    // Wait for either task to finish (and finish the other)
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };
    info!("WebSocket connection {} for document {} terminated", conn, doc_id);
}
