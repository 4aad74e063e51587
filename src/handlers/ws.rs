use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    response::Response,
};
use serde::Deserialize;
use tracing::info;

use crate::state::AppState;
use crate::ws::serve_connection;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub doc: Option<String>,
}

/// WebSocket handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let doc_id = params
        .doc
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| state.default_doc_id.clone());
    info!("New WebSocket connection attempt for document {}", doc_id);
    ws.on_upgrade(move |socket| serve_connection(socket, doc_id, state.registry))
}
