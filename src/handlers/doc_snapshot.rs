use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::debug;

use crate::models::{DocumentSnapshotResponse, ErrorResponse};
use crate::state::AppState;

/// Live state of a document hub on this replica
pub async fn doc_snapshot(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Result<Json<DocumentSnapshotResponse>, (StatusCode, Json<ErrorResponse>)> {
    let not_found = || ErrorResponse::reply(StatusCode::NOT_FOUND, format!("Document '{}' is not open here", doc_id));

    let Some(hub) = state.registry.get(&doc_id).await else {
        debug!("No live hub for document {}", doc_id);
        return Err(not_found());
    };
    let Some(snapshot) = hub.snapshot().await else {
        return Err(not_found());
    };

    Ok(Json(DocumentSnapshotResponse {
        id: snapshot.doc_id,
        phase: snapshot.phase.as_str().to_string(),
        tabs: snapshot.state.tabs,
        active_tab_id: snapshot.state.active_tab_id,
        language: snapshot.state.language,
        version: snapshot.state.version,
        last_modified: snapshot.state.last_modified,
        users: snapshot.users,
        connections: snapshot.connections,
    }))
}
