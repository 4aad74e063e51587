use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::{error, info};

use crate::models::{DocumentDeleteResponse, ErrorResponse};
use crate::state::AppState;

/// Delete a document snapshot. Every replica holding the document resets it.
pub async fn doc_delete(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Result<(StatusCode, Json<DocumentDeleteResponse>), (StatusCode, Json<ErrorResponse>)> {
    if doc_id.trim().is_empty() {
        return Err(ErrorResponse::reply(StatusCode::BAD_REQUEST, "Document id must not be empty"));
    }

    match state.store.delete_document(&doc_id).await {
        Ok(()) => info!("Document '{}' deleted", doc_id),
        Err(e) => {
            error!("Failed to delete document '{}': {}", doc_id, e);
            return Err(ErrorResponse::reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to delete document '{}': {}", doc_id, e),
            ));
        }
    }

    Ok((
        StatusCode::OK,
        Json(DocumentDeleteResponse { success: true, doc_id }),
    ))
}
