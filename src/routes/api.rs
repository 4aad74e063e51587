use crate::handlers::{diagnostics, doc_delete, doc_snapshot, health_check, ready_check};
use crate::state::AppState;
use axum::{routing::get, Router};

/// Create API routes
pub fn create_api_routes() -> Router<AppState> {
    Router::<AppState>::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .route("/v1/diagnostics", get(diagnostics))
        .route("/v1/documents/:doc_id", get(doc_snapshot).delete(doc_delete))
}
