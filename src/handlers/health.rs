use axum::{extract::State, http::StatusCode, Json};
use tracing::{debug, error};

use crate::models::{ErrorResponse, HealthResponse};
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse::ok("Server is running"))
}

/// Readiness check endpoint, fails while the document store is unreachable
pub async fn ready_check(
    State(state): State<AppState>,
) -> Result<Json<HealthResponse>, (StatusCode, Json<ErrorResponse>)> {
    debug!("Readiness check requested");
    match state.store.ping().await {
        Ok(()) => Ok(Json(HealthResponse::ok("Service is ready"))),
        Err(e) => {
            error!("Readiness check failed: {}", e);
            Err(ErrorResponse::reply(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Document store unavailable: {}", e),
            ))
        }
    }
}
