pub mod api;

use axum::{routing::get, Router};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::docs::ApiDoc;
use crate::handlers::websocket_handler;
use crate::state::AppState;

pub use api::create_api_routes;

/// The whole HTTP surface: REST under `/api`, the socket at `/ws` and Swagger UI.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .nest("/api", create_api_routes())
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
