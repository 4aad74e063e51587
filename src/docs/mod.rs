use utoipa::OpenApi;
use crate::models::*;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn health_check_doc() {}

/// Readiness check endpoint
#[utoipa::path(
    get,
    path = "/api/ready",
    responses(
        (status = 200, description = "Document store reachable", body = HealthResponse),
        (status = 503, description = "Document store unreachable", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn ready_check_doc() {}

/// Live state of a document open on this replica
#[utoipa::path(
    get,
    path = "/api/v1/documents/{doc_id}",
    params(("doc_id" = String, Path, description = "Document id")),
    responses(
        (status = 200, description = "Document hub snapshot", body = DocumentSnapshotResponse),
        (status = 404, description = "Document not open on this replica", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn doc_snapshot_doc() {}

/// Delete a document
#[utoipa::path(
    delete,
    path = "/api/v1/documents/{doc_id}",
    params(("doc_id" = String, Path, description = "Document id")),
    responses(
        (status = 200, description = "Document deleted", body = DocumentDeleteResponse),
        (status = 500, description = "Store failure", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn doc_delete_doc() {}

/// Replica diagnostics
#[utoipa::path(
    get,
    path = "/api/v1/diagnostics",
    responses(
        (status = 200, description = "Hub and process statistics", body = DiagnosticsResponse)
    )
)]
#[allow(dead_code)]
pub async fn diagnostics_doc() {}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check_doc,
        ready_check_doc,
        doc_snapshot_doc,
        doc_delete_doc,
        diagnostics_doc,
    ),
    components(
        schemas(
            HealthResponse,
            ErrorResponse,
            DiagnosticsResponse,
            DocumentSnapshotResponse,
            DocumentDeleteResponse,
            Tab,
            UserPresence
        )
    ),
    tags(
        (name = "api", description = "API endpoints")
    )
)]
pub struct ApiDoc;
