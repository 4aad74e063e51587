use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Response returned after deleting a document
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDeleteResponse {
    pub success: bool,
    pub doc_id: String,
}
