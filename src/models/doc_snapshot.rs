use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::{Tab, UserPresence};

/// Live view of a document hub on this replica
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshotResponse {
    pub id: String,
    pub phase: String,
    pub tabs: Vec<Tab>,
    pub active_tab_id: String,
    pub language: String,
    pub version: i64,
    pub last_modified: i64,
    pub users: BTreeMap<String, UserPresence>,
    pub connections: usize,
}
