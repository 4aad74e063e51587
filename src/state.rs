use std::sync::Arc;

use crate::db::DocumentStore;
use crate::ws::HubRegistry;

/// Shared state handed to every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<HubRegistry>,
    pub store: Arc<dyn DocumentStore>,
    pub default_doc_id: String,
    pub instance_id: String,
}

impl AppState {
    pub fn new(registry: Arc<HubRegistry>, default_doc_id: impl Into<String>) -> Self {
        Self {
            store: registry.store().clone(),
            instance_id: registry.config().instance_id.clone(),
            registry,
            default_doc_id: default_doc_id.into(),
        }
    }
}
