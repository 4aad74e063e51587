use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const DEFAULT_TAB_ID: &str = "1";
pub const DEFAULT_TAB_NAME: &str = "Untitled";
pub const DEFAULT_LANGUAGE: &str = "plaintext";

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

/// A single editor tab. Content is always the full text, never a diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Tab {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub notes: String,
}

impl Tab {
    pub fn untitled() -> Self {
        Self {
            id: DEFAULT_TAB_ID.to_string(),
            name: DEFAULT_TAB_NAME.to_string(),
            content: String::new(),
            notes: String::new(),
        }
    }
}

/// Persisted snapshot of a document.
///
/// This is what lands in the store on every save and what travels over the
/// update channel between replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentState {
    #[serde(default)]
    pub tabs: Vec<Tab>,
    #[serde(default)]
    pub active_tab_id: String,
    #[serde(default = "default_language")]
    pub language: String,
    /// uuid -> display name of the users known when the snapshot was taken
    #[serde(default)]
    pub users: HashMap<String, String>,
    #[serde(default)]
    pub version: i64,
    /// Unix timestamp in milliseconds
    #[serde(default)]
    pub last_modified: i64,
    /// Replica that wrote this snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl Default for DocumentState {
    fn default() -> Self {
        Self {
            tabs: Vec::new(),
            active_tab_id: String::new(),
            language: default_language(),
            users: HashMap::new(),
            version: 0,
            last_modified: 0,
            origin: None,
        }
    }
}

impl DocumentState {
    /// Blank state with the minimum-tab invariant already applied.
    pub fn untitled() -> Self {
        let mut state = Self::default();
        state.ensure_minimum_tabs();
        state
    }

    /// True when nothing was ever persisted for this document.
    pub fn is_blank(&self) -> bool {
        self.version == 0 && self.tabs.is_empty()
    }

    /// Keep at least one tab around and make sure `active_tab_id` names one of them.
    pub fn ensure_minimum_tabs(&mut self) {
        if self.tabs.is_empty() {
            self.tabs.push(Tab::untitled());
            self.active_tab_id = DEFAULT_TAB_ID.to_string();
            return;
        }
        if !self.has_tab(&self.active_tab_id) {
            self.active_tab_id = self.tabs[0].id.clone();
        }
    }

    pub fn has_tab(&self, tab_id: &str) -> bool {
        self.tabs.iter().any(|t| t.id == tab_id)
    }

    pub fn tab_mut(&mut self, tab_id: &str) -> Option<&mut Tab> {
        self.tabs.iter_mut().find(|t| t.id == tab_id)
    }

    /// Last-writer-wins ordering: version first, then `last_modified`.
    pub fn is_newer_than(&self, version: i64, last_modified: i64) -> bool {
        self.version > version || (self.version == version && self.last_modified > last_modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tab(id: &str) -> Tab {
        Tab {
            id: id.to_string(),
            name: format!("Tab {id}"),
            content: String::new(),
            notes: String::new(),
        }
    }

    #[test]
    fn empty_state_gets_a_default_tab() {
        let mut state = DocumentState::default();
        assert!(state.is_blank());

        state.ensure_minimum_tabs();
        assert_eq!(state.tabs, vec![Tab::untitled()]);
        assert_eq!(state.active_tab_id, DEFAULT_TAB_ID);
    }

    #[test]
    fn dangling_active_tab_is_repaired() {
        let mut state = DocumentState {
            tabs: vec![tab("a"), tab("b")],
            active_tab_id: "gone".to_string(),
            ..DocumentState::default()
        };
        state.ensure_minimum_tabs();
        assert_eq!(state.active_tab_id, "a");
        assert_eq!(state.tabs.len(), 2);
    }

    #[test]
    fn decodes_sparse_snapshot() {
        let state: DocumentState =
            serde_json::from_str(r#"{"tabs":[{"id":"x"}],"version":3}"#).unwrap();
        assert_eq!(state.language, DEFAULT_LANGUAGE);
        assert_eq!(state.tabs[0].name, "");
        assert_eq!(state.version, 3);
        assert!(state.origin.is_none());
    }

    #[test]
    fn newer_compares_version_then_timestamp() {
        let state = DocumentState {
            version: 4,
            last_modified: 100,
            ..DocumentState::default()
        };
        assert!(state.is_newer_than(3, 500));
        assert!(state.is_newer_than(4, 99));
        assert!(!state.is_newer_than(4, 100));
        assert!(!state.is_newer_than(5, 0));
    }
}
