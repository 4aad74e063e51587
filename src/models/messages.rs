use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{Tab, UserPresence};
use crate::services::ot::Operation;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SetNameMessage {
    #[serde(default)]
    pub uuid: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LanguageMessage {
    pub language: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMessage {
    pub tab_id: String,
    pub content: String,
}

/// Cursor/selection indicator. Position and selection are whatever the editor
/// widget uses, the server only relays them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CursorMessage {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub position: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TabCreateMessage {
    pub tab: Tab,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TabIdMessage {
    pub tab_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TabRenameMessage {
    pub tab_id: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TabNotesMessage {
    pub tab_id: String,
    pub notes: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EditMessage {
    pub tab_id: String,
    pub op: Operation,
}

/// Snapshot a peer sends back after a `requestState`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FullStateMessage {
    #[serde(default)]
    pub tabs: Vec<Tab>,
    #[serde(default)]
    pub active_tab_id: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub last_modified: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitMessage {
    pub tabs: Vec<Tab>,
    pub active_tab_id: String,
    pub language: String,
    pub users: BTreeMap<String, UserPresence>,
    pub last_modified: i64,
    pub version: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TabListMessage {
    pub tabs: Vec<Tab>,
    pub active_tab_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UserListMessage {
    pub users: BTreeMap<String, UserPresence>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorMessage {
    pub message: String,
}

/// Envelopes accepted from a client socket.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "setName")]
    SetName(SetNameMessage),
    #[serde(rename = "setLanguage")]
    SetLanguage(LanguageMessage),
    #[serde(rename = "language")]
    Language(LanguageMessage),
    #[serde(rename = "update")]
    Update(UpdateMessage),
    #[serde(rename = "cursor")]
    Cursor(CursorMessage),
    #[serde(rename = "tabCreate")]
    TabCreate(TabCreateMessage),
    #[serde(rename = "tabDelete")]
    TabDelete(TabIdMessage),
    #[serde(rename = "tabRename")]
    TabRename(TabRenameMessage),
    #[serde(rename = "tabFocus")]
    TabFocus(TabIdMessage),
    #[serde(rename = "tabNotesUpdate")]
    TabNotesUpdate(TabNotesMessage),
    #[serde(rename = "edit")]
    Edit(EditMessage),
    #[serde(rename = "requestState")]
    RequestState,
    #[serde(rename = "fullState")]
    FullState(FullStateMessage),
    /// Any other `type`. Ignored.
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::SetName(_) => "setName",
            ClientMessage::SetLanguage(_) => "setLanguage",
            ClientMessage::Language(_) => "language",
            ClientMessage::Update(_) => "update",
            ClientMessage::Cursor(_) => "cursor",
            ClientMessage::TabCreate(_) => "tabCreate",
            ClientMessage::TabDelete(_) => "tabDelete",
            ClientMessage::TabRename(_) => "tabRename",
            ClientMessage::TabFocus(_) => "tabFocus",
            ClientMessage::TabNotesUpdate(_) => "tabNotesUpdate",
            ClientMessage::Edit(_) => "edit",
            ClientMessage::RequestState => "requestState",
            ClientMessage::FullState(_) => "fullState",
            ClientMessage::Unknown => "unknown",
        }
    }
}

/// Envelopes the server sends to client sockets.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "init")]
    Init(InitMessage),
    #[serde(rename = "language")]
    Language(LanguageMessage),
    #[serde(rename = "update")]
    Update(UpdateMessage),
    #[serde(rename = "cursor")]
    Cursor(CursorMessage),
    #[serde(rename = "tabCreate")]
    TabCreate(TabCreateMessage),
    #[serde(rename = "tabFocus")]
    TabFocus(TabIdMessage),
    #[serde(rename = "tabNotesUpdate")]
    TabNotesUpdate(TabNotesMessage),
    #[serde(rename = "tabUpdate")]
    TabUpdate(TabListMessage),
    #[serde(rename = "userList")]
    UserList(UserListMessage),
    #[serde(rename = "requestState")]
    RequestState,
    #[serde(rename = "error")]
    Error(ErrorMessage),
}

/// Decode one inbound text frame.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str(text)
}
