use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::DocumentStore;
use crate::models::{
    ClientMessage, CursorMessage, DocumentState, ErrorMessage, FullStateMessage, InitMessage, LanguageMessage,
    ServerMessage, SetNameMessage, TabIdMessage, TabListMessage, UpdateMessage, UserListMessage, UserPresence,
};
use crate::services::ot;

use super::persist::{Persister, RetryPolicy};
use super::presence::Roster;
use super::sync::spawn_synchronizer;

/// Identifies one client socket for the lifetime of its connection.
pub type ConnId = Uuid;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Written as `origin` into every snapshot this process saves.
    pub instance_id: String,
    pub presence_grace: Duration,
    pub recovery_timeout: Duration,
    pub outbound_capacity: usize,
    pub save_retry: RetryPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            presence_grace: Duration::from_secs(120),
            recovery_timeout: Duration::from_millis(5000),
            outbound_capacity: 256,
            save_retry: RetryPolicy::default(),
        }
    }
}

pub enum HubCommand {
    Register { conn: ConnId, outbound: mpsc::Sender<String> },
    Unregister(ConnId),
    Inbound(ConnId, ClientMessage),
    Remote(DocumentState),
    RemoteDeleted,
    /// A snapshot the persister wrote, stamped with its stored version.
    Saved(DocumentState),
    RecoveryTimeout { epoch: u64 },
    EvictPresence { uuid: String, conn: ConnId },
    Inspect(oneshot::Sender<HubSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HubPhase {
    /// Subscribing and loading; commands wait in the queue.
    Cold,
    /// Waiting for a connected peer to hand over its copy of the document.
    Recovering,
    Active,
}

impl HubPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            HubPhase::Cold => "cold",
            HubPhase::Recovering => "recovering",
            HubPhase::Active => "active",
        }
    }
}

/// Point-in-time view of a hub, for diagnostics.
#[derive(Debug, Clone)]
pub struct HubSnapshot {
    pub doc_id: String,
    pub phase: HubPhase,
    pub has_state: bool,
    pub state: DocumentState,
    pub users: BTreeMap<String, UserPresence>,
    pub connections: usize,
}

/// Cheap, cloneable address of a running hub.
#[derive(Clone)]
pub struct HubHandle {
    doc_id: Arc<str>,
    tx: mpsc::UnboundedSender<HubCommand>,
    attached: Arc<AtomicUsize>,
}

impl HubHandle {
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn send(&self, command: HubCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    pub fn register(&self, conn: ConnId, outbound: mpsc::Sender<String>) -> bool {
        self.send(HubCommand::Register { conn, outbound })
    }

    /// Detach a client: drop it from fan-out and start its presence grace period.
    pub fn unregister(&self, conn: ConnId) {
        let _ = self
            .attached
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
        self.send(HubCommand::Unregister(conn));
    }

    pub fn dispatch(&self, conn: ConnId, message: ClientMessage) -> bool {
        self.send(HubCommand::Inbound(conn, message))
    }

    pub(crate) fn attach(&self) {
        self.attached.fetch_add(1, Ordering::SeqCst);
    }

    /// Clients attached through the registry and not yet unregistered.
    pub fn attached_clients(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the hub has stopped and saved.
    pub async fn stopped(&self) {
        self.tx.closed().await
    }

    pub async fn snapshot(&self) -> Option<HubSnapshot> {
        let (reply, rx) = oneshot::channel();
        if !self.send(HubCommand::Inspect(reply)) {
            return None;
        }
        rx.await.ok()
    }

    /// Stop the hub after saving anything still pending.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(HubCommand::Shutdown(reply)) {
            let _ = rx.await;
        }
    }
}

/// Start the actor that owns `doc_id`.
///
/// The hub lives until it receives `Shutdown`; the registry is responsible
/// for sending it.
pub fn spawn_hub(doc_id: &str, store: Arc<dyn DocumentStore>, config: HubConfig) -> HubHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let attached = Arc::new(AtomicUsize::new(0));
    let persister = Persister::spawn(doc_id.to_string(), store.clone(), tx.clone(), config.save_retry);

    let hub = Hub {
        doc_id: doc_id.to_string(),
        store,
        config,
        tx: tx.clone(),
        state: DocumentState::default(),
        has_state: false,
        phase: HubPhase::Cold,
        conns: HashMap::new(),
        roster: Roster::new(),
        waiting: Vec::new(),
        recovery_epoch: 0,
        persister,
        remote_since_publish: false,
        rng: StdRng::from_entropy(),
    };
    tokio::spawn(hub.run(rx));

    HubHandle {
        doc_id: Arc::from(doc_id),
        tx,
        attached,
    }
}

struct Hub {
    doc_id: String,
    store: Arc<dyn DocumentStore>,
    config: HubConfig,
    tx: mpsc::UnboundedSender<HubCommand>,
    state: DocumentState,
    /// False until the document holds content someone actually wrote.
    has_state: bool,
    phase: HubPhase,
    conns: HashMap<ConnId, mpsc::Sender<String>>,
    roster: Roster,
    /// Sockets registered during recovery; they get `init` once it ends.
    waiting: Vec<ConnId>,
    recovery_epoch: u64,
    persister: Persister,
    /// State came from another replica (or a deletion) after the last local
    /// publish, so a save still in flight may land above it.
    remote_since_publish: bool,
    rng: StdRng,
}

impl Hub {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<HubCommand>) {
        // subscribe before loading so no update slips in between
        let synchronizer = match spawn_synchronizer(
            &*self.store,
            &self.doc_id,
            self.config.instance_id.clone(),
            self.tx.clone(),
        )
        .await
        {
            Ok(task) => Some(task),
            Err(e) => {
                error!("Failed to subscribe to updates for document {}: {}", self.doc_id, e);
                None
            }
        };

        // answer inspections while loading, hold everything else back
        let mut held = VecDeque::new();
        let loaded = {
            let load = self.store.load_document(&self.doc_id);
            tokio::pin!(load);
            loop {
                tokio::select! {
                    result = &mut load => break result,
                    Some(command) = rx.recv() => match command {
                        HubCommand::Inspect(reply) => {
                            let _ = reply.send(self.snapshot());
                        }
                        other => held.push_back(other),
                    },
                }
            }
        };

        match loaded {
            Ok(state) if !state.is_blank() => {
                info!("Loaded document {} at version {}", self.doc_id, state.version);
                self.state = state;
                self.has_state = true;
            }
            Ok(_) => debug!("No stored snapshot for document {}", self.doc_id),
            Err(e) => error!("Failed to load document {}: {}", self.doc_id, e),
        }
        self.state.ensure_minimum_tabs();
        self.phase = HubPhase::Active;

        let mut stopped = None;
        loop {
            let command = match held.pop_front() {
                Some(command) => command,
                None => match rx.recv().await {
                    Some(command) => command,
                    None => break,
                },
            };
            if let HubCommand::Shutdown(reply) = command {
                stopped = Some(reply);
                break;
            }
            self.handle(command);
        }

        if let Some(task) = synchronizer {
            task.abort();
        }
        let doc_id = self.doc_id.clone();
        self.persister.flush().await;
        drop(rx);
        info!("Hub for document {} stopped", doc_id);
        if let Some(reply) = stopped {
            let _ = reply.send(());
        }
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { conn, outbound } => self.on_register(conn, outbound),
            HubCommand::Unregister(conn) => self.on_unregister(conn),
            HubCommand::Inbound(conn, message) => self.on_message(conn, message),
            HubCommand::Remote(state) => self.on_remote(state),
            HubCommand::RemoteDeleted => self.on_remote_deleted(),
            HubCommand::Saved(saved) => self.on_saved(saved),
            HubCommand::RecoveryTimeout { epoch } => {
                if self.phase == HubPhase::Recovering && epoch == self.recovery_epoch {
                    warn!(
                        "No peer answered the state request for document {} in time, serving current state",
                        self.doc_id
                    );
                    self.finish_recovery();
                }
            }
            HubCommand::EvictPresence { uuid, conn } => {
                if self.roster.evict(&uuid, conn) {
                    debug!("Presence of {} in document {} expired", uuid, self.doc_id);
                    self.broadcast_user_list();
                }
            }
            HubCommand::Inspect(reply) => {
                let _ = reply.send(self.snapshot());
            }
            // handled by the run loop
            HubCommand::Shutdown(_) => {}
        }
    }

    fn snapshot(&self) -> HubSnapshot {
        HubSnapshot {
            doc_id: self.doc_id.clone(),
            phase: self.phase,
            has_state: self.has_state,
            state: self.state.clone(),
            users: self.roster.user_list(),
            connections: self.conns.len(),
        }
    }

    fn on_register(&mut self, conn: ConnId, outbound: mpsc::Sender<String>) {
        self.conns.insert(conn, outbound);
        info!(
            "Client {} registered in document {}, total clients: {}",
            conn,
            self.doc_id,
            self.conns.len()
        );

        if !self.has_state && self.conns.len() > 1 {
            self.waiting.push(conn);
            if self.phase != HubPhase::Recovering {
                self.begin_recovery();
            }
        } else {
            self.send_init(conn);
        }
    }

    fn on_unregister(&mut self, conn: ConnId) {
        self.conns.remove(&conn);
        self.waiting.retain(|c| *c != conn);
        info!(
            "Client {} unregistered from document {}, total clients: {}",
            conn,
            self.doc_id,
            self.conns.len()
        );

        if let Some(uuid) = self.roster.depart(conn, Utc::now()) {
            self.broadcast_user_list();
            let tx = self.tx.clone();
            let grace = self.config.presence_grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let _ = tx.send(HubCommand::EvictPresence { uuid, conn });
            });
        }

        // nobody left who could answer the state request
        if self.phase == HubPhase::Recovering && self.conns.len() == self.waiting.len() {
            self.finish_recovery();
        }
    }

    fn begin_recovery(&mut self) {
        self.phase = HubPhase::Recovering;
        self.recovery_epoch += 1;
        info!("Requesting state for document {} from connected peers", self.doc_id);

        let peers: Vec<ConnId> = self
            .conns
            .keys()
            .filter(|c| !self.waiting.contains(c))
            .copied()
            .collect();
        for peer in peers {
            self.send_to(peer, &ServerMessage::RequestState);
        }

        let tx = self.tx.clone();
        let epoch = self.recovery_epoch;
        let timeout = self.config.recovery_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(HubCommand::RecoveryTimeout { epoch });
        });
    }

    fn finish_recovery(&mut self) {
        self.phase = HubPhase::Active;
        for conn in std::mem::take(&mut self.waiting) {
            self.send_init(conn);
        }
    }

    /// Record a content change: the document now has real state and the
    /// snapshot goes to the persister.
    fn changed(&mut self) {
        self.has_state = true;
        let mut snapshot = self.state.clone();
        snapshot.users = self.roster.names();
        snapshot.origin = Some(self.config.instance_id.clone());
        self.persister.publish(snapshot);
        self.remote_since_publish = false;
        if self.phase == HubPhase::Recovering {
            self.finish_recovery();
        }
    }

    fn on_message(&mut self, conn: ConnId, message: ClientMessage) {
        if !self.conns.contains_key(&conn) {
            debug!("Dropping {} from detached client {}", message.kind(), conn);
            return;
        }

        match message {
            ClientMessage::SetName(m) => self.on_set_name(conn, m),
            ClientMessage::SetLanguage(m) | ClientMessage::Language(m) => {
                self.state.language = m.language.clone();
                self.broadcast(None, &ServerMessage::Language(m));
                self.changed();
            }
            ClientMessage::Update(m) => {
                let Some(tab) = self.state.tab_mut(&m.tab_id) else {
                    warn!("Update for unknown tab {} in document {}", m.tab_id, self.doc_id);
                    return;
                };
                tab.content = m.content.clone();
                self.broadcast(Some(conn), &ServerMessage::Update(m));
                self.changed();
            }
            ClientMessage::Cursor(m) => self.on_cursor(conn, m),
            ClientMessage::TabCreate(m) => {
                if self.state.has_tab(&m.tab.id) {
                    debug!("Tab {} already exists in document {}", m.tab.id, self.doc_id);
                    return;
                }
                let tab_id = m.tab.id.clone();
                self.state.tabs.push(m.tab.clone());
                self.state.active_tab_id = tab_id.clone();
                self.broadcast(None, &ServerMessage::TabCreate(m));
                self.broadcast(None, &ServerMessage::TabFocus(TabIdMessage { tab_id }));
                self.changed();
            }
            ClientMessage::TabDelete(m) => self.on_tab_delete(conn, m),
            ClientMessage::TabRename(m) => {
                let Some(tab) = self.state.tab_mut(&m.tab_id) else {
                    warn!("Rename of unknown tab {} in document {}", m.tab_id, self.doc_id);
                    return;
                };
                tab.name = m.name;
                self.broadcast(None, &self.tab_list());
                self.changed();
            }
            ClientMessage::TabFocus(m) => {
                if !self.state.has_tab(&m.tab_id) {
                    debug!("Focus on unknown tab {} in document {}", m.tab_id, self.doc_id);
                    return;
                }
                self.state.active_tab_id = m.tab_id.clone();
                self.broadcast(None, &ServerMessage::TabFocus(m));
                self.changed();
            }
            ClientMessage::TabNotesUpdate(m) => {
                let Some(tab) = self.state.tab_mut(&m.tab_id) else {
                    warn!("Notes for unknown tab {} in document {}", m.tab_id, self.doc_id);
                    return;
                };
                tab.notes = m.notes.clone();
                self.broadcast(None, &ServerMessage::TabNotesUpdate(m));
                self.changed();
            }
            ClientMessage::Edit(m) => {
                let Some(tab) = self.state.tab_mut(&m.tab_id) else {
                    self.send_error(conn, format!("unknown tab {}", m.tab_id));
                    return;
                };
                match ot::apply(&tab.content, &m.op) {
                    Ok(content) => {
                        tab.content = content.clone();
                        let update = UpdateMessage { tab_id: m.tab_id, content };
                        self.broadcast(None, &ServerMessage::Update(update));
                        self.changed();
                    }
                    Err(e) => {
                        warn!("Rejected edit on tab {} in document {}: {}", m.tab_id, self.doc_id, e);
                        self.send_error(conn, e.to_string());
                    }
                }
            }
            ClientMessage::FullState(m) => self.on_full_state(conn, m),
            ClientMessage::RequestState => debug!("Ignoring requestState from client {}", conn),
            ClientMessage::Unknown => debug!("Ignoring unknown message from client {}", conn),
        }
    }

    fn on_set_name(&mut self, conn: ConnId, m: SetNameMessage) {
        let uuid = if m.uuid.is_empty() { conn.to_string() } else { m.uuid };
        let binding = self.roster.bind(conn, &uuid, &m.name, &mut self.rng);
        info!(
            "Assigned color {} to user {} ({}) in document {}",
            binding.color, m.name, uuid, self.doc_id
        );

        if let Some(stale) = binding.evicted.filter(|c| *c != conn) {
            // closing its queue ends the old socket
            if self.conns.remove(&stale).is_some() {
                info!("Replaced connection {} of user {} in document {}", stale, uuid, self.doc_id);
            }
            self.waiting.retain(|c| *c != stale);
        }

        self.broadcast_user_list();
    }

    fn on_cursor(&mut self, conn: ConnId, mut m: CursorMessage) {
        if let Some(user) = self.roster.identity(conn) {
            m.uuid = user.uuid.clone();
            m.name = user.name.clone();
            m.color = user.color.clone();
        }
        self.broadcast(None, &ServerMessage::Cursor(m));
    }

    fn on_tab_delete(&mut self, conn: ConnId, m: TabIdMessage) {
        let Some(index) = self.state.tabs.iter().position(|t| t.id == m.tab_id) else {
            debug!("Delete of unknown tab {} in document {}", m.tab_id, self.doc_id);
            return;
        };
        if self.state.tabs.len() == 1 {
            warn!("Refusing to delete the last tab of document {}", self.doc_id);
            let resync = self.tab_list();
            self.send_to(conn, &resync);
            return;
        }

        self.state.tabs.remove(index);
        if self.state.active_tab_id == m.tab_id {
            self.state.active_tab_id = self.state.tabs[0].id.clone();
        }
        self.state.ensure_minimum_tabs();
        self.broadcast(None, &self.tab_list());
        self.changed();
    }

    fn on_full_state(&mut self, conn: ConnId, m: FullStateMessage) {
        if self.phase != HubPhase::Recovering {
            debug!("Ignoring unsolicited fullState from client {}", conn);
            return;
        }
        if self.waiting.contains(&conn) {
            debug!("Ignoring fullState from waiting client {}", conn);
            return;
        }

        info!("Recovered document {} from peer {}", self.doc_id, conn);
        self.state.tabs = m.tabs;
        self.state.active_tab_id = m.active_tab_id;
        if let Some(language) = m.language {
            self.state.language = language;
        }
        self.state.last_modified = self.state.last_modified.max(m.last_modified);
        self.state.ensure_minimum_tabs();
        self.changed();
    }

    fn on_remote(&mut self, remote: DocumentState) {
        if !remote.is_newer_than(self.state.version, self.state.last_modified) {
            debug!(
                "Discarding stale update for document {} (version {} <= {})",
                self.doc_id, remote.version, self.state.version
            );
            return;
        }

        debug!("Applying update for document {} at version {}", self.doc_id, remote.version);
        self.adopt(remote);
        self.remote_since_publish = true;
        if self.phase == HubPhase::Recovering {
            self.finish_recovery();
        }
    }

    /// A local save landed. Normally only the version moves forward, but if
    /// another replica's snapshot was adopted while the save was in flight,
    /// the store now holds ours above it and we follow the store.
    fn on_saved(&mut self, saved: DocumentState) {
        if saved.version <= self.state.version {
            return;
        }
        if self.remote_since_publish {
            info!(
                "Own save of document {} landed at version {} after a remote update, following the store",
                self.doc_id, saved.version
            );
            self.adopt(saved);
        } else {
            self.state.version = saved.version;
            self.state.last_modified = saved.last_modified;
        }
    }

    /// Replace the document with `next` and tell local sockets what changed.
    fn adopt(&mut self, next: DocumentState) {
        let language_changed = self.state.language != next.language;
        let names_changed = self.roster.refresh_names(&next.users);
        self.state = DocumentState { origin: None, ..next };
        self.state.ensure_minimum_tabs();
        self.has_state = true;

        self.broadcast(None, &self.tab_list());
        if language_changed {
            let language = LanguageMessage { language: self.state.language.clone() };
            self.broadcast(None, &ServerMessage::Language(language));
        }
        if names_changed {
            self.broadcast_user_list();
        }
    }

    fn on_remote_deleted(&mut self) {
        info!("Document {} was deleted, resetting", self.doc_id);
        self.state = DocumentState::untitled();
        self.has_state = false;
        self.remote_since_publish = true;
        self.broadcast(None, &self.tab_list());
        let language = LanguageMessage { language: self.state.language.clone() };
        self.broadcast(None, &ServerMessage::Language(language));
    }

    fn tab_list(&self) -> ServerMessage {
        ServerMessage::TabUpdate(TabListMessage {
            tabs: self.state.tabs.clone(),
            active_tab_id: self.state.active_tab_id.clone(),
        })
    }

    fn send_init(&mut self, conn: ConnId) {
        let init = ServerMessage::Init(InitMessage {
            tabs: self.state.tabs.clone(),
            active_tab_id: self.state.active_tab_id.clone(),
            language: self.state.language.clone(),
            users: self.roster.user_list(),
            last_modified: self.state.last_modified,
            version: self.state.version,
        });
        self.send_to(conn, &init);
    }

    fn send_error(&mut self, conn: ConnId, message: String) {
        self.send_to(conn, &ServerMessage::Error(ErrorMessage { message }));
    }

    fn broadcast_user_list(&mut self) {
        let users = UserListMessage { users: self.roster.user_list() };
        self.broadcast(None, &ServerMessage::UserList(users));
    }

    fn send_to(&mut self, conn: ConnId, message: &ServerMessage) {
        let Some(text) = encode(message) else { return };
        let full = match self.conns.get(&conn) {
            Some(outbound) => !self.try_deliver(conn, outbound, text),
            None => false,
        };
        if full {
            self.drop_conn(conn);
        }
    }

    /// Fan `message` out to every socket. `update` skips the socket it came from.
    fn broadcast(&mut self, sender: Option<ConnId>, message: &ServerMessage) {
        let Some(text) = encode(message) else { return };
        let skip = match message {
            ServerMessage::Update(_) => sender,
            _ => None,
        };

        let mut dead = Vec::new();
        for (conn, outbound) in &self.conns {
            if Some(*conn) == skip {
                continue;
            }
            if !self.try_deliver(*conn, outbound, text.clone()) {
                dead.push(*conn);
            }
        }
        for conn in dead {
            self.drop_conn(conn);
        }
    }

    fn try_deliver(&self, conn: ConnId, outbound: &mpsc::Sender<String>, text: String) -> bool {
        match outbound.try_send(text) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue of client {} in document {} is full, dropping it", conn, self.doc_id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Client {} in document {} already gone", conn, self.doc_id);
                false
            }
        }
    }

    fn drop_conn(&mut self, conn: ConnId) {
        self.conns.remove(&conn);
        self.waiting.retain(|c| *c != conn);
    }
}

fn encode(message: &ServerMessage) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(text) => Some(text),
        Err(e) => {
            error!("Failed to encode outbound message: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, StoreError, StoreEvent};
    use crate::models::decode_client_message;
    use async_trait::async_trait;
    use tokio::sync::{broadcast, Notify};

    /// Loads block until `release` is notified.
    struct GatedStore {
        inner: MemoryStore,
        release: Notify,
    }

    #[async_trait]
    impl DocumentStore for GatedStore {
        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn save_document(&self, doc_id: &str, state: &mut DocumentState) -> Result<(), StoreError> {
            self.inner.save_document(doc_id, state).await
        }

        async fn load_document(&self, doc_id: &str) -> Result<DocumentState, StoreError> {
            self.release.notified().await;
            self.inner.load_document(doc_id).await
        }

        async fn delete_document(&self, doc_id: &str) -> Result<(), StoreError> {
            self.inner.delete_document(doc_id).await
        }

        async fn subscribe(&self, doc_id: &str) -> Result<broadcast::Receiver<StoreEvent>, StoreError> {
            self.inner.subscribe(doc_id).await
        }
    }

    async fn next(rx: &mut mpsc::Receiver<String>) -> serde_json::Value {
        let text = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("queue closed");
        serde_json::from_str(&text).unwrap()
    }

    fn connect(hub: &HubHandle) -> (ConnId, mpsc::Receiver<String>) {
        let conn = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(64);
        hub.attach();
        assert!(hub.register(conn, tx));
        (conn, rx)
    }

    fn send(hub: &HubHandle, conn: ConnId, json: &str) {
        hub.dispatch(conn, decode_client_message(json).unwrap());
    }

    #[tokio::test]
    async fn edit_applies_operation_and_broadcasts_content() {
        let store = Arc::new(MemoryStore::new());
        let hub = spawn_hub("doc", store, HubConfig::default());
        let (a, mut rx_a) = connect(&hub);
        assert_eq!(next(&mut rx_a).await["type"], "init");

        send(&hub, a, r#"{"type":"update","tabId":"1","content":"abcdef"}"#);
        send(&hub, a, r#"{"type":"edit","tabId":"1","op":{"type":"insert","position":2,"text":"XY"}}"#);
        let update = next(&mut rx_a).await;
        assert_eq!(update["type"], "update");
        assert_eq!(update["content"], "abXYcdef");

        send(&hub, a, r#"{"type":"edit","tabId":"1","op":{"type":"delete","position":7,"length":5}}"#);
        let error = next(&mut rx_a).await;
        assert_eq!(error["type"], "error");

        let snapshot = hub.snapshot().await.unwrap();
        assert_eq!(snapshot.state.tabs[0].content, "abXYcdef");
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn tab_create_appends_and_focuses() {
        let store = Arc::new(MemoryStore::new());
        let hub = spawn_hub("doc", store.clone(), HubConfig::default());
        let (a, mut rx_a) = connect(&hub);
        next(&mut rx_a).await;

        send(&hub, a, r#"{"type":"tabCreate","tab":{"id":"2","name":"Scratch","content":"","notes":""}}"#);
        assert_eq!(next(&mut rx_a).await["type"], "tabCreate");
        let focus = next(&mut rx_a).await;
        assert_eq!(focus["type"], "tabFocus");
        assert_eq!(focus["tabId"], "2");

        // duplicate id is ignored
        send(&hub, a, r#"{"type":"tabCreate","tab":{"id":"2","name":"Again"}}"#);
        let snapshot = hub.snapshot().await.unwrap();
        assert_eq!(snapshot.state.tabs.len(), 2);
        assert_eq!(snapshot.state.tabs[1].name, "Scratch");
        assert_eq!(snapshot.state.active_tab_id, "2");

        hub.shutdown().await;
        let stored = store.load_document("doc").await.unwrap();
        assert_eq!(stored.tabs.len(), 2);
    }

    #[tokio::test]
    async fn cursor_is_stamped_with_sender_identity() {
        let store = Arc::new(MemoryStore::new());
        let hub = spawn_hub("doc", store, HubConfig::default());
        let (a, mut rx_a) = connect(&hub);
        next(&mut rx_a).await;

        send(&hub, a, r#"{"type":"setName","uuid":"u1","name":"Ada"}"#);
        let users = next(&mut rx_a).await;
        let color = users["users"]["u1"]["color"].as_str().unwrap().to_string();

        send(&hub, a, r#"{"type":"cursor","uuid":"spoofed","name":"Eve","position":{"line":1}}"#);
        let cursor = next(&mut rx_a).await;
        assert_eq!(cursor["type"], "cursor");
        assert_eq!(cursor["uuid"], "u1");
        assert_eq!(cursor["name"], "Ada");
        assert_eq!(cursor["color"], color.as_str());
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn messages_from_unregistered_clients_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        let hub = spawn_hub("doc", store, HubConfig::default());
        let (_a, mut rx_a) = connect(&hub);
        next(&mut rx_a).await;

        send(&hub, Uuid::new_v4(), r#"{"type":"setLanguage","language":"go"}"#);
        let snapshot = hub.snapshot().await.unwrap();
        assert_eq!(snapshot.state.language, "plaintext");
        assert_eq!(snapshot.phase, HubPhase::Active);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn loading_hub_reports_cold_and_queues_clients() {
        let store = Arc::new(GatedStore {
            inner: MemoryStore::new(),
            release: Notify::new(),
        });
        let hub = spawn_hub("doc", store.clone(), HubConfig::default());
        let (_a, mut rx_a) = connect(&hub);

        let snapshot = hub.snapshot().await.unwrap();
        assert_eq!(snapshot.phase, HubPhase::Cold);
        assert_eq!(snapshot.connections, 0);
        assert!(rx_a.try_recv().is_err());

        store.release.notify_one();
        assert_eq!(next(&mut rx_a).await["type"], "init");
        assert_eq!(hub.snapshot().await.unwrap().phase, HubPhase::Active);
        hub.shutdown().await;
    }
}
