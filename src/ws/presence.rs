use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::models::UserPresence;

use super::hub::ConnId;

/// Colors handed out to users, in preference order for the picker.
pub const COLOR_PALETTE: [&str; 9] = [
    "#e57373", "#64b5f6", "#81c784", "#ffd54f", "#ba68c8", "#4db6ac", "#ffb74d", "#a1887f", "#90a4ae",
];

#[derive(Debug, Clone)]
struct PresenceEntry {
    presence: UserPresence,
    conn: ConnId,
}

/// Outcome of binding a connection to a user identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub color: String,
    /// Connection that previously held this identity and must be dropped.
    pub evicted: Option<ConnId>,
    /// The user came back within the grace window and kept their color.
    pub resumed: bool,
}

/// Users of one document, keyed by their stable uuid.
///
/// A user who disconnects stays listed (flagged `disconnected`) until the
/// grace timer evicts them, so a quick reconnect keeps name and color.
#[derive(Debug, Default)]
pub struct Roster {
    users: HashMap<String, PresenceEntry>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn get(&self, uuid: &str) -> Option<&UserPresence> {
        self.users.get(uuid).map(|e| &e.presence)
    }

    /// Identity currently bound to `conn`, if any.
    pub fn identity(&self, conn: ConnId) -> Option<&UserPresence> {
        self.users
            .values()
            .find(|e| e.conn == conn && !e.presence.disconnected)
            .map(|e| &e.presence)
    }

    /// Bind `conn` to `uuid` under `name`.
    pub fn bind<R: Rng>(&mut self, conn: ConnId, uuid: &str, name: &str, rng: &mut R) -> Binding {
        // a connection holds at most one identity
        self.users.retain(|id, e| id == uuid || e.conn != conn);

        let (color, evicted, resumed) = match self.users.get(uuid) {
            Some(existing) if existing.conn == conn => (existing.presence.color.clone(), None, false),
            Some(existing) => {
                let resumed = existing.presence.disconnected;
                let color = if resumed {
                    existing.presence.color.clone()
                } else {
                    self.allocate_color(rng)
                };
                (color, Some(existing.conn), resumed)
            }
            None => (self.allocate_color(rng), None, false),
        };

        self.users.insert(
            uuid.to_string(),
            PresenceEntry {
                presence: UserPresence {
                    uuid: uuid.to_string(),
                    name: name.to_string(),
                    color: color.clone(),
                    disconnected: false,
                    disconnected_at: None,
                },
                conn,
            },
        );

        Binding { color, evicted, resumed }
    }

    /// Mark the identity held by `conn` as disconnected. Returns its uuid.
    pub fn depart(&mut self, conn: ConnId, at: DateTime<Utc>) -> Option<String> {
        let entry = self
            .users
            .values_mut()
            .find(|e| e.conn == conn && !e.presence.disconnected)?;
        entry.presence.disconnected = true;
        entry.presence.disconnected_at = Some(at);
        Some(entry.presence.uuid.clone())
    }

    /// Drop `uuid` if it is still the disconnected entry left behind by `conn`.
    /// A reconnect in the meantime rebinds the entry and makes this a no-op.
    pub fn evict(&mut self, uuid: &str, conn: ConnId) -> bool {
        let stale = self
            .users
            .get(uuid)
            .is_some_and(|e| e.conn == conn && e.presence.disconnected);
        if stale {
            self.users.remove(uuid);
        }
        stale
    }

    /// Pick a color: one nobody holds, else one only disconnected users hold,
    /// else any.
    pub fn allocate_color<R: Rng>(&self, rng: &mut R) -> String {
        let mut active = HashSet::new();
        let mut idle = HashSet::new();
        for entry in self.users.values() {
            if entry.presence.disconnected {
                idle.insert(entry.presence.color.as_str());
            } else {
                active.insert(entry.presence.color.as_str());
            }
        }

        let free: Vec<&str> = COLOR_PALETTE
            .iter()
            .copied()
            .filter(|c| !active.contains(c) && !idle.contains(c))
            .collect();
        let reclaimable: Vec<&str> = COLOR_PALETTE
            .iter()
            .copied()
            .filter(|c| !active.contains(c))
            .collect();

        let pool: &[&str] = if !free.is_empty() {
            &free
        } else if !reclaimable.is_empty() {
            &reclaimable
        } else {
            &COLOR_PALETTE
        };
        pool.choose(rng).copied().unwrap_or(COLOR_PALETTE[0]).to_string()
    }

    /// Everyone known, connected or within grace. Ordered by uuid.
    pub fn user_list(&self) -> BTreeMap<String, UserPresence> {
        self.users
            .iter()
            .map(|(uuid, e)| (uuid.clone(), e.presence.clone()))
            .collect()
    }

    /// uuid -> name, as stored with document snapshots.
    pub fn names(&self) -> HashMap<String, String> {
        self.users
            .iter()
            .map(|(uuid, e)| (uuid.clone(), e.presence.name.clone()))
            .collect()
    }

    /// Take display names from a snapshot written elsewhere for users we know.
    pub fn refresh_names(&mut self, names: &HashMap<String, String>) -> bool {
        let mut changed = false;
        for (uuid, name) in names {
            if let Some(entry) = self.users.get_mut(uuid) {
                if !name.is_empty() && entry.presence.name != *name {
                    entry.presence.name = name.clone();
                    changed = true;
                }
            }
        }
        changed
    }
}
