//! Process-wide table of online users, reference-counted per connection.

use std::collections::{HashMap, HashSet};

use huddle_core::identity::Identity;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::hub::ConnectionId;

struct PresenceEntry {
    identity: Identity,
    connections: HashSet<ConnectionId>,
}

#[derive(Default)]
pub struct PresenceRegistry {
    entries: RwLock<HashMap<Uuid, PresenceEntry>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a connection for the user and refreshes the stored metadata.
    /// Returns true when this is the user's first live connection.
    pub async fn register(&self, identity: &Identity, connection: ConnectionId) -> bool {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(identity.user_id)
            .or_insert_with(|| PresenceEntry {
                identity: identity.clone(),
                connections: HashSet::new(),
            });
        entry.identity = identity.clone();
        entry.connections.insert(connection);
        entry.connections.len() == 1
    }

    /// Drops one connection. Returns true when the user has no connections left.
    pub async fn remove(&self, user_id: Uuid, connection: ConnectionId) -> bool {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(&user_id) else {
            return false;
        };
        if !entry.connections.remove(&connection) {
            return false;
        }
        if entry.connections.is_empty() {
            entries.remove(&user_id);
            return true;
        }
        false
    }

    /// Live metadata for an online user, or the "Unknown User" descriptor.
    pub async fn lookup(&self, user_id: Uuid) -> Identity {
        self.entries
            .read()
            .await
            .get(&user_id)
            .map(|entry| entry.identity.clone())
            .unwrap_or_else(|| Identity::unknown(user_id))
    }

    #[cfg(test)]
    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.entries.read().await.contains_key(&user_id)
    }

    pub async fn online_users(&self) -> HashSet<Uuid> {
        self.entries.read().await.keys().copied().collect()
    }
}
