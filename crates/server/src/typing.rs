use std::collections::HashMap;

use huddle_core::{ChannelId, TypingUser};
use tokio::sync::Mutex;
use uuid::Uuid;

struct Typist {
    user_name: String,
    /// Connections of this user currently typing in the channel.
    connections: usize,
    order: u64,
}

/// Who is composing in which channel, keyed by `(channel, user)`.
#[derive(Default)]
pub struct TypingTracker {
    state: Mutex<TypingState>,
}

#[derive(Default)]
struct TypingState {
    channels: HashMap<ChannelId, HashMap<Uuid, Typist>>,
    next_order: u64,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one more typing connection for the user; returns the channel's typists.
    pub async fn start(&self, channel: ChannelId, user_id: Uuid, user_name: &str) -> Vec<TypingUser> {
        let mut state = self.state.lock().await;
        let order = state.next_order;
        state.next_order += 1;
        let typists = state.channels.entry(channel).or_default();
        let typist = typists.entry(user_id).or_insert_with(|| Typist {
            user_name: user_name.to_string(),
            connections: 0,
            order,
        });
        typist.connections += 1;
        snapshot(typists)
    }

    /// Releases one typing connection. Returns `None` if the user was not
    /// typing there, otherwise the typists that remain.
    pub async fn stop(&self, channel: ChannelId, user_id: Uuid) -> Option<Vec<TypingUser>> {
        let mut state = self.state.lock().await;
        let typists = state.channels.get_mut(&channel)?;
        let typist = typists.get_mut(&user_id)?;
        typist.connections = typist.connections.saturating_sub(1);
        if typist.connections == 0 {
            typists.remove(&user_id);
        }
        let remaining = snapshot(typists);
        if typists.is_empty() {
            state.channels.remove(&channel);
        }
        Some(remaining)
    }

    #[cfg(test)]
    pub async fn current(&self, channel: ChannelId) -> Vec<TypingUser> {
        self.state
            .lock()
            .await
            .channels
            .get(&channel)
            .map(snapshot)
            .unwrap_or_default()
    }

    pub async fn clear_channel(&self, channel: ChannelId) {
        self.state.lock().await.channels.remove(&channel);
    }
}

fn snapshot(typists: &HashMap<Uuid, Typist>) -> Vec<TypingUser> {
    let mut ordered: Vec<_> = typists.iter().collect();
    ordered.sort_by_key(|(_, typist)| typist.order);
    ordered
        .into_iter()
        .map(|(user_id, typist)| TypingUser {
            user_id: *user_id,
            user_name: typist.user_name.clone(),
        })
        .collect()
}
