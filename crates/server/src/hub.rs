//! Fan-out hub: live connections, their outbound queues and channel rooms.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use huddle_core::{identity::Identity, ChannelId, ServerEvent};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    RwLock,
};
use uuid::Uuid;

pub type Outbound = Arc<ServerEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct ConnectionHandle {
    identity: Identity,
    /// `None` once the connection was evicted for not draining its queue.
    sender: Option<mpsc::Sender<Outbound>>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    rooms: HashMap<ChannelId, HashSet<ConnectionId>>,
}

impl HubState {
    fn fan_out<'a>(
        &self,
        targets: impl IntoIterator<Item = &'a ConnectionId>,
        event: &Outbound,
    ) -> (usize, Vec<ConnectionId>) {
        let mut delivered = 0;
        let mut stalled = Vec::new();
        for id in targets {
            let Some(sender) = self
                .connections
                .get(id)
                .and_then(|handle| handle.sender.as_ref())
            else {
                continue;
            };
            match sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(connection_id = %id, "outbound queue full; evicting connection");
                    stalled.push(*id);
                }
                Err(TrySendError::Closed(_)) => stalled.push(*id),
            }
        }
        (delivered, stalled)
    }
}

#[derive(Default)]
pub struct Hub {
    state: RwLock<HubState>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, id: ConnectionId, identity: Identity, sender: mpsc::Sender<Outbound>) {
        self.state.write().await.connections.insert(
            id,
            ConnectionHandle {
                identity,
                sender: Some(sender),
            },
        );
    }

    /// Forgets the connection and returns the rooms it was subscribed to.
    pub async fn detach(&self, id: ConnectionId) -> Vec<ChannelId> {
        let mut state = self.state.write().await;
        state.connections.remove(&id);
        let mut left = Vec::new();
        state.rooms.retain(|channel, members| {
            if members.remove(&id) {
                left.push(channel.clone());
            }
            !members.is_empty()
        });
        left
    }

    /// Returns false when the connection was already subscribed.
    pub async fn join(&self, id: ConnectionId, channel: &ChannelId) -> bool {
        let mut state = self.state.write().await;
        if !state.connections.contains_key(&id) {
            return false;
        }
        state.rooms.entry(channel.clone()).or_default().insert(id)
    }

    pub async fn leave(&self, id: ConnectionId, channel: &ChannelId) -> bool {
        let mut state = self.state.write().await;
        let Some(members) = state.rooms.get_mut(channel) else {
            return false;
        };
        let removed = members.remove(&id);
        if members.is_empty() {
            state.rooms.remove(channel);
        }
        removed
    }

    pub async fn is_subscribed(&self, id: ConnectionId, channel: &ChannelId) -> bool {
        self.state
            .read()
            .await
            .rooms
            .get(channel)
            .is_some_and(|members| members.contains(&id))
    }

    /// Drops the room of a deleted channel.
    pub async fn dissolve(&self, channel: &ChannelId) {
        self.state.write().await.rooms.remove(channel);
    }

    /// Number of distinct users subscribed to the channel. Evicted
    /// connections no longer count.
    pub async fn occupancy(&self, channel: &ChannelId) -> usize {
        let state = self.state.read().await;
        state
            .rooms
            .get(channel)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|id| state.connections.get(id))
                    .filter(|handle| handle.sender.is_some())
                    .map(|handle| handle.identity.user_id)
                    .collect::<HashSet<_>>()
                    .len()
            })
            .unwrap_or(0)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn send_to(&self, id: ConnectionId, event: ServerEvent) -> bool {
        let event = Arc::new(event);
        let (delivered, stalled) = self.state.read().await.fan_out([&id], &event);
        self.evict(stalled).await;
        delivered == 1
    }

    /// Delivers to every connection of the user.
    pub async fn send_to_user(&self, user_id: Uuid, event: ServerEvent) -> usize {
        self.send_where(|identity| identity.user_id == user_id, event)
            .await
    }

    pub async fn send_where<F>(&self, predicate: F, event: ServerEvent) -> usize
    where
        F: Fn(&Identity) -> bool,
    {
        let event = Arc::new(event);
        let (delivered, stalled) = {
            let state = self.state.read().await;
            let targets: Vec<&ConnectionId> = state
                .connections
                .iter()
                .filter(|(_, handle)| predicate(&handle.identity))
                .map(|(id, _)| id)
                .collect();
            state.fan_out(targets, &event)
        };
        self.evict(stalled).await;
        delivered
    }

    pub async fn broadcast(
        &self,
        channel: &ChannelId,
        event: ServerEvent,
        except: Option<ConnectionId>,
    ) -> usize {
        self.broadcast_rooms(std::slice::from_ref(channel), event, except)
            .await
    }

    /// One delivery per connection across all the given rooms.
    pub async fn broadcast_rooms(
        &self,
        channels: &[ChannelId],
        event: ServerEvent,
        except: Option<ConnectionId>,
    ) -> usize {
        let event = Arc::new(event);
        let (delivered, stalled) = {
            let state = self.state.read().await;
            let targets: HashSet<&ConnectionId> = channels
                .iter()
                .filter_map(|channel| state.rooms.get(channel))
                .flatten()
                .filter(|id| Some(**id) != except)
                .collect();
            state.fan_out(targets, &event)
        };
        self.evict(stalled).await;
        delivered
    }

    /// Room broadcast skipping every connection of `user_id`.
    pub async fn broadcast_to_others(
        &self,
        channel: &ChannelId,
        event: ServerEvent,
        user_id: Uuid,
    ) -> usize {
        let event = Arc::new(event);
        let (delivered, stalled) = {
            let state = self.state.read().await;
            let targets: Vec<&ConnectionId> = state
                .rooms
                .get(channel)
                .into_iter()
                .flatten()
                .filter(|id| {
                    state
                        .connections
                        .get(*id)
                        .is_some_and(|handle| handle.identity.user_id != user_id)
                })
                .collect();
            state.fan_out(targets, &event)
        };
        self.evict(stalled).await;
        delivered
    }

    pub async fn broadcast_all(&self, event: ServerEvent) -> usize {
        self.send_where(|_| true, event).await
    }

    async fn evict(&self, stalled: Vec<ConnectionId>) {
        if stalled.is_empty() {
            return;
        }
        let mut state = self.state.write().await;
        for id in stalled {
            if let Some(handle) = state.connections.get_mut(&id) {
                handle.sender = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::identity::Role;

    fn person(name: &str) -> Identity {
        Identity::new(Uuid::new_v4(), name, Role::Member, None)
    }

    async fn connect(hub: &Hub, identity: &Identity, buffer: usize) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(buffer);
        hub.attach(id, identity.clone(), tx).await;
        (id, rx)
    }

    #[tokio::test]
    async fn broadcast_reaches_room_members_only() {
        let hub = Hub::new();
        let channel = ChannelId::General;
        let (a, mut rx_a) = connect(&hub, &person("a"), 8).await;
        let (b, mut rx_b) = connect(&hub, &person("b"), 8).await;
        let (_c, mut rx_c) = connect(&hub, &person("c"), 8).await;

        assert!(hub.join(a, &channel).await);
        assert!(!hub.join(a, &channel).await);
        assert!(hub.join(b, &channel).await);

        let delivered = hub
            .broadcast(&channel, ServerEvent::info("hello"), Some(a))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(*rx_b.recv().await.unwrap(), ServerEvent::info("hello"));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn occupancy_counts_distinct_users() {
        let hub = Hub::new();
        let channel = ChannelId::Stored(Uuid::new_v4());
        let ana = person("ana");
        let (phone, _rx1) = connect(&hub, &ana, 8).await;
        let (laptop, _rx2) = connect(&hub, &ana, 8).await;
        let (other, _rx3) = connect(&hub, &person("bo"), 8).await;
        for id in [phone, laptop, other] {
            hub.join(id, &channel).await;
        }

        assert_eq!(hub.occupancy(&channel).await, 2);
        assert_eq!(hub.send_to_user(ana.user_id, ServerEvent::info("hi")).await, 2);
    }

    #[tokio::test]
    async fn detach_reports_rooms_and_cleans_up() {
        let hub = Hub::new();
        let first = ChannelId::General;
        let second = ChannelId::Stored(Uuid::new_v4());
        let (id, _rx) = connect(&hub, &person("a"), 8).await;
        hub.join(id, &first).await;
        hub.join(id, &second).await;

        let mut rooms = hub.detach(id).await;
        rooms.sort_by_key(|channel| channel.to_string());
        assert_eq!(rooms.len(), 2);
        assert_eq!(hub.occupancy(&first).await, 0);
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn stalled_connection_is_evicted() {
        let hub = Hub::new();
        let (id, mut rx) = connect(&hub, &person("slow"), 1).await;

        assert!(hub.send_to(id, ServerEvent::info("one")).await);
        assert!(!hub.send_to(id, ServerEvent::info("two")).await);

        // The queued event is still readable, then the queue reports closure.
        assert_eq!(*rx.recv().await.unwrap(), ServerEvent::info("one"));
        assert!(rx.recv().await.is_none());
        assert!(!hub.send_to(id, ServerEvent::info("three")).await);
    }

    #[tokio::test]
    async fn evicted_connections_leave_occupancy() {
        let hub = Hub::new();
        let channel = ChannelId::General;
        let (slow, _rx_slow) = connect(&hub, &person("slow"), 1).await;
        let (steady, _rx) = connect(&hub, &person("steady"), 8).await;
        hub.join(slow, &channel).await;
        hub.join(steady, &channel).await;
        assert_eq!(hub.occupancy(&channel).await, 2);

        hub.send_to(slow, ServerEvent::info("one")).await;
        hub.send_to(slow, ServerEvent::info("two")).await;
        assert_eq!(hub.occupancy(&channel).await, 1);
    }

    #[tokio::test]
    async fn broadcast_to_others_skips_all_devices_of_the_user() {
        let hub = Hub::new();
        let channel = ChannelId::General;
        let ana = person("ana");
        let (phone, mut rx_phone) = connect(&hub, &ana, 8).await;
        let (laptop, mut rx_laptop) = connect(&hub, &ana, 8).await;
        let (bo, mut rx_bo) = connect(&hub, &person("bo"), 8).await;
        for id in [phone, laptop, bo] {
            hub.join(id, &channel).await;
        }

        let delivered = hub
            .broadcast_to_others(&channel, ServerEvent::info("typing"), ana.user_id)
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(*rx_bo.recv().await.unwrap(), ServerEvent::info("typing"));
        assert!(rx_phone.try_recv().is_err());
        assert!(rx_laptop.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_rooms_delivers_once_per_connection() {
        let hub = Hub::new();
        let first = ChannelId::General;
        let second = ChannelId::Stored(Uuid::new_v4());
        let (id, mut rx) = connect(&hub, &person("a"), 8).await;
        hub.join(id, &first).await;
        hub.join(id, &second).await;

        let delivered = hub
            .broadcast_rooms(&[first, second], ServerEvent::info("x"), None)
            .await;
        assert_eq!(delivered, 1);
        rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
