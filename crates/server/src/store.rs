use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use huddle_core::{
    channel::{Channel, ChannelId},
    identity::Identity,
    message::{Message, MessageMutation, MutationOutcome, ReadReceipt},
};
use huddle_storage::{ChatRepository, CreateChannelError, StoragePool};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::ChatError;

/// Durable channels and messages. Message mutations are applied atomically
/// per message.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Persisted channels the viewer may see, oldest first.
    async fn list_accessible_channels(&self, viewer: &Identity) -> Result<Vec<Channel>, ChatError>;
    async fn direct_channels_of(&self, user_id: Uuid) -> Result<Vec<Channel>, ChatError>;
    async fn insert_channel(&self, channel: &Channel) -> Result<(), ChatError>;
    async fn find_channel(&self, id: Uuid) -> Result<Option<Channel>, ChatError>;
    async fn find_channel_by_name(&self, name: &str) -> Result<Option<Channel>, ChatError>;
    async fn add_channel_member(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Channel>, ChatError>;
    async fn delete_channel(&self, id: Uuid) -> Result<bool, ChatError>;
    async fn insert_message(&self, message: &Message) -> Result<(), ChatError>;
    async fn find_message(&self, id: Uuid) -> Result<Option<Message>, ChatError>;
    /// Newest `limit` non-deleted messages, oldest first.
    async fn recent_messages(
        &self,
        channel: ChannelId,
        limit: usize,
    ) -> Result<Vec<Message>, ChatError>;
    async fn mutate_message(
        &self,
        id: Uuid,
        mutation: &MessageMutation,
        at: DateTime<Utc>,
    ) -> Result<Option<MutationOutcome>, ChatError>;
    /// Bulk read receipt for everything the reader did not send.
    async fn mark_channel_read(
        &self,
        channel: ChannelId,
        receipt: &ReadReceipt,
    ) -> Result<u64, ChatError>;
    async fn clear_messages(&self, channel: ChannelId) -> Result<u64, ChatError>;
}

#[async_trait]
impl ChatStore for ChatRepository {
    async fn list_accessible_channels(&self, viewer: &Identity) -> Result<Vec<Channel>, ChatError> {
        Ok(ChatRepository::list_accessible_channels(self, viewer).await?)
    }

    async fn direct_channels_of(&self, user_id: Uuid) -> Result<Vec<Channel>, ChatError> {
        Ok(ChatRepository::direct_channels_of(self, user_id).await?)
    }

    async fn insert_channel(&self, channel: &Channel) -> Result<(), ChatError> {
        ChatRepository::insert_channel(self, channel)
            .await
            .map_err(|err| match err {
                CreateChannelError::NameTaken => name_taken(&channel.name),
                CreateChannelError::Other(err) => ChatError::Transient(err),
            })
    }

    async fn find_channel(&self, id: Uuid) -> Result<Option<Channel>, ChatError> {
        Ok(ChatRepository::find_channel(self, id).await?)
    }

    async fn find_channel_by_name(&self, name: &str) -> Result<Option<Channel>, ChatError> {
        Ok(ChatRepository::find_channel_by_name(self, name).await?)
    }

    async fn add_channel_member(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Channel>, ChatError> {
        Ok(ChatRepository::add_channel_member(self, id, user_id).await?)
    }

    async fn delete_channel(&self, id: Uuid) -> Result<bool, ChatError> {
        Ok(ChatRepository::delete_channel(self, id).await?)
    }

    async fn insert_message(&self, message: &Message) -> Result<(), ChatError> {
        Ok(ChatRepository::insert_message(self, message).await?)
    }

    async fn find_message(&self, id: Uuid) -> Result<Option<Message>, ChatError> {
        Ok(ChatRepository::find_message(self, id).await?)
    }

    async fn recent_messages(
        &self,
        channel: ChannelId,
        limit: usize,
    ) -> Result<Vec<Message>, ChatError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Ok(ChatRepository::recent_messages(self, channel, limit).await?)
    }

    async fn mutate_message(
        &self,
        id: Uuid,
        mutation: &MessageMutation,
        at: DateTime<Utc>,
    ) -> Result<Option<MutationOutcome>, ChatError> {
        Ok(ChatRepository::mutate_message(self, id, mutation, at).await?)
    }

    async fn mark_channel_read(
        &self,
        channel: ChannelId,
        receipt: &ReadReceipt,
    ) -> Result<u64, ChatError> {
        Ok(ChatRepository::mark_channel_read(self, channel, receipt).await?)
    }

    async fn clear_messages(&self, channel: ChannelId) -> Result<u64, ChatError> {
        Ok(ChatRepository::clear_messages(self, channel).await?)
    }
}

fn name_taken(name: &str) -> ChatError {
    ChatError::Conflict(format!("channel '{name}' already exists"))
}

#[derive(Default)]
struct ChatTables {
    channels: HashMap<Uuid, Channel>,
    /// Messages per channel in send order.
    messages: HashMap<ChannelId, Vec<Message>>,
    message_index: HashMap<Uuid, ChannelId>,
}

impl ChatTables {
    fn message_mut(&mut self, id: Uuid) -> Option<&mut Message> {
        let channel = self.message_index.get(&id)?;
        self.messages
            .get_mut(channel)?
            .iter_mut()
            .find(|message| message.id == id)
    }

    fn drop_messages(&mut self, channel: ChannelId) -> u64 {
        let removed = self.messages.remove(&channel).unwrap_or_default();
        for message in &removed {
            self.message_index.remove(&message.id);
        }
        removed.len() as u64
    }
}

/// Store used when no database is configured. One lock guards every table.
#[derive(Default)]
pub struct InMemoryChatStore {
    tables: RwLock<ChatTables>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn list_accessible_channels(&self, viewer: &Identity) -> Result<Vec<Channel>, ChatError> {
        let mut channels: Vec<_> = self
            .tables
            .read()
            .await
            .channels
            .values()
            .filter(|channel| channel.admits(viewer))
            .cloned()
            .collect();
        channels.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(channels)
    }

    async fn direct_channels_of(&self, user_id: Uuid) -> Result<Vec<Channel>, ChatError> {
        Ok(self
            .tables
            .read()
            .await
            .channels
            .values()
            .filter(|channel| channel.is_direct() && channel.is_member(user_id))
            .cloned()
            .collect())
    }

    async fn insert_channel(&self, channel: &Channel) -> Result<(), ChatError> {
        let id = channel
            .id
            .stored()
            .ok_or_else(|| ChatError::invalid("the general channel is not persisted"))?;
        let mut tables = self.tables.write().await;
        if tables
            .channels
            .values()
            .any(|existing| existing.name.eq_ignore_ascii_case(&channel.name))
        {
            return Err(name_taken(&channel.name));
        }
        tables.channels.insert(id, channel.clone());
        Ok(())
    }

    async fn find_channel(&self, id: Uuid) -> Result<Option<Channel>, ChatError> {
        Ok(self.tables.read().await.channels.get(&id).cloned())
    }

    async fn find_channel_by_name(&self, name: &str) -> Result<Option<Channel>, ChatError> {
        Ok(self
            .tables
            .read()
            .await
            .channels
            .values()
            .find(|channel| channel.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn add_channel_member(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Channel>, ChatError> {
        let mut tables = self.tables.write().await;
        let Some(channel) = tables.channels.get_mut(&id) else {
            return Ok(None);
        };
        if !matches!(
            channel.kind(),
            huddle_core::ChannelKind::Private | huddle_core::ChannelKind::Team
        ) {
            return Ok(None);
        }
        channel.add_member(user_id);
        Ok(Some(channel.clone()))
    }

    async fn delete_channel(&self, id: Uuid) -> Result<bool, ChatError> {
        let mut tables = self.tables.write().await;
        tables.drop_messages(ChannelId::Stored(id));
        Ok(tables.channels.remove(&id).is_some())
    }

    async fn insert_message(&self, message: &Message) -> Result<(), ChatError> {
        let mut tables = self.tables.write().await;
        tables.message_index.insert(message.id, message.channel_id);
        tables
            .messages
            .entry(message.channel_id)
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn find_message(&self, id: Uuid) -> Result<Option<Message>, ChatError> {
        let tables = self.tables.read().await;
        let Some(channel) = tables.message_index.get(&id) else {
            return Ok(None);
        };
        Ok(tables
            .messages
            .get(channel)
            .and_then(|messages| messages.iter().find(|message| message.id == id))
            .cloned())
    }

    async fn recent_messages(
        &self,
        channel: ChannelId,
        limit: usize,
    ) -> Result<Vec<Message>, ChatError> {
        let tables = self.tables.read().await;
        let mut recent: Vec<Message> = tables
            .messages
            .get(&channel)
            .map(|messages| {
                messages
                    .iter()
                    .rev()
                    .filter(|message| !message.deleted)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        recent.reverse();
        Ok(recent)
    }

    async fn mutate_message(
        &self,
        id: Uuid,
        mutation: &MessageMutation,
        at: DateTime<Utc>,
    ) -> Result<Option<MutationOutcome>, ChatError> {
        let mut tables = self.tables.write().await;
        let Some(message) = tables.message_mut(id) else {
            return Ok(None);
        };
        let change = mutation.apply(message, at);
        Ok(Some(MutationOutcome {
            message: message.clone(),
            change,
        }))
    }

    async fn mark_channel_read(
        &self,
        channel: ChannelId,
        receipt: &ReadReceipt,
    ) -> Result<u64, ChatError> {
        let mut tables = self.tables.write().await;
        let Some(messages) = tables.messages.get_mut(&channel) else {
            return Ok(0);
        };
        let mut touched = 0;
        for message in messages.iter_mut() {
            if message.deleted || message.sender_id == receipt.user_id {
                continue;
            }
            if MessageMutation::MarkRead(receipt.clone())
                .apply(message, receipt.read_at)
                .is_change()
            {
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn clear_messages(&self, channel: ChannelId) -> Result<u64, ChatError> {
        Ok(self.tables.write().await.drop_messages(channel))
    }
}

/// Picks the Postgres-backed store when a pool is available.
pub fn chat_store(pool: Option<StoragePool>) -> Arc<dyn ChatStore> {
    match pool {
        Some(pool) => {
            let repository: Arc<dyn ChatStore> = ChatRepository::new(pool);
            repository
        }
        None => Arc::new(InMemoryChatStore::new()),
    }
}
