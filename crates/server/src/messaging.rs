use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::Utc;
use huddle_core::{
    channel::{Channel, ChannelId},
    event::{CreateChannelPayload, MessageRef, OutgoingMessage},
    identity::Identity,
    message::{Message, MessageContent, MessageDraft, MessageMutation, ReadReceipt},
    ClientEvent, DirectUserSummary, MessageView, PresenceStatus, ReadUpdate, ServerEvent,
    UserSummary,
};
use huddle_storage::UserRecord;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    config::GatewayConfig,
    directory::ChannelDirectory,
    error::ChatError,
    hub::{ConnectionId, Hub, Outbound},
    presence::PresenceRegistry,
    store::ChatStore,
    typing::TypingTracker,
    users::UserDirectory,
};

/// Per-connection state, owned by the connection task.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub identity: Identity,
    typing: HashSet<ChannelId>,
}

impl Connection {
    pub fn new(identity: Identity) -> Self {
        Self {
            id: ConnectionId::new(),
            identity,
            typing: HashSet::new(),
        }
    }

    fn user_id(&self) -> Uuid {
        self.identity.user_id
    }
}

/// The message engine: applies client operations to the store and fans the
/// results out through the hub.
pub struct MessagingService {
    store: Arc<dyn ChatStore>,
    directory: ChannelDirectory,
    users: Arc<dyn UserDirectory>,
    hub: Arc<Hub>,
    presence: Arc<PresenceRegistry>,
    typing: Arc<TypingTracker>,
    history_limit: usize,
    max_message_length: usize,
}

impl MessagingService {
    pub fn new(
        store: Arc<dyn ChatStore>,
        users: Arc<dyn UserDirectory>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            directory: ChannelDirectory::new(store.clone(), users.clone()),
            store,
            users,
            hub: Arc::new(Hub::new()),
            presence: Arc::new(PresenceRegistry::new()),
            typing: Arc::new(TypingTracker::new()),
            history_limit: config.history_limit,
            max_message_length: config.max_message_length,
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.presence
    }

    /// Attaches an authenticated connection, greets it and announces the
    /// user when this is their first connection.
    pub async fn connect(&self, conn: &Connection, sender: mpsc::Sender<Outbound>) {
        self.hub
            .attach(conn.id, conn.identity.clone(), sender)
            .await;
        self.hub
            .send_to(
                conn.id,
                ServerEvent::Ready {
                    user: conn.identity.clone(),
                },
            )
            .await;
        if self.presence.register(&conn.identity, conn.id).await {
            self.hub
                .broadcast_all(ServerEvent::UserStatus {
                    user_id: conn.user_id(),
                    status: PresenceStatus::Online,
                    last_seen: Utc::now(),
                })
                .await;
        }
    }

    /// Tears the connection down. Offline status goes to the rooms it was in,
    /// and only when the user has no other connection.
    pub async fn disconnect(&self, mut conn: Connection) {
        for channel in std::mem::take(&mut conn.typing) {
            self.release_typing(&conn, channel).await;
        }
        let rooms = self.hub.detach(conn.id).await;
        if self.presence.remove(conn.user_id(), conn.id).await {
            self.hub
                .broadcast_rooms(
                    &rooms,
                    ServerEvent::UserStatus {
                        user_id: conn.user_id(),
                        status: PresenceStatus::Offline,
                        last_seen: Utc::now(),
                    },
                    None,
                )
                .await;
            debug!(user_id = %conn.user_id(), rooms = rooms.len(), "user went offline");
        }
    }

    pub async fn handle(&self, conn: &mut Connection, event: ClientEvent) -> Result<(), ChatError> {
        match event {
            ClientEvent::GetChannels | ClientEvent::ChannelsRefresh => self.list_channels(conn).await,
            ClientEvent::CreateChannel(payload) => self.create_channel(conn, payload).await,
            ClientEvent::JoinChannel(target) => self.join_channel(conn, target.as_str()).await,
            ClientEvent::LeaveChannel { channel_id } => self.leave_channel(conn, &channel_id).await,
            ClientEvent::SendMessage {
                channel_id,
                message,
            } => self.send_message(conn, &channel_id, message).await,
            ClientEvent::ForwardMessage {
                target_channel_id,
                message,
            } => self.forward_message(conn, &target_channel_id, message).await,
            ClientEvent::EditMessage {
                channel_id,
                message_id,
                new_text,
            } => {
                self.edit_message(conn, &channel_id, message_id, new_text)
                    .await
            }
            ClientEvent::DeleteMessage {
                channel_id,
                message_id,
            } => self.delete_message(conn, &channel_id, message_id).await,
            ClientEvent::SendReaction {
                channel_id,
                message_id,
                emoji,
            } => self.react(conn, &channel_id, message_id, &emoji).await,
            ClientEvent::MarkRead {
                channel_id,
                message_id,
            } => self.mark_read(conn, &channel_id, message_id).await,
            ClientEvent::DeleteChannel { channel_id } => self.delete_channel(conn, &channel_id).await,
            ClientEvent::DeleteDirectMessage { channel_id } => {
                self.delete_direct_message(conn, &channel_id).await
            }
            ClientEvent::ClearChatHistory { channel_id } => {
                self.clear_history(conn, &channel_id).await
            }
            ClientEvent::TypingStart { channel_id } => self.typing_start(conn, &channel_id).await,
            ClientEvent::TypingStop { channel_id } => self.typing_stop(conn, &channel_id).await,
            ClientEvent::GetUsers => self.list_users(conn).await,
            ClientEvent::GetDirectUsers => self.list_direct_users(conn).await,
            ClientEvent::CreateDirectMessage { target_user_id, .. } => {
                self.create_direct_message(conn, target_user_id).await
            }
            ClientEvent::InviteUserToChannel {
                channel_id,
                user_email,
                ..
            } => self.invite_user(conn, &channel_id, &user_email).await,
            ClientEvent::ChannelRefresh { channel_id } => {
                self.refresh_channel(conn, &channel_id).await
            }
        }
    }

    pub async fn list_channels(&self, conn: &Connection) -> Result<(), ChatError> {
        let channels = self.directory.list_accessible(&conn.identity).await?;
        self.reply(conn, ServerEvent::ChannelsList { channels }).await;
        Ok(())
    }

    pub async fn create_channel(
        &self,
        conn: &Connection,
        payload: CreateChannelPayload,
    ) -> Result<(), ChatError> {
        let channel = self
            .directory
            .create(&conn.identity, payload, Utc::now())
            .await?;
        info!(
            channel_id = %channel.id,
            name = %channel.name,
            kind = channel.kind().as_str(),
            user_id = %conn.user_id(),
            "channel created"
        );
        let audience = channel.clone();
        self.hub
            .send_where(
                |identity| audience.admits(identity),
                ServerEvent::ChannelCreated { channel },
            )
            .await;
        Ok(())
    }

    pub async fn join_channel(&self, conn: &Connection, reference: &str) -> Result<(), ChatError> {
        let channel = self.directory.open(reference, &conn.identity).await?;
        let newly_joined = self.hub.join(conn.id, &channel.id).await;
        let channel_id = channel.id;
        if let Err(err) = self.send_snapshot(conn, channel).await {
            // A failed snapshot must not leave the connection in the room.
            if newly_joined {
                self.hub.leave(conn.id, &channel_id).await;
            }
            return Err(err);
        }
        if newly_joined {
            self.hub
                .broadcast(
                    &channel_id,
                    ServerEvent::UserJoined {
                        channel_id,
                        user_id: conn.user_id(),
                        user_name: conn.identity.user_name.clone(),
                    },
                    Some(conn.id),
                )
                .await;
        }
        Ok(())
    }

    pub async fn refresh_channel(&self, conn: &Connection, reference: &str) -> Result<(), ChatError> {
        let channel = self.directory.open(reference, &conn.identity).await?;
        self.send_snapshot(conn, channel).await
    }

    /// Marks the backlog read for the caller and delivers channel plus history.
    async fn send_snapshot(&self, conn: &Connection, channel: Channel) -> Result<(), ChatError> {
        let receipt = ReadReceipt::new(&conn.identity, Utc::now());
        self.store.mark_channel_read(channel.id, &receipt).await?;
        let history = self
            .store
            .recent_messages(channel.id, self.history_limit)
            .await?;
        let member_count = self.member_count(&channel).await?;
        let history = history
            .into_iter()
            .map(|message| MessageView::new(message, member_count))
            .collect();
        self.reply(conn, ServerEvent::ChannelJoined { channel, history })
            .await;
        Ok(())
    }

    pub async fn leave_channel(&self, conn: &mut Connection, reference: &str) -> Result<(), ChatError> {
        let channel = self.directory.resolve(reference).await?;
        self.hub.leave(conn.id, &channel.id).await;
        if conn.typing.remove(&channel.id) {
            self.release_typing(conn, channel.id).await;
        }
        Ok(())
    }

    pub async fn send_message(
        &self,
        conn: &mut Connection,
        reference: &str,
        outgoing: OutgoingMessage,
    ) -> Result<(), ChatError> {
        let channel = self.directory.open(reference, &conn.identity).await?;
        let content = outgoing.content();
        let mut draft = MessageDraft::new(outgoing.text, content, self.max_message_length)?;
        if let Some(MessageRef { id }) = outgoing.reply_to {
            let replied = self.live_message_in(&channel, id).await?;
            draft = draft.replying_to(replied.reply_snapshot());
        }

        let message = Message::compose(channel.id, &conn.identity, draft, Utc::now());
        self.store.insert_message(&message).await?;
        debug!(message_id = %message.id, channel_id = %channel.id, "message stored");

        if conn.typing.remove(&channel.id) {
            self.release_typing(conn, channel.id).await;
        }
        self.deliver(conn, &channel, message).await
    }

    pub async fn forward_message(
        &self,
        conn: &Connection,
        target_reference: &str,
        original: MessageRef,
    ) -> Result<(), ChatError> {
        let original = self
            .store
            .find_message(original.id)
            .await?
            .filter(|message| !message.deleted)
            .ok_or_else(|| ChatError::not_found("message not found"))?;
        let source = self
            .directory
            .find(original.channel_id)
            .await?
            .ok_or_else(|| ChatError::not_found("message not found"))?;
        if !ChannelDirectory::authorize(&source, &conn.identity) {
            return Err(ChatError::forbidden(
                "you do not have access to the original message",
            ));
        }
        let target = self.directory.open(target_reference, &conn.identity).await?;

        let message = Message::forward(&original, target.id, &conn.identity, Utc::now());
        self.store.insert_message(&message).await?;
        self.deliver(conn, &target, message).await
    }

    async fn deliver(&self, conn: &Connection, channel: &Channel, message: Message) -> Result<(), ChatError> {
        let member_count = self.member_count(channel).await?;
        let event = ServerEvent::ReceiveMessage {
            channel_id: channel.id,
            message: MessageView::new(message, member_count),
        };
        self.publish(conn, channel.id, event).await;
        Ok(())
    }

    pub async fn edit_message(
        &self,
        conn: &Connection,
        reference: &str,
        message_id: Uuid,
        new_text: String,
    ) -> Result<(), ChatError> {
        let channel = self.directory.open(reference, &conn.identity).await?;
        let message = self.live_message_in(&channel, message_id).await?;
        self.ensure_author_or_admin(conn, &message, "edit")?;
        let draft = MessageDraft::new(Some(new_text), MessageContent::Text, self.max_message_length)?;

        let outcome = self
            .mutate(
                message_id,
                MessageMutation::Edit {
                    text: draft.text().to_string(),
                },
            )
            .await?;
        if outcome.change.is_change() {
            self.publish(conn, channel.id, ServerEvent::updated(&outcome.message))
                .await;
        }
        Ok(())
    }

    pub async fn delete_message(
        &self,
        conn: &Connection,
        reference: &str,
        message_id: Uuid,
    ) -> Result<(), ChatError> {
        let channel = self.directory.open(reference, &conn.identity).await?;
        let message = self.live_message_in(&channel, message_id).await?;
        self.ensure_author_or_admin(conn, &message, "delete")?;

        let outcome = self.mutate(message_id, MessageMutation::Delete).await?;
        if outcome.change.is_change() {
            self.publish(conn, channel.id, ServerEvent::updated(&outcome.message))
                .await;
        }
        Ok(())
    }

    pub async fn react(
        &self,
        conn: &Connection,
        reference: &str,
        message_id: Uuid,
        emoji: &str,
    ) -> Result<(), ChatError> {
        let emoji = emoji.trim();
        if emoji.is_empty() {
            return Err(ChatError::invalid("emoji must be provided"));
        }
        let channel = self.directory.open(reference, &conn.identity).await?;
        self.live_message_in(&channel, message_id).await?;

        let outcome = self
            .mutate(
                message_id,
                MessageMutation::React {
                    user_id: conn.user_id(),
                    user_name: conn.identity.user_name.clone(),
                    emoji: emoji.to_string(),
                },
            )
            .await?;
        self.publish(
            conn,
            channel.id,
            ServerEvent::ReceiveReaction {
                channel_id: channel.id,
                message_id,
                reactions: outcome.message.reactions,
            },
        )
        .await;
        Ok(())
    }

    pub async fn mark_read(
        &self,
        conn: &Connection,
        reference: &str,
        message_id: Uuid,
    ) -> Result<(), ChatError> {
        let channel = self.directory.open(reference, &conn.identity).await?;
        self.live_message_in(&channel, message_id).await?;

        let receipt = ReadReceipt::new(&conn.identity, Utc::now());
        let read_at = receipt.read_at;
        let outcome = self
            .mutate(message_id, MessageMutation::MarkRead(receipt))
            .await?;
        if !outcome.change.is_change() {
            return Ok(());
        }

        let message = outcome.message;
        let member_count = self.member_count(&channel).await?;
        let update = ReadUpdate {
            channel_id: channel.id,
            message_id,
            user_id: conn.user_id(),
            user_name: conn.identity.user_name.clone(),
            read_at,
            read_count: message.read_count(),
            member_count,
            is_read_by_all: message.is_read_by_all(member_count),
        };
        if message.sender_id != conn.user_id() {
            self.hub
                .send_to_user(message.sender_id, ServerEvent::MessageReadReceipt(update.clone()))
                .await;
        }
        self.hub
            .broadcast(&channel.id, ServerEvent::MessageSeen(update), None)
            .await;
        Ok(())
    }

    pub async fn clear_history(&self, conn: &Connection, reference: &str) -> Result<(), ChatError> {
        let channel = self.directory.resolve(reference).await?;
        let permitted = channel.is_general()
            || channel.is_member(conn.user_id())
            || conn.identity.is_admin();
        if !permitted {
            return Err(ChatError::forbidden(
                "only members or admins can clear this channel",
            ));
        }

        let removed = self.store.clear_messages(channel.id).await?;
        info!(channel_id = %channel.id, removed, user_id = %conn.user_id(), "chat history cleared");
        self.hub
            .broadcast(
                &channel.id,
                ServerEvent::ChatHistoryClearedImmediate {
                    channel_id: channel.id,
                    cleared_by: conn.user_id(),
                },
                None,
            )
            .await;
        self.hub
            .broadcast_all(ServerEvent::ChannelMessagesCleared {
                channel_id: channel.id,
            })
            .await;
        self.reply(conn, ServerEvent::success("chat history cleared"))
            .await;
        Ok(())
    }

    pub async fn delete_channel(&self, conn: &Connection, reference: &str) -> Result<(), ChatError> {
        let channel = self.directory.delete(&conn.identity, reference).await?;
        info!(channel_id = %channel.id, user_id = %conn.user_id(), "channel deleted");
        self.retire_channel(channel.id).await;
        Ok(())
    }

    pub async fn delete_direct_message(
        &self,
        conn: &Connection,
        reference: &str,
    ) -> Result<(), ChatError> {
        let channel = self.directory.delete_direct(&conn.identity, reference).await?;
        info!(channel_id = %channel.id, user_id = %conn.user_id(), "direct conversation deleted");
        for participant in channel.scope.members() {
            self.hub
                .send_to_user(
                    *participant,
                    ServerEvent::DirectMessageDeletedImmediate {
                        channel_id: channel.id,
                        deleted_by: conn.user_id(),
                    },
                )
                .await;
        }
        self.retire_channel(channel.id).await;
        Ok(())
    }

    async fn retire_channel(&self, channel_id: ChannelId) {
        self.hub
            .broadcast_all(ServerEvent::ChannelDeletedImmediate { channel_id })
            .await;
        self.hub.dissolve(&channel_id).await;
        self.typing.clear_channel(channel_id).await;
    }

    pub async fn typing_start(&self, conn: &mut Connection, reference: &str) -> Result<(), ChatError> {
        let channel = self.directory.open(reference, &conn.identity).await?;
        if !conn.typing.insert(channel.id) {
            return Ok(());
        }
        let live = self.presence.lookup(conn.user_id()).await;
        let users = self
            .typing
            .start(channel.id, conn.user_id(), &live.user_name)
            .await;
        self.hub
            .broadcast_to_others(
                &channel.id,
                ServerEvent::UserTyping {
                    channel_id: channel.id,
                    users,
                },
                conn.user_id(),
            )
            .await;
        Ok(())
    }

    pub async fn typing_stop(&self, conn: &mut Connection, reference: &str) -> Result<(), ChatError> {
        let channel = self.directory.resolve(reference).await?;
        if conn.typing.remove(&channel.id) {
            self.release_typing(conn, channel.id).await;
        }
        Ok(())
    }

    async fn release_typing(&self, conn: &Connection, channel_id: ChannelId) {
        let Some(remaining) = self.typing.stop(channel_id, conn.user_id()).await else {
            return;
        };
        let event = if remaining.is_empty() {
            ServerEvent::UserStoppedTyping {
                channel_id,
                user_id: conn.user_id(),
            }
        } else {
            ServerEvent::UserTyping {
                channel_id,
                users: remaining,
            }
        };
        self.hub
            .broadcast_to_others(&channel_id, event, conn.user_id())
            .await;
    }

    pub async fn list_users(&self, conn: &Connection) -> Result<(), ChatError> {
        let online = self.presence.online_users().await;
        let users = self
            .users
            .list_active()
            .await?
            .into_iter()
            .map(|record| summary(record, &online))
            .collect();
        self.reply(conn, ServerEvent::UsersList { users }).await;
        Ok(())
    }

    pub async fn list_direct_users(&self, conn: &Connection) -> Result<(), ChatError> {
        let me = conn.user_id();
        let existing: HashMap<Uuid, ChannelId> = self
            .directory
            .direct_channels_of(me)
            .await?
            .into_iter()
            .filter_map(|channel| channel.direct_peer(me).map(|peer| (peer, channel.id)))
            .collect();
        let online = self.presence.online_users().await;
        let users = self
            .users
            .list_active()
            .await?
            .into_iter()
            .filter(|record| record.id != me)
            .map(|record| {
                let direct_channel_id = existing.get(&record.id).copied();
                DirectUserSummary {
                    user: summary(record, &online),
                    direct_channel_id,
                }
            })
            .collect();
        self.reply(conn, ServerEvent::DirectUsersList { users }).await;
        Ok(())
    }

    pub async fn create_direct_message(
        &self,
        conn: &Connection,
        target_user_id: Uuid,
    ) -> Result<(), ChatError> {
        let (channel, created) = self
            .directory
            .create_or_get_direct(&conn.identity, target_user_id, Utc::now())
            .await?;
        self.reply(
            conn,
            ServerEvent::DirectChannelCreated {
                channel: channel.clone(),
            },
        )
        .await;
        if created {
            info!(channel_id = %channel.id, user_id = %conn.user_id(), peer = %target_user_id, "direct conversation created");
            self.hub
                .send_to_user(target_user_id, ServerEvent::DirectChannelCreated { channel })
                .await;
        } else {
            self.reply(conn, ServerEvent::info("direct conversation already exists"))
                .await;
        }
        Ok(())
    }

    pub async fn invite_user(
        &self,
        conn: &Connection,
        reference: &str,
        email: &str,
    ) -> Result<(), ChatError> {
        let channel = self.directory.open(reference, &conn.identity).await?;
        if channel.is_direct() {
            return Err(ChatError::invalid(
                "direct conversations cannot take new members",
            ));
        }
        let permitted = channel.is_member(conn.user_id())
            || channel.created_by == Some(conn.user_id())
            || conn.identity.role.can_manage_channels();
        if !permitted {
            return Err(ChatError::forbidden(
                "only members, the creator, team leads or admins can invite",
            ));
        }
        let invitee = self
            .users
            .find_by_email(email)
            .await?
            .filter(|record| record.active)
            .ok_or_else(|| ChatError::not_found("no active user with that email"))?;

        let channel = self.directory.add_member(&channel, invitee.id).await?;
        self.hub
            .send_to_user(
                invitee.id,
                ServerEvent::ChannelInvite {
                    channel: channel.clone(),
                    invited_by: conn.identity.user_name.clone(),
                },
            )
            .await;
        self.hub
            .broadcast(
                &channel.id,
                ServerEvent::UserAddedToChannel {
                    channel_id: channel.id,
                    user_id: invitee.id,
                    user_name: invitee.name.clone(),
                },
                None,
            )
            .await;
        self.reply(
            conn,
            ServerEvent::success(format!(
                "{} was invited to {}",
                invitee.name, channel.display_name
            )),
        )
        .await;
        Ok(())
    }

    async fn member_count(&self, channel: &Channel) -> Result<usize, ChatError> {
        let occupancy = self.hub.occupancy(&channel.id).await;
        self.directory.member_count(channel, occupancy).await
    }

    /// A non-deleted message that belongs to the channel.
    async fn live_message_in(&self, channel: &Channel, message_id: Uuid) -> Result<Message, ChatError> {
        self.store
            .find_message(message_id)
            .await?
            .filter(|message| message.channel_id == channel.id && !message.deleted)
            .ok_or_else(|| ChatError::not_found("message not found"))
    }

    async fn mutate(
        &self,
        message_id: Uuid,
        mutation: MessageMutation,
    ) -> Result<huddle_core::MutationOutcome, ChatError> {
        self.store
            .mutate_message(message_id, &mutation, Utc::now())
            .await?
            .ok_or_else(|| ChatError::not_found("message not found"))
    }

    fn ensure_author_or_admin(
        &self,
        conn: &Connection,
        message: &Message,
        action: &str,
    ) -> Result<(), ChatError> {
        if message.sender_id == conn.user_id() || conn.identity.is_admin() {
            Ok(())
        } else {
            Err(ChatError::forbidden(format!(
                "only the sender or an admin can {action} this message"
            )))
        }
    }

    async fn reply(&self, conn: &Connection, event: ServerEvent) {
        self.hub.send_to(conn.id, event).await;
    }

    /// Broadcasts to the room; a requester outside the room still sees the result.
    async fn publish(&self, conn: &Connection, channel_id: ChannelId, event: ServerEvent) {
        if self.hub.is_subscribed(conn.id, &channel_id).await {
            self.hub.broadcast(&channel_id, event, None).await;
        } else {
            self.hub
                .broadcast(&channel_id, event.clone(), Some(conn.id))
                .await;
            self.hub.send_to(conn.id, event).await;
        }
    }
}

fn summary(record: UserRecord, online: &HashSet<Uuid>) -> UserSummary {
    UserSummary {
        online: online.contains(&record.id),
        user_id: record.id,
        name: record.name,
        email: record.email,
        role: record.role,
        team_id: record.team_id,
    }
}
