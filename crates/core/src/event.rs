//! Gateway frames. Every frame is `{"event": name, "data": payload}` with
//! camelCase payload fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    channel::{Channel, ChannelId, ChannelKind},
    identity::{Identity, Role},
    message::{AudioClip, FileAttachment, Message, MessageContent, Reaction},
};

/// Channel argument of `join_channel`: either a bare string or `{ "channelId": .. }`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ChannelTarget {
    Bare(String),
    #[serde(rename_all = "camelCase")]
    Wrapped { channel_id: String },
}

impl ChannelTarget {
    pub fn as_str(&self) -> &str {
        match self {
            ChannelTarget::Bare(value) => value,
            ChannelTarget::Wrapped { channel_id } => channel_id,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MessageRefRepr {
    Id(Uuid),
    Object {
        #[serde(rename = "_id", alias = "id", alias = "messageId")]
        id: Uuid,
    },
}

/// Reference to a stored message. Clients may send the id alone or the whole
/// message object they hold; only the id is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "MessageRefRepr")]
pub struct MessageRef {
    pub id: Uuid,
}

impl From<MessageRefRepr> for MessageRef {
    fn from(value: MessageRefRepr) -> Self {
        match value {
            MessageRefRepr::Id(id) | MessageRefRepr::Object { id } => MessageRef { id },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChannelPayload {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type", default = "default_channel_kind")]
    pub kind: ChannelKind,
    #[serde(default)]
    pub members: Vec<Uuid>,
    #[serde(default)]
    pub project_id: Option<Uuid>,
}

fn default_channel_kind() -> ChannelKind {
    ChannelKind::Public
}

/// Body of `send_message` as clients compose it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutgoingMessage {
    pub text: Option<String>,
    pub audio_url: Option<String>,
    pub audio_size: Option<u64>,
    pub audio_duration: Option<f64>,
    pub is_voice_message: bool,
    pub files: Vec<FileAttachment>,
    pub reply_to: Option<MessageRef>,
}

impl OutgoingMessage {
    /// Classifies the loose client fields into one content kind. Audio wins
    /// over files.
    pub fn content(&self) -> MessageContent {
        if self.is_voice_message || self.audio_url.is_some() {
            return MessageContent::Voice {
                audio: AudioClip {
                    url: self.audio_url.clone().unwrap_or_default(),
                    size: self.audio_size.unwrap_or_default(),
                    duration: self.audio_duration.unwrap_or_default(),
                },
            };
        }
        if !self.files.is_empty() {
            return MessageContent::Files {
                files: self.files.clone(),
            };
        }
        MessageContent::Text
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    GetChannels,
    CreateChannel(CreateChannelPayload),
    JoinChannel(ChannelTarget),
    LeaveChannel {
        channel_id: String,
    },
    SendMessage {
        channel_id: String,
        message: OutgoingMessage,
    },
    ForwardMessage {
        target_channel_id: String,
        message: MessageRef,
    },
    EditMessage {
        channel_id: String,
        message_id: Uuid,
        new_text: String,
    },
    DeleteMessage {
        channel_id: String,
        message_id: Uuid,
    },
    SendReaction {
        channel_id: String,
        message_id: Uuid,
        emoji: String,
    },
    MarkRead {
        channel_id: String,
        message_id: Uuid,
    },
    DeleteChannel {
        channel_id: String,
    },
    DeleteDirectMessage {
        channel_id: String,
    },
    ClearChatHistory {
        channel_id: String,
    },
    TypingStart {
        channel_id: String,
    },
    TypingStop {
        channel_id: String,
    },
    GetUsers,
    GetDirectUsers,
    CreateDirectMessage {
        target_user_id: Uuid,
        #[serde(default)]
        target_user_name: Option<String>,
    },
    InviteUserToChannel {
        channel_id: String,
        user_email: String,
        #[serde(default)]
        user_name: Option<String>,
    },
    ChannelRefresh {
        channel_id: String,
    },
    ChannelsRefresh,
}

impl ClientEvent {
    /// Wire name, used as a log and metrics label.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::GetChannels => "get_channels",
            ClientEvent::CreateChannel(_) => "create_channel",
            ClientEvent::JoinChannel(_) => "join_channel",
            ClientEvent::LeaveChannel { .. } => "leave_channel",
            ClientEvent::SendMessage { .. } => "send_message",
            ClientEvent::ForwardMessage { .. } => "forward_message",
            ClientEvent::EditMessage { .. } => "edit_message",
            ClientEvent::DeleteMessage { .. } => "delete_message",
            ClientEvent::SendReaction { .. } => "send_reaction",
            ClientEvent::MarkRead { .. } => "mark_read",
            ClientEvent::DeleteChannel { .. } => "delete_channel",
            ClientEvent::DeleteDirectMessage { .. } => "delete_direct_message",
            ClientEvent::ClearChatHistory { .. } => "clear_chat_history",
            ClientEvent::TypingStart { .. } => "typing_start",
            ClientEvent::TypingStop { .. } => "typing_stop",
            ClientEvent::GetUsers => "get_users",
            ClientEvent::GetDirectUsers => "get_direct_users",
            ClientEvent::CreateDirectMessage { .. } => "create_direct_message",
            ClientEvent::InviteUserToChannel { .. } => "invite_user_to_channel",
            ClientEvent::ChannelRefresh { .. } => "channel_refresh",
            ClientEvent::ChannelsRefresh => "channels_refresh",
        }
    }
}

/// A message as delivered to clients, with its read aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub read_count: usize,
    pub member_count: usize,
    pub is_read_by_all: bool,
}

impl MessageView {
    pub fn new(message: Message, member_count: usize) -> Self {
        let read_count = message.read_count();
        let is_read_by_all = message.is_read_by_all(member_count);
        Self {
            message,
            read_count,
            member_count,
            is_read_by_all,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadUpdate {
    pub channel_id: ChannelId,
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub user_name: String,
    pub read_at: DateTime<Utc>,
    pub read_count: usize,
    pub member_count: usize,
    pub is_read_by_all: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub user_id: Uuid,
    pub name: String,
    pub email: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<Uuid>,
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectUserSummary {
    #[serde(flatten)]
    pub user: UserSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_channel_id: Option<ChannelId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingUser {
    pub user_id: Uuid,
    pub user_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    Ready {
        user: Identity,
    },
    ChannelsList {
        channels: Vec<Channel>,
    },
    ChannelCreated {
        channel: Channel,
    },
    ChannelJoined {
        channel: Channel,
        history: Vec<MessageView>,
    },
    UserJoined {
        channel_id: ChannelId,
        user_id: Uuid,
        user_name: String,
    },
    ReceiveMessage {
        channel_id: ChannelId,
        message: MessageView,
    },
    MessageUpdated {
        channel_id: ChannelId,
        message_id: Uuid,
        text: String,
        edited: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        edited_at: Option<DateTime<Utc>>,
        deleted: bool,
    },
    ReceiveReaction {
        channel_id: ChannelId,
        message_id: Uuid,
        reactions: Vec<Reaction>,
    },
    MessageSeen(ReadUpdate),
    MessageReadReceipt(ReadUpdate),
    UsersList {
        users: Vec<UserSummary>,
    },
    DirectUsersList {
        users: Vec<DirectUserSummary>,
    },
    DirectChannelCreated {
        channel: Channel,
    },
    ChannelInvite {
        channel: Channel,
        invited_by: String,
    },
    UserAddedToChannel {
        channel_id: ChannelId,
        user_id: Uuid,
        user_name: String,
    },
    ChannelDeletedImmediate {
        channel_id: ChannelId,
    },
    DirectMessageDeletedImmediate {
        channel_id: ChannelId,
        deleted_by: Uuid,
    },
    ChatHistoryClearedImmediate {
        channel_id: ChannelId,
        cleared_by: Uuid,
    },
    ChannelMessagesCleared {
        channel_id: ChannelId,
    },
    UserTyping {
        channel_id: ChannelId,
        users: Vec<TypingUser>,
    },
    UserStoppedTyping {
        channel_id: ChannelId,
        user_id: Uuid,
    },
    UserStatus {
        user_id: Uuid,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    },
    Success {
        message: String,
    },
    Info {
        message: String,
    },
    Error {
        message: String,
        code: String,
    },
}

impl ServerEvent {
    pub fn success(message: impl Into<String>) -> Self {
        ServerEvent::Success {
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        ServerEvent::Info {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>, code: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
            code: code.into(),
        }
    }

    pub fn updated(message: &Message) -> Self {
        ServerEvent::MessageUpdated {
            channel_id: message.channel_id,
            message_id: message.id,
            text: message.text.clone(),
            edited: message.edited,
            edited_at: message.edited_at,
            deleted: message.deleted,
        }
    }
}
