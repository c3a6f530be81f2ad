use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{channel::ChannelId, identity::Identity};

/// Longest excerpt of the replied-to text kept on a reply.
pub const REPLY_EXCERPT_LEN: usize = 200;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("message text must be provided")]
    EmptyMessage,
    #[error("message text exceeds {0} characters")]
    TooLong(usize),
    #[error("voice messages need an audio url")]
    MissingAudio,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioClip {
    pub url: String,
    #[serde(default)]
    pub size: u64,
    /// Length in seconds.
    #[serde(default)]
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttachment {
    pub name: String,
    #[serde(rename = "type", default)]
    pub content_type: String,
    #[serde(default)]
    pub size: u64,
    pub url: String,
}

/// What a message carries besides its text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text,
    Files { files: Vec<FileAttachment> },
    Voice { audio: AudioClip },
}

impl MessageContent {
    /// Body shown when an attachment arrives without text.
    pub fn placeholder(&self) -> Option<String> {
        match self {
            MessageContent::Text => None,
            MessageContent::Files { files } => Some(format!("{} file(s) uploaded", files.len())),
            MessageContent::Voice { audio } => {
                let seconds = audio.duration.max(0.0).round() as u64;
                Some(format!("🎤 Voice message ({seconds}s)"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub user_id: Uuid,
    pub user_name: String,
    pub read_at: DateTime<Utc>,
}

impl ReadReceipt {
    pub fn new(reader: &Identity, read_at: DateTime<Utc>) -> Self {
        Self {
            user_id: reader.user_id,
            user_name: reader.user_name.clone(),
            read_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub user_id: Uuid,
    pub user_name: String,
    pub emoji: String,
    pub reacted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplySnapshot {
    pub message_id: Uuid,
    pub sender_name: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardedFrom {
    pub message_id: Uuid,
    pub sender_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub channel_id: ChannelId,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub text: String,
    #[serde(flatten)]
    pub content: MessageContent,
    pub read_by: Vec<ReadReceipt>,
    pub reactions: Vec<Reaction>,
    pub edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplySnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_from: Option<ForwardedFrom>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// Validated input for a new message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDraft {
    text: String,
    content: MessageContent,
    reply_to: Option<ReplySnapshot>,
}

impl MessageDraft {
    pub fn new(
        text: Option<String>,
        content: MessageContent,
        max_len: usize,
    ) -> Result<Self, MessageError> {
        let text = text.map(|value| value.trim().to_string()).unwrap_or_default();
        if text.chars().count() > max_len {
            return Err(MessageError::TooLong(max_len));
        }

        let content = match content {
            MessageContent::Files { files } if files.is_empty() => MessageContent::Text,
            MessageContent::Voice { audio } if audio.url.trim().is_empty() => {
                return Err(MessageError::MissingAudio)
            }
            other => other,
        };

        let text = match content.placeholder() {
            Some(placeholder) if text.is_empty() => placeholder,
            _ if text.is_empty() => return Err(MessageError::EmptyMessage),
            _ => text,
        };

        Ok(Self {
            text,
            content,
            reply_to: None,
        })
    }

    pub fn replying_to(mut self, snapshot: ReplySnapshot) -> Self {
        self.reply_to = Some(snapshot);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl Message {
    /// A freshly sent message: the sender has read it, nobody reacted yet.
    pub fn compose(
        channel_id: ChannelId,
        sender: &Identity,
        draft: MessageDraft,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel_id,
            sender_id: sender.user_id,
            sender_name: sender.user_name.clone(),
            text: draft.text,
            content: draft.content,
            read_by: vec![ReadReceipt::new(sender, now)],
            reactions: Vec::new(),
            edited: false,
            edited_at: None,
            reply_to: draft.reply_to,
            forwarded_from: None,
            deleted: false,
            created_at: now,
        }
    }

    /// Copy of `original` posted into `target` with an attribution line.
    pub fn forward(
        original: &Message,
        target: ChannelId,
        sender: &Identity,
        now: DateTime<Utc>,
    ) -> Self {
        let mut message = Self::compose(
            target,
            sender,
            MessageDraft {
                text: format!("Forwarded from {}:\n{}", original.sender_name, original.text),
                content: original.content.clone(),
                reply_to: None,
            },
            now,
        );
        message.forwarded_from = Some(ForwardedFrom {
            message_id: original.id,
            sender_name: original.sender_name.clone(),
        });
        message
    }

    pub fn reply_snapshot(&self) -> ReplySnapshot {
        ReplySnapshot {
            message_id: self.id,
            sender_name: self.sender_name.clone(),
            text: self.text.chars().take(REPLY_EXCERPT_LEN).collect(),
        }
    }

    pub fn read_count(&self) -> usize {
        self.read_by.len()
    }

    pub fn has_read(&self, user_id: Uuid) -> bool {
        self.read_by.iter().any(|receipt| receipt.user_id == user_id)
    }

    /// Evaluated against the member count at call time, so it can flip back
    /// to false when the channel grows.
    pub fn is_read_by_all(&self, member_count: usize) -> bool {
        self.read_count() >= member_count
    }

    pub fn reaction_of(&self, user_id: Uuid) -> Option<&Reaction> {
        self.reactions.iter().find(|reaction| reaction.user_id == user_id)
    }

    fn toggle_reaction(
        &mut self,
        user_id: Uuid,
        user_name: &str,
        emoji: &str,
        at: DateTime<Utc>,
    ) -> MessageChange {
        let position = self
            .reactions
            .iter()
            .position(|reaction| reaction.user_id == user_id);

        match position {
            Some(index) if self.reactions[index].emoji == emoji => {
                self.reactions.remove(index);
                MessageChange::ReactionRemoved
            }
            Some(index) => {
                let reaction = &mut self.reactions[index];
                reaction.emoji = emoji.to_string();
                reaction.user_name = user_name.to_string();
                reaction.reacted_at = at;
                MessageChange::ReactionReplaced
            }
            None => {
                self.reactions.push(Reaction {
                    user_id,
                    user_name: user_name.to_string(),
                    emoji: emoji.to_string(),
                    reacted_at: at,
                });
                MessageChange::ReactionAdded
            }
        }
    }

    fn record_read(&mut self, receipt: &ReadReceipt) -> MessageChange {
        if self.has_read(receipt.user_id) {
            return MessageChange::Unchanged;
        }
        self.read_by.push(receipt.clone());
        MessageChange::Read
    }
}

/// A read-modify-write step on a single message. Stores apply it while
/// holding the message exclusively.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageMutation {
    React {
        user_id: Uuid,
        user_name: String,
        emoji: String,
    },
    MarkRead(ReadReceipt),
    Edit {
        text: String,
    },
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageChange {
    Unchanged,
    ReactionAdded,
    ReactionRemoved,
    ReactionReplaced,
    Read,
    Edited,
    Deleted,
}

impl MessageChange {
    pub fn is_change(&self) -> bool {
        !matches!(self, MessageChange::Unchanged)
    }
}

impl MessageMutation {
    pub fn apply(&self, message: &mut Message, at: DateTime<Utc>) -> MessageChange {
        match self {
            MessageMutation::React {
                user_id,
                user_name,
                emoji,
            } => message.toggle_reaction(*user_id, user_name, emoji, at),
            MessageMutation::MarkRead(receipt) => message.record_read(receipt),
            MessageMutation::Edit { text } => {
                if message.text == *text {
                    return MessageChange::Unchanged;
                }
                message.text = text.clone();
                message.edited = true;
                message.edited_at = Some(at);
                MessageChange::Edited
            }
            MessageMutation::Delete => {
                if message.deleted {
                    return MessageChange::Unchanged;
                }
                message.deleted = true;
                MessageChange::Deleted
            }
        }
    }
}

/// Result of applying a mutation: the message as persisted afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    pub message: Message,
    pub change: MessageChange,
}
