//! Chat domain types, access rules and the gateway wire protocol.

pub mod channel;
pub mod event;
pub mod identity;
pub mod message;

pub use channel::{
    direct_channel_name, normalize_channel_name, Channel, ChannelDraft, ChannelError, ChannelId,
    ChannelKind, ChannelScope, GENERAL_CHANNEL,
};
pub use event::{
    ClientEvent, DirectUserSummary, MessageView, PresenceStatus, ReadUpdate, ServerEvent,
    TypingUser, UserSummary,
};
pub use identity::{Identity, Role, UNKNOWN_USER_NAME};
pub use message::{
    Message, MessageChange, MessageContent, MessageDraft, MessageError, MessageMutation,
    MutationOutcome, ReadReceipt,
};
