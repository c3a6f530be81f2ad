use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

use crate::identity::Identity;

/// Name and id of the implicit channel every user can reach.
pub const GENERAL_CHANNEL: &str = "general";
pub const MAX_CHANNEL_NAME_LEN: usize = 80;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel name must be provided")]
    EmptyName,
    #[error("channel name is too long")]
    NameTooLong,
    #[error("channel name '{0}' is reserved")]
    ReservedName(String),
    #[error("channels of type '{0}' cannot be created this way")]
    UnsupportedKind(ChannelKind),
    #[error("unknown channel type '{0}'")]
    UnknownKind(String),
    #[error("a direct channel needs two distinct participants")]
    InvalidDirectPair,
}

/// Addresses either the implicit general channel or a persisted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelId {
    General,
    Stored(Uuid),
}

impl ChannelId {
    pub fn stored(&self) -> Option<Uuid> {
        match self {
            ChannelId::General => None,
            ChannelId::Stored(id) => Some(*id),
        }
    }

    pub fn is_general(&self) -> bool {
        matches!(self, ChannelId::General)
    }
}

impl From<Uuid> for ChannelId {
    fn from(value: Uuid) -> Self {
        ChannelId::Stored(value)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::General => f.write_str(GENERAL_CHANNEL),
            ChannelId::Stored(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("'{0}' is not a channel id")]
pub struct InvalidChannelId(pub String);

impl FromStr for ChannelId {
    type Err = InvalidChannelId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case(GENERAL_CHANNEL) {
            return Ok(ChannelId::General);
        }
        Uuid::parse_str(trimmed)
            .map(ChannelId::Stored)
            .map_err(|_| InvalidChannelId(s.to_string()))
    }
}

impl Serialize for ChannelId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// Flat channel type label as it appears on the wire and in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    General,
    Public,
    Private,
    Team,
    Direct,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::General => "general",
            ChannelKind::Public => "public",
            ChannelKind::Private => "private",
            ChannelKind::Team => "team",
            ChannelKind::Direct => "direct",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "general" => Ok(ChannelKind::General),
            "public" => Ok(ChannelKind::Public),
            "private" => Ok(ChannelKind::Private),
            "team" => Ok(ChannelKind::Team),
            "direct" => Ok(ChannelKind::Direct),
            other => Err(ChannelError::UnknownKind(other.to_string())),
        }
    }
}

/// Access policy of a channel. The member list only exists where it decides access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ChannelScope {
    General,
    Public,
    Private {
        members: Vec<Uuid>,
    },
    Team {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        team_id: Option<Uuid>,
        members: Vec<Uuid>,
    },
    Direct {
        members: Vec<Uuid>,
    },
}

impl ChannelScope {
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelScope::General => ChannelKind::General,
            ChannelScope::Public => ChannelKind::Public,
            ChannelScope::Private { .. } => ChannelKind::Private,
            ChannelScope::Team { .. } => ChannelKind::Team,
            ChannelScope::Direct { .. } => ChannelKind::Direct,
        }
    }

    pub fn members(&self) -> &[Uuid] {
        match self {
            ChannelScope::General | ChannelScope::Public => &[],
            ChannelScope::Private { members }
            | ChannelScope::Team { members, .. }
            | ChannelScope::Direct { members } => members,
        }
    }

    pub fn team_id(&self) -> Option<Uuid> {
        match self {
            ChannelScope::Team { team_id, .. } => *team_id,
            _ => None,
        }
    }

    /// Rebuild a scope from its flat storage columns.
    pub fn from_parts(
        kind: ChannelKind,
        team_id: Option<Uuid>,
        members: Vec<Uuid>,
    ) -> Result<Self, ChannelError> {
        Ok(match kind {
            ChannelKind::General => ChannelScope::General,
            ChannelKind::Public => ChannelScope::Public,
            ChannelKind::Private => ChannelScope::Private { members },
            ChannelKind::Team => ChannelScope::Team { team_id, members },
            ChannelKind::Direct => {
                if members.len() != 2 || members[0] == members[1] {
                    return Err(ChannelError::InvalidDirectPair);
                }
                ChannelScope::Direct { members }
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    #[serde(rename = "_id")]
    pub id: ChannelId,
    pub name: String,
    pub display_name: String,
    pub description: String,
    #[serde(flatten)]
    pub scope: ChannelScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Channel {
    /// Descriptor of the implicit, never persisted general channel.
    pub fn general() -> Self {
        Self {
            id: ChannelId::General,
            name: GENERAL_CHANNEL.to_string(),
            display_name: "General".to_string(),
            description: "Company-wide conversation".to_string(),
            scope: ChannelScope::General,
            project_id: None,
            created_by: None,
            created_at: DateTime::<Utc>::default(),
        }
    }

    /// Lazily created conversation between two users.
    pub fn direct(
        a: &Identity,
        b: &Identity,
        now: DateTime<Utc>,
    ) -> Result<Self, ChannelError> {
        if a.user_id == b.user_id {
            return Err(ChannelError::InvalidDirectPair);
        }
        let (first, second) = if a.user_id < b.user_id { (a, b) } else { (b, a) };
        Ok(Self {
            id: ChannelId::Stored(Uuid::new_v4()),
            name: direct_channel_name(a.user_id, b.user_id),
            display_name: format!("{} & {}", first.user_name, second.user_name),
            description: String::new(),
            scope: ChannelScope::Direct {
                members: vec![first.user_id, second.user_id],
            },
            project_id: None,
            created_by: Some(a.user_id),
            created_at: now,
        })
    }

    pub fn kind(&self) -> ChannelKind {
        self.scope.kind()
    }

    pub fn is_general(&self) -> bool {
        self.id.is_general()
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.scope, ChannelScope::Direct { .. })
    }

    pub fn is_member(&self, user_id: Uuid) -> bool {
        self.scope.members().contains(&user_id)
    }

    /// Access decision for a viewer. The admin override stops at
    /// private and direct conversations.
    pub fn admits(&self, viewer: &Identity) -> bool {
        match &self.scope {
            ChannelScope::General | ChannelScope::Public => true,
            ChannelScope::Team { team_id, members } => {
                viewer.is_admin() || members.contains(&viewer.user_id) || viewer.shares_team(*team_id)
            }
            ChannelScope::Private { members } | ChannelScope::Direct { members } => {
                members.contains(&viewer.user_id)
            }
        }
    }

    /// Adds a member to a private or team channel. Returns whether the list changed.
    pub fn add_member(&mut self, user_id: Uuid) -> bool {
        match &mut self.scope {
            ChannelScope::Private { members } | ChannelScope::Team { members, .. } => {
                if members.contains(&user_id) {
                    false
                } else {
                    members.push(user_id);
                    true
                }
            }
            _ => false,
        }
    }

    /// The other participant of a direct channel.
    pub fn direct_peer(&self, user_id: Uuid) -> Option<Uuid> {
        match &self.scope {
            ChannelScope::Direct { members } if members.contains(&user_id) => {
                members.iter().copied().find(|member| *member != user_id)
            }
            _ => None,
        }
    }
}

/// Order-independent name for the direct channel between two users.
pub fn direct_channel_name(a: Uuid, b: Uuid) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("dm-{low}-{high}")
}

/// Lower-cases and hyphenates a requested channel name.
pub fn normalize_channel_name(raw: &str) -> Result<String, ChannelError> {
    let name = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase();
    if name.is_empty() {
        return Err(ChannelError::EmptyName);
    }
    if name.chars().count() > MAX_CHANNEL_NAME_LEN {
        return Err(ChannelError::NameTooLong);
    }
    if name == GENERAL_CHANNEL || name.starts_with("dm-") {
        return Err(ChannelError::ReservedName(name));
    }
    Ok(name)
}

/// A validated request to create a shared channel.
#[derive(Debug, Clone)]
pub struct ChannelDraft {
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub kind: ChannelKind,
    pub members: Vec<Uuid>,
    pub project_id: Option<Uuid>,
}

impl ChannelDraft {
    pub fn into_channel(self, creator: &Identity, now: DateTime<Utc>) -> Result<Channel, ChannelError> {
        let name = normalize_channel_name(&self.name)?;

        let mut members = Vec::with_capacity(self.members.len() + 1);
        for member in std::iter::once(creator.user_id).chain(self.members) {
            if !members.contains(&member) {
                members.push(member);
            }
        }

        let scope = match self.kind {
            ChannelKind::Public => ChannelScope::Public,
            ChannelKind::Private => ChannelScope::Private { members },
            ChannelKind::Team => ChannelScope::Team {
                team_id: creator.team_id,
                members,
            },
            kind @ (ChannelKind::General | ChannelKind::Direct) => {
                return Err(ChannelError::UnsupportedKind(kind))
            }
        };

        let display_name = self
            .display_name
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.name.trim().to_string());

        Ok(Channel {
            id: ChannelId::Stored(Uuid::new_v4()),
            name,
            display_name,
            description: self.description.unwrap_or_default().trim().to_string(),
            scope,
            project_id: self.project_id,
            created_by: Some(creator.user_id),
            created_at: now,
        })
    }
}
