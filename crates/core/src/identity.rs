use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Display name used when a user cannot be resolved.
pub const UNKNOWN_USER_NAME: &str = "Unknown User";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    TeamLead,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::TeamLead => "team_lead",
            Role::Member => "member",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }

    /// Team leads and admins may create and delete shared channels.
    pub fn can_manage_channels(&self) -> bool {
        matches!(self, Role::Admin | Role::TeamLead)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unsupported role '{0}'")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "team_lead" | "teamlead" | "team-lead" => Ok(Role::TeamLead),
            "member" => Ok(Role::Member),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Who a connection acts as, resolved once by the identity gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: Uuid,
    pub user_name: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<Uuid>,
}

impl Identity {
    pub fn new(user_id: Uuid, user_name: impl Into<String>, role: Role, team_id: Option<Uuid>) -> Self {
        Self {
            user_id,
            user_name: user_name.into(),
            role,
            team_id,
        }
    }

    /// Fallback descriptor for a user id nobody can resolve.
    pub fn unknown(user_id: Uuid) -> Self {
        Self::new(user_id, UNKNOWN_USER_NAME, Role::Member, None)
    }

    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }

    pub fn shares_team(&self, team_id: Option<Uuid>) -> bool {
        matches!((self.team_id, team_id), (Some(mine), Some(theirs)) if mine == theirs)
    }
}
