//! Channel lookup, access decisions and lifecycle rules.

use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Utc};
use huddle_core::{
    channel::{direct_channel_name, Channel, ChannelDraft, ChannelId, ChannelScope},
    event::CreateChannelPayload,
    identity::Identity,
};
use uuid::Uuid;

use crate::{
    error::ChatError,
    store::ChatStore,
    users::{identity_of, UserDirectory},
};

#[derive(Clone)]
pub struct ChannelDirectory {
    store: Arc<dyn ChatStore>,
    users: Arc<dyn UserDirectory>,
}

impl ChannelDirectory {
    pub fn new(store: Arc<dyn ChatStore>, users: Arc<dyn UserDirectory>) -> Self {
        Self { store, users }
    }

    /// General first, then every persisted channel the viewer may see.
    pub async fn list_accessible(&self, viewer: &Identity) -> Result<Vec<Channel>, ChatError> {
        let mut seen = HashSet::from([ChannelId::General]);
        let mut channels = vec![Channel::general()];
        for channel in self.store.list_accessible_channels(viewer).await? {
            if seen.insert(channel.id) {
                channels.push(channel);
            }
        }
        Ok(channels)
    }

    pub async fn create(
        &self,
        creator: &Identity,
        payload: CreateChannelPayload,
        now: DateTime<Utc>,
    ) -> Result<Channel, ChatError> {
        if !creator.role.can_manage_channels() {
            return Err(ChatError::forbidden(
                "only team leads and admins can create channels",
            ));
        }
        let channel = ChannelDraft {
            name: payload.name,
            display_name: payload.display_name,
            description: payload.description,
            kind: payload.kind,
            members: payload.members,
            project_id: payload.project_id,
        }
        .into_channel(creator, now)?;
        self.store.insert_channel(&channel).await?;
        Ok(channel)
    }

    /// Accepts `"general"`, a channel id or a channel name.
    pub async fn resolve(&self, reference: &str) -> Result<Channel, ChatError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ChatError::invalid("channel id must be provided"));
        }
        let found = match reference.parse::<ChannelId>() {
            Ok(ChannelId::General) => return Ok(Channel::general()),
            Ok(ChannelId::Stored(id)) => self.store.find_channel(id).await?,
            Err(_) => self.store.find_channel_by_name(reference).await?,
        };
        found.ok_or_else(|| ChatError::not_found("channel not found"))
    }

    pub async fn find(&self, id: ChannelId) -> Result<Option<Channel>, ChatError> {
        match id {
            ChannelId::General => Ok(Some(Channel::general())),
            ChannelId::Stored(id) => self.store.find_channel(id).await,
        }
    }

    pub fn authorize(channel: &Channel, viewer: &Identity) -> bool {
        channel.admits(viewer)
    }

    /// Resolves and checks access in one step.
    pub async fn open(&self, reference: &str, viewer: &Identity) -> Result<Channel, ChatError> {
        let channel = self.resolve(reference).await?;
        if !Self::authorize(&channel, viewer) {
            return Err(ChatError::forbidden("you do not have access to this channel"));
        }
        Ok(channel)
    }

    /// Deletes a shared channel with its messages. General is never deletable.
    pub async fn delete(&self, caller: &Identity, reference: &str) -> Result<Channel, ChatError> {
        let channel = self.resolve(reference).await?;
        let Some(id) = channel.id.stored() else {
            return Err(ChatError::forbidden(
                "the general channel cannot be deleted; clear its history instead",
            ));
        };
        if channel.is_direct() {
            return Err(ChatError::invalid(
                "direct conversations are removed with delete_direct_message",
            ));
        }
        if !caller.role.can_manage_channels() || !channel.admits(caller) {
            return Err(ChatError::forbidden(
                "only team leads and admins with access can delete channels",
            ));
        }
        if !self.store.delete_channel(id).await? {
            return Err(ChatError::not_found("channel not found"));
        }
        Ok(channel)
    }

    pub async fn delete_direct(
        &self,
        caller: &Identity,
        reference: &str,
    ) -> Result<Channel, ChatError> {
        let channel = self.resolve(reference).await?;
        if !channel.is_direct() {
            return Err(ChatError::invalid("channel is not a direct conversation"));
        }
        if !channel.is_member(caller.user_id) {
            return Err(ChatError::forbidden(
                "only participants can delete a direct conversation",
            ));
        }
        let Some(id) = channel.id.stored() else {
            return Err(ChatError::invalid("channel is not a direct conversation"));
        };
        if !self.store.delete_channel(id).await? {
            return Err(ChatError::not_found("channel not found"));
        }
        Ok(channel)
    }

    /// Returns the direct channel between the two users and whether it was
    /// created by this call.
    pub async fn create_or_get_direct(
        &self,
        caller: &Identity,
        target_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(Channel, bool), ChatError> {
        if caller.user_id == target_id {
            return Err(ChatError::invalid(
                "cannot open a direct conversation with yourself",
            ));
        }
        let target = self
            .users
            .find_by_id(target_id)
            .await?
            .filter(|record| record.active)
            .ok_or_else(|| ChatError::not_found("user not found"))?;

        let name = direct_channel_name(caller.user_id, target_id);
        if let Some(existing) = self.store.find_channel_by_name(&name).await? {
            return Ok((existing, false));
        }

        let channel = Channel::direct(caller, &identity_of(&target), now)?;
        match self.store.insert_channel(&channel).await {
            Ok(()) => Ok((channel, true)),
            // Lost a race with the other participant.
            Err(ChatError::Conflict(_)) => self
                .store
                .find_channel_by_name(&name)
                .await?
                .map(|existing| (existing, false))
                .ok_or_else(|| ChatError::Conflict("direct conversation is being created".into())),
            Err(err) => Err(err),
        }
    }

    pub async fn direct_channels_of(&self, user_id: Uuid) -> Result<Vec<Channel>, ChatError> {
        self.store.direct_channels_of(user_id).await
    }

    /// Adds a member to a private or team channel; other kinds are returned unchanged.
    pub async fn add_member(&self, channel: &Channel, user_id: Uuid) -> Result<Channel, ChatError> {
        match (&channel.scope, channel.id.stored()) {
            (ChannelScope::Private { .. } | ChannelScope::Team { .. }, Some(id)) => self
                .store
                .add_channel_member(id, user_id)
                .await?
                .ok_or_else(|| ChatError::not_found("channel not found")),
            _ => Ok(channel.clone()),
        }
    }

    /// Audience size used by the read aggregate. Open channels count the
    /// users currently in the room; team channels count the roster plus
    /// explicit members.
    pub async fn member_count(&self, channel: &Channel, occupancy: usize) -> Result<usize, ChatError> {
        let count = match &channel.scope {
            ChannelScope::General | ChannelScope::Public => occupancy,
            ChannelScope::Private { members } | ChannelScope::Direct { members } => members.len(),
            ChannelScope::Team { team_id, members } => {
                let mut audience: HashSet<Uuid> = members.iter().copied().collect();
                if let Some(team_id) = team_id {
                    audience.extend(self.users.team_roster(*team_id).await?);
                }
                audience.len()
            }
        };
        Ok(count.max(1))
    }
}
