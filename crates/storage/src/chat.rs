use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use huddle_core::{
    channel::{Channel, ChannelId, ChannelKind, ChannelScope},
    identity::Identity,
    message::{
        ForwardedFrom, Message, MessageContent, MessageMutation, MutationOutcome, Reaction,
        ReadReceipt, ReplySnapshot,
    },
};
use serde_json::json;
use sqlx::{types::Json, FromRow};
use thiserror::Error;
use uuid::Uuid;

use crate::StoragePool;

#[derive(Debug, Error)]
pub enum CreateChannelError {
    #[error("channel name already exists")]
    NameTaken,
    #[error("failed to create channel: {0}")]
    Other(#[from] anyhow::Error),
}

/// Channels and messages in Postgres.
#[derive(Clone)]
pub struct ChatRepository {
    pool: StoragePool,
}

const CHANNEL_COLUMNS: &str = "id, name, display_name, description, kind, team_id, project_id, members, created_by, created_at";
const MESSAGE_COLUMNS: &str = "id, channel_id, sender_id, sender_name, body, content, read_by, reactions, edited, edited_at, reply_to, forwarded_from, deleted, created_at";

#[derive(Debug, FromRow)]
struct ChannelRow {
    id: Uuid,
    name: String,
    display_name: String,
    description: String,
    kind: String,
    team_id: Option<Uuid>,
    project_id: Option<Uuid>,
    members: Vec<Uuid>,
    created_by: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ChannelRow> for Channel {
    type Error = anyhow::Error;

    fn try_from(row: ChannelRow) -> Result<Self> {
        let kind: ChannelKind = row
            .kind
            .parse()
            .with_context(|| format!("channel {} has unknown kind", row.id))?;
        let scope = ChannelScope::from_parts(kind, row.team_id, row.members)
            .with_context(|| format!("channel {} has an invalid member list", row.id))?;
        Ok(Channel {
            id: ChannelId::Stored(row.id),
            name: row.name,
            display_name: row.display_name,
            description: row.description,
            scope,
            project_id: row.project_id,
            created_by: row.created_by,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: Uuid,
    channel_id: String,
    sender_id: Uuid,
    sender_name: String,
    body: String,
    content: Json<MessageContent>,
    read_by: Json<Vec<ReadReceipt>>,
    reactions: Json<Vec<Reaction>>,
    edited: bool,
    edited_at: Option<DateTime<Utc>>,
    reply_to: Option<Json<ReplySnapshot>>,
    forwarded_from: Option<Json<ForwardedFrom>>,
    deleted: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        let channel_id = row
            .channel_id
            .parse()
            .map_err(|err| anyhow!("message {}: {err}", row.id))?;
        Ok(Message {
            id: row.id,
            channel_id,
            sender_id: row.sender_id,
            sender_name: row.sender_name,
            text: row.body,
            content: row.content.0,
            read_by: row.read_by.0,
            reactions: row.reactions.0,
            edited: row.edited,
            edited_at: row.edited_at,
            reply_to: row.reply_to.map(|value| value.0),
            forwarded_from: row.forwarded_from.map(|value| value.0),
            deleted: row.deleted,
            created_at: row.created_at,
        })
    }
}

fn into_channels(rows: Vec<ChannelRow>) -> Result<Vec<Channel>> {
    rows.into_iter().map(Channel::try_from).collect()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if matches!(db_err.code(), Some(code) if code.as_ref() == "23505"))
}

impl ChatRepository {
    pub fn new(pool: StoragePool) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    /// Persisted channels the viewer may see. The implicit general channel is
    /// not included.
    pub async fn list_accessible_channels(&self, viewer: &Identity) -> Result<Vec<Channel>> {
        let rows = sqlx::query_as::<_, ChannelRow>(&format!(
            r#"
            SELECT {CHANNEL_COLUMNS}
            FROM channels
            WHERE kind = 'public'
               OR $1 = ANY(members)
               OR (kind = 'team' AND ($2 OR team_id = $3))
            ORDER BY created_at ASC
            "#
        ))
        .bind(viewer.user_id)
        .bind(viewer.is_admin())
        .bind(viewer.team_id)
        .fetch_all(self.pool.pool())
        .await
        .with_context(|| format!("listing channels for {}", viewer.user_id))?;
        into_channels(rows)
    }

    pub async fn direct_channels_of(&self, user_id: Uuid) -> Result<Vec<Channel>> {
        let rows = sqlx::query_as::<_, ChannelRow>(&format!(
            r#"
            SELECT {CHANNEL_COLUMNS}
            FROM channels
            WHERE kind = 'direct' AND $1 = ANY(members)
            "#
        ))
        .bind(user_id)
        .fetch_all(self.pool.pool())
        .await?;
        into_channels(rows)
    }

    pub async fn insert_channel(&self, channel: &Channel) -> Result<(), CreateChannelError> {
        let id = channel
            .id
            .stored()
            .ok_or_else(|| anyhow!("the general channel is not persisted"))?;
        sqlx::query(
            r#"
            INSERT INTO channels (id, name, display_name, description, kind, team_id, project_id, members, created_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(id)
        .bind(&channel.name)
        .bind(&channel.display_name)
        .bind(&channel.description)
        .bind(channel.kind().as_str())
        .bind(channel.scope.team_id())
        .bind(channel.project_id)
        .bind(channel.scope.members())
        .bind(channel.created_by)
        .bind(channel.created_at)
        .execute(self.pool.pool())
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                CreateChannelError::NameTaken
            } else {
                CreateChannelError::Other(anyhow!(err).context(format!("creating channel '{}'", channel.name)))
            }
        })?;
        Ok(())
    }

    pub async fn find_channel(&self, id: Uuid) -> Result<Option<Channel>> {
        let row = sqlx::query_as::<_, ChannelRow>(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await?;
        row.map(Channel::try_from).transpose()
    }

    pub async fn find_channel_by_name(&self, name: &str) -> Result<Option<Channel>> {
        let row = sqlx::query_as::<_, ChannelRow>(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels WHERE LOWER(name) = LOWER($1)"
        ))
        .bind(name)
        .fetch_optional(self.pool.pool())
        .await?;
        row.map(Channel::try_from).transpose()
    }

    /// Appends a member unless already present. Returns the updated channel.
    pub async fn add_channel_member(&self, id: Uuid, user_id: Uuid) -> Result<Option<Channel>> {
        let row = sqlx::query_as::<_, ChannelRow>(&format!(
            r#"
            UPDATE channels
            SET members = CASE WHEN $2 = ANY(members) THEN members ELSE array_append(members, $2) END
            WHERE id = $1 AND kind IN ('private', 'team')
            RETURNING {CHANNEL_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(user_id)
        .fetch_optional(self.pool.pool())
        .await
        .with_context(|| format!("adding {user_id} to channel {id}"))?;
        row.map(Channel::try_from).transpose()
    }

    /// Removes the channel and its messages in one transaction. Returns whether
    /// the channel existed.
    pub async fn delete_channel(&self, id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE channel_id = $1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM channels WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed > 0)
    }

    pub async fn insert_message(&self, message: &Message) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, channel_id, sender_id, sender_name, body, content, read_by, reactions, edited, edited_at, reply_to, forwarded_from, deleted, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(message.id)
        .bind(message.channel_id.to_string())
        .bind(message.sender_id)
        .bind(&message.sender_name)
        .bind(&message.text)
        .bind(Json(&message.content))
        .bind(Json(&message.read_by))
        .bind(Json(&message.reactions))
        .bind(message.edited)
        .bind(message.edited_at)
        .bind(message.reply_to.as_ref().map(Json))
        .bind(message.forwarded_from.as_ref().map(Json))
        .bind(message.deleted)
        .bind(message.created_at)
        .execute(self.pool.pool())
        .await
        .with_context(|| format!("storing message {}", message.id))?;
        Ok(())
    }

    pub async fn find_message(&self, id: Uuid) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await?;
        row.map(Message::try_from).transpose()
    }

    /// Newest `limit` non-deleted messages, oldest first.
    pub async fn recent_messages(&self, channel: ChannelId, limit: i64) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE channel_id = $1 AND NOT deleted
            ORDER BY seq DESC
            LIMIT $2
            "#
        ))
        .bind(channel.to_string())
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .with_context(|| format!("loading history of {channel}"))?;
        rows.into_iter().rev().map(Message::try_from).collect()
    }

    /// Applies a mutation while holding the row lock, so concurrent reactions
    /// and receipts on the same message serialize.
    pub async fn mutate_message(
        &self,
        id: Uuid,
        mutation: &MessageMutation,
        at: DateTime<Utc>,
    ) -> Result<Option<MutationOutcome>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut message = Message::try_from(row)?;
        let change = mutation.apply(&mut message, at);
        if change.is_change() {
            sqlx::query(
                r#"
                UPDATE messages
                SET body = $2, read_by = $3, reactions = $4, edited = $5, edited_at = $6, deleted = $7
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(&message.text)
            .bind(Json(&message.read_by))
            .bind(Json(&message.reactions))
            .bind(message.edited)
            .bind(message.edited_at)
            .bind(message.deleted)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("updating message {id}"))?;
        }
        tx.commit().await?;

        Ok(Some(MutationOutcome { message, change }))
    }

    /// Adds the receipt to every message in the channel the reader neither sent
    /// nor read yet. Returns the number of messages touched.
    pub async fn mark_channel_read(&self, channel: ChannelId, receipt: &ReadReceipt) -> Result<u64> {
        let probe = json!([{ "userId": receipt.user_id }]);
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET read_by = read_by || $2
            WHERE channel_id = $1
              AND NOT deleted
              AND sender_id <> $3
              AND NOT (read_by @> $4)
            "#,
        )
        .bind(channel.to_string())
        .bind(Json(vec![receipt]))
        .bind(receipt.user_id)
        .bind(probe)
        .execute(self.pool.pool())
        .await
        .with_context(|| format!("marking {channel} read for {}", receipt.user_id))?;
        Ok(result.rows_affected())
    }

    pub async fn clear_messages(&self, channel: ChannelId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE channel_id = $1")
            .bind(channel.to_string())
            .execute(self.pool.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::{
        channel::ChannelDraft,
        identity::Role,
        message::{MessageChange, MessageDraft},
    };
    use sqlx::postgres::PgPoolOptions;
    use std::env;

    async fn repository() -> Option<Arc<ChatRepository>> {
        let url = env::var("HUDDLE_TEST_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()?;
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .ok()?;
        crate::MIGRATOR.run(&pool).await.ok()?;
        Some(ChatRepository::new(StoragePool::new(pool)))
    }

    fn text(channel: ChannelId, sender: &Identity, body: &str) -> Message {
        let draft = MessageDraft::new(Some(body.into()), MessageContent::Text, 4000).unwrap();
        Message::compose(channel, sender, draft, Utc::now())
    }

    #[tokio::test]
    async fn channel_lifecycle_round_trips() -> Result<()> {
        let Some(repo) = repository().await else {
            eprintln!("skipping chat repository test: set HUDDLE_TEST_DATABASE_URL or DATABASE_URL");
            return Ok(());
        };

        let team = Uuid::new_v4();
        let lead = Identity::new(Uuid::new_v4(), "lead", Role::TeamLead, Some(team));
        let channel = ChannelDraft {
            name: format!("design-{}", Uuid::new_v4().simple()),
            display_name: None,
            description: None,
            kind: ChannelKind::Team,
            members: Vec::new(),
            project_id: None,
        }
        .into_channel(&lead, Utc::now())?;
        repo.insert_channel(&channel).await?;
        assert!(matches!(
            repo.insert_channel(&Channel {
                id: ChannelId::Stored(Uuid::new_v4()),
                ..channel.clone()
            })
            .await,
            Err(CreateChannelError::NameTaken)
        ));

        let teammate = Identity::new(Uuid::new_v4(), "mate", Role::Member, Some(team));
        let visible = repo.list_accessible_channels(&teammate).await?;
        assert!(visible.iter().any(|candidate| candidate.id == channel.id));
        let outsider = Identity::new(Uuid::new_v4(), "out", Role::Member, None);
        let hidden = repo.list_accessible_channels(&outsider).await?;
        assert!(hidden.iter().all(|candidate| candidate.id != channel.id));

        let message = text(channel.id, &lead, "kickoff at 3pm");
        repo.insert_message(&message).await?;
        let touched = repo
            .mark_channel_read(channel.id, &ReadReceipt::new(&teammate, Utc::now()))
            .await?;
        assert_eq!(touched, 1);
        let again = repo
            .mark_channel_read(channel.id, &ReadReceipt::new(&teammate, Utc::now()))
            .await?;
        assert_eq!(again, 0);

        let outcome = repo
            .mutate_message(
                message.id,
                &MessageMutation::React {
                    user_id: teammate.user_id,
                    user_name: teammate.user_name.clone(),
                    emoji: "👍".into(),
                },
                Utc::now(),
            )
            .await?
            .expect("message exists");
        assert_eq!(outcome.change, MessageChange::ReactionAdded);
        assert_eq!(outcome.message.read_count(), 2);

        let stored_id = channel.id.stored().expect("stored channel");
        assert!(repo.delete_channel(stored_id).await?);
        assert!(repo.find_message(message.id).await?.is_none());
        assert!(repo.find_channel(stored_id).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn history_skips_deleted_messages() -> Result<()> {
        let Some(repo) = repository().await else {
            eprintln!("skipping chat history test: set HUDDLE_TEST_DATABASE_URL or DATABASE_URL");
            return Ok(());
        };

        let channel = ChannelId::Stored(Uuid::new_v4());
        let sender = Identity::new(Uuid::new_v4(), "ana", Role::Member, None);
        let first = text(channel, &sender, "one");
        let second = text(channel, &sender, "two");
        repo.insert_message(&first).await?;
        repo.insert_message(&second).await?;
        repo.mutate_message(first.id, &MessageMutation::Delete, Utc::now())
            .await?;

        let history = repo.recent_messages(channel, 10).await?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, second.id);

        assert_eq!(repo.clear_messages(channel).await?, 2);
        Ok(())
    }
}
