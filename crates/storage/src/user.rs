use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use huddle_core::identity::Role;
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use uuid::Uuid;

/// Repository utilities for the user directory.
pub struct UserRepository;

#[derive(Debug, Error)]
pub enum CreateUserError {
    #[error("email already registered")]
    EmailTaken,
    #[error("failed to create user: {0}")]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub team_id: Option<Uuid>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub role: Role,
    pub team_id: Option<Uuid>,
}

#[derive(FromRow)]
struct UserRow {
    id: Uuid,
    name: String,
    email: String,
    role: String,
    team_id: Option<Uuid>,
    active: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for UserRecord {
    type Error = anyhow::Error;

    fn try_from(row: UserRow) -> Result<Self> {
        let role = row
            .role
            .parse()
            .with_context(|| format!("user {} has an invalid role", row.id))?;
        Ok(UserRecord {
            id: row.id,
            name: row.name,
            email: row.email,
            role,
            team_id: row.team_id,
            active: row.active,
            created_at: row.created_at,
        })
    }
}

impl UserRepository {
    pub async fn create_user(pool: &PgPool, user: &NewUser) -> Result<Uuid, CreateUserError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO users (id, name, email, role, team_id)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(user.name.trim())
        .bind(user.email.trim())
        .bind(user.role.as_str())
        .bind(user.team_id)
        .execute(pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err) if matches!(db_err.code(), Some(code) if code.as_ref() == "23505") => {
                CreateUserError::EmailTaken
            }
            other => CreateUserError::Other(
                anyhow!(other).context(format!("creating user '{}'", user.email)),
            ),
        })?;

        Ok(id)
    }

    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<UserRecord>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, name, email, role, team_id, active, created_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("querying user {id}"))?;
        row.map(UserRecord::try_from).transpose()
    }

    pub async fn find_by_email(pool: &PgPool, email: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, name, email, role, team_id, active, created_at
            FROM users
            WHERE LOWER(email) = LOWER($1)
            "#,
        )
        .bind(email.trim())
        .fetch_optional(pool)
        .await
        .with_context(|| format!("querying user '{email}'"))?;
        row.map(UserRecord::try_from).transpose()
    }

    pub async fn list_active(pool: &PgPool) -> Result<Vec<UserRecord>> {
        let rows = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, name, email, role, team_id, active, created_at
            FROM users
            WHERE active
            ORDER BY name ASC
            "#,
        )
        .fetch_all(pool)
        .await?;
        rows.into_iter().map(UserRecord::try_from).collect()
    }

    /// Ids of the active users on a team.
    pub async fn team_roster(pool: &PgPool, team_id: Uuid) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM users WHERE team_id = $1 AND active
            "#,
        )
        .bind(team_id)
        .fetch_all(pool)
        .await
        .with_context(|| format!("loading roster of team {team_id}"))?;
        Ok(ids)
    }

    pub async fn set_active(pool: &PgPool, id: Uuid, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE users SET active = $2 WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
