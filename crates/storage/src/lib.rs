//! Storage helpers for Postgres access.

use std::sync::Arc;

use anyhow::Result;
use sqlx::{migrate::Migrator, postgres::PgPoolOptions};

pub mod chat;
pub mod user;

pub use sqlx::PgPool;

pub use chat::{ChatRepository, CreateChannelError};
pub use user::{CreateUserError, NewUser, UserRecord, UserRepository};

/// Embedded schema migrations.
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Thin wrapper around a shared `PgPool`.
#[derive(Clone)]
pub struct StoragePool {
    pool: Arc<PgPool>,
}

impl StoragePool {
    /// Wrap an existing pool in an `Arc` so it can be cloned safely.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Borrow the underlying `PgPool`.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Clone the shared pool handle.
    pub fn cloned(&self) -> Arc<PgPool> {
        self.pool.clone()
    }
}

impl std::ops::Deref for StoragePool {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        self.pool()
    }
}

pub async fn connect(database_url: &str, max_connections: u32) -> Result<StoragePool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    Ok(StoragePool::new(pool))
}

/// Apply pending migrations.
pub async fn migrate(pool: &StoragePool) -> Result<()> {
    MIGRATOR.run(pool.pool()).await?;
    Ok(())
}

pub fn validate_database_url(database_url: &str) -> Result<()> {
    PgPoolOptions::new()
        .max_connections(1)
        .connect_lazy(database_url)?;
    Ok(())
}
