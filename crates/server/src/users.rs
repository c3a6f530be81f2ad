use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use huddle_core::identity::Identity;
use huddle_storage::{StoragePool, UserRecord, UserRepository};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::SeedUser;

/// Lookup of user records by id or email.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserRecord>>;
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>>;
    async fn list_active(&self) -> Result<Vec<UserRecord>>;
    /// Ids of the active users on a team.
    async fn team_roster(&self, team_id: Uuid) -> Result<Vec<Uuid>>;
}

pub fn identity_of(record: &UserRecord) -> Identity {
    Identity::new(record.id, record.name.clone(), record.role, record.team_id)
}

#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: RwLock<HashMap<Uuid, UserRecord>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(seed: &[SeedUser]) -> Self {
        let now = Utc::now();
        let users = seed
            .iter()
            .map(|user| {
                (
                    user.id,
                    UserRecord {
                        id: user.id,
                        name: user.name.clone(),
                        email: user.email.clone(),
                        role: user.role,
                        team_id: user.team_id,
                        active: true,
                        created_at: now,
                    },
                )
            })
            .collect();
        Self {
            users: RwLock::new(users),
        }
    }

    #[cfg(test)]
    pub async fn insert(&self, record: UserRecord) {
        self.users.write().await.insert(record.id, record);
    }

    /// Adds an active user and returns its record.
    #[cfg(test)]
    pub async fn add_user(
        &self,
        name: &str,
        email: &str,
        role: huddle_core::identity::Role,
        team_id: Option<Uuid>,
    ) -> UserRecord {
        let record = UserRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            email: email.to_string(),
            role,
            team_id,
            active: true,
            created_at: Utc::now(),
        };
        self.insert(record.clone()).await;
        record
    }

    #[cfg(test)]
    pub async fn set_active(&self, id: Uuid, active: bool) -> bool {
        match self.users.write().await.get_mut(&id) {
            Some(record) => {
                record.active = active;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserRecord>> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let email = email.trim();
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|record| record.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn list_active(&self) -> Result<Vec<UserRecord>> {
        let mut users: Vec<_> = self
            .users
            .read()
            .await
            .values()
            .filter(|record| record.active)
            .cloned()
            .collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(users)
    }

    async fn team_roster(&self, team_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .filter(|record| record.active && record.team_id == Some(team_id))
            .map(|record| record.id)
            .collect())
    }
}

#[derive(Clone)]
pub struct DatabaseUserDirectory {
    pool: StoragePool,
}

impl DatabaseUserDirectory {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for DatabaseUserDirectory {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserRecord>> {
        UserRepository::find_by_id(self.pool.pool(), id).await
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        UserRepository::find_by_email(self.pool.pool(), email).await
    }

    async fn list_active(&self) -> Result<Vec<UserRecord>> {
        UserRepository::list_active(self.pool.pool()).await
    }

    async fn team_roster(&self, team_id: Uuid) -> Result<Vec<Uuid>> {
        UserRepository::team_roster(self.pool.pool(), team_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::identity::Role;

    #[tokio::test]
    async fn seeded_directory_resolves_by_id_and_email() {
        let id = Uuid::new_v4();
        let directory = InMemoryUserDirectory::seeded(&[SeedUser {
            id,
            name: "Ana".into(),
            email: "ana@example.org".into(),
            role: Role::TeamLead,
            team_id: None,
        }]);

        let by_id = directory.find_by_id(id).await.unwrap().expect("seeded");
        assert_eq!(by_id.role, Role::TeamLead);
        let by_email = directory
            .find_by_email(" ANA@example.org ")
            .await
            .unwrap()
            .expect("case-insensitive");
        assert_eq!(by_email.id, id);
    }

    #[tokio::test]
    async fn roster_and_listing_skip_inactive_users() {
        let directory = InMemoryUserDirectory::new();
        let team = Uuid::new_v4();
        let ana = directory.add_user("Ana", "ana@x.org", Role::Member, Some(team)).await;
        let bo = directory.add_user("Bo", "bo@x.org", Role::Member, Some(team)).await;
        directory.add_user("Cy", "cy@x.org", Role::Member, None).await;

        assert!(directory.set_active(bo.id, false).await);

        assert_eq!(directory.team_roster(team).await.unwrap(), vec![ana.id]);
        let names: Vec<_> = directory
            .list_active()
            .await
            .unwrap()
            .into_iter()
            .map(|user| user.name)
            .collect();
        assert_eq!(names, vec!["Ana", "Cy"]);
    }

    #[test]
    fn identity_mirrors_record() {
        let record = UserRecord {
            id: Uuid::new_v4(),
            name: "Ana".into(),
            email: "ana@x.org".into(),
            role: Role::Admin,
            team_id: None,
            active: true,
            created_at: Utc::now(),
        };
        let identity = identity_of(&record);
        assert_eq!(identity.user_id, record.id);
        assert!(identity.is_admin());
    }
}
