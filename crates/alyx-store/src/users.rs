use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::pool::StorePool;

/// A runtime account row (`_alyx_users`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub verified: bool,
    pub role: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRecord {
    /// The claims object policy rules see as `auth`.
    pub fn claims(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "email": self.email,
            "verified": self.verified,
            "role": self.role,
            "metadata": self.metadata,
        })
    }
}

/// CRUD over `_alyx_users`. Password hashing happens in the auth
/// layer; this store only persists the hash.
pub struct UserStore {
    pool: Arc<StorePool>,
}

impl UserStore {
    pub fn new(pool: Arc<StorePool>) -> Self {
        Self { pool }
    }

    pub fn create(
        &self,
        email: &str,
        password_hash: &str,
        role: &str,
    ) -> Result<UserRecord, StoreError> {
        let now = Utc::now();
        let record = UserRecord {
            id: uuid::Uuid::new_v4().to_string(),
            email: email.to_lowercase(),
            password_hash: password_hash.to_string(),
            verified: false,
            role: role.to_string(),
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };
        self.pool
            .write()
            .execute(
                "INSERT INTO _alyx_users
                    (id, email, password_hash, verified, role, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id,
                    record.email,
                    record.password_hash,
                    record.verified,
                    record.role,
                    record.metadata.to_string(),
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| StoreError::classify("_alyx_users", e))?;
        Ok(record)
    }

    pub fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        self.pool
            .read()
            .query_row(
                "SELECT id, email, password_hash, verified, role, metadata, created_at, updated_at
                 FROM _alyx_users WHERE email = ?1",
                params![email.to_lowercase()],
                user_from_row,
            )
            .optional()
            .map_err(|e| StoreError::classify("_alyx_users", e))
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<UserRecord>, StoreError> {
        self.pool
            .read()
            .query_row(
                "SELECT id, email, password_hash, verified, role, metadata, created_at, updated_at
                 FROM _alyx_users WHERE id = ?1",
                params![id],
                user_from_row,
            )
            .optional()
            .map_err(|e| StoreError::classify("_alyx_users", e))
    }

    /// Links (or returns the existing link for) an OAuth identity.
    pub fn link_oauth(
        &self,
        user_id: &str,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<(), StoreError> {
        self.pool
            .write()
            .execute(
                "INSERT OR IGNORE INTO _alyx_oauth_accounts
                    (id, user_id, provider, provider_user_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    user_id,
                    provider,
                    provider_user_id,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| StoreError::classify("_alyx_oauth_accounts", e))?;
        Ok(())
    }

    /// Finds the user linked to an OAuth identity.
    pub fn find_by_oauth(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<Option<UserRecord>, StoreError> {
        self.pool
            .read()
            .query_row(
                "SELECT u.id, u.email, u.password_hash, u.verified, u.role, u.metadata,
                        u.created_at, u.updated_at
                 FROM _alyx_users u
                 JOIN _alyx_oauth_accounts o ON o.user_id = u.id
                 WHERE o.provider = ?1 AND o.provider_user_id = ?2",
                params![provider, provider_user_id],
                user_from_row,
            )
            .optional()
            .map_err(|e| StoreError::classify("_alyx_users", e))
    }
}

fn user_from_row(row: &Row<'_>) -> Result<UserRecord, rusqlite::Error> {
    let metadata: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(UserRecord {
        id: row.get(0)?,
        email: row.get(1)?,
        password_hash: row.get(2)?,
        verified: row.get(3)?,
        role: row.get(4)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        created_at: parse_time(&created_at),
        updated_at: parse_time(&updated_at),
    })
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system;

    fn store() -> UserStore {
        let pool = StorePool::open_in_memory().unwrap();
        system::bootstrap(&pool.write()).unwrap();
        UserStore::new(pool)
    }

    #[test]
    fn create_and_find_by_email_case_insensitive() {
        let store = store();
        let created = store.create("User@Example.COM", "hash", "user").unwrap();
        assert_eq!(created.email, "user@example.com");

        let found = store.find_by_email("user@example.com").unwrap().unwrap();
        assert_eq!(found.id, created.id);
        assert!(!found.verified);
    }

    #[test]
    fn duplicate_email_is_conflict() {
        let store = store();
        store.create("a@b.com", "h", "user").unwrap();
        let err = store.create("a@b.com", "h", "user").unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation { .. }));
    }

    #[test]
    fn claims_shape() {
        let store = store();
        let user = store.create("a@b.com", "h", "admin").unwrap();
        let claims = user.claims();
        assert_eq!(claims["email"], "a@b.com");
        assert_eq!(claims["role"], "admin");
        assert_eq!(claims["verified"], false);
        assert!(claims.get("password_hash").is_none());
    }

    #[test]
    fn oauth_link_and_lookup() {
        let store = store();
        let user = store.create("a@b.com", "h", "user").unwrap();
        store.link_oauth(&user.id, "github", "gh-123").unwrap();

        let found = store.find_by_oauth("github", "gh-123").unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert!(store.find_by_oauth("github", "other").unwrap().is_none());
    }
}
