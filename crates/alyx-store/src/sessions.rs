use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};

use alyx_core::hash::digest_hex;

use crate::error::StoreError;
use crate::pool::StorePool;

/// A refresh-token session row (`_alyx_sessions`).
///
/// Only the token's hash is stored; the raw token exists once, in the
/// login/refresh response.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Refresh-token persistence with rotation.
pub struct SessionStore {
    pool: Arc<StorePool>,
}

impl SessionStore {
    pub fn new(pool: Arc<StorePool>) -> Self {
        Self { pool }
    }

    /// Creates a session for a freshly issued refresh token.
    pub fn create(
        &self,
        user_id: &str,
        refresh_token: &str,
        ttl: Duration,
    ) -> Result<SessionRecord, StoreError> {
        let record = SessionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            expires_at: Utc::now() + ttl,
        };
        self.pool
            .write()
            .execute(
                "INSERT INTO _alyx_sessions
                    (id, user_id, refresh_token_hash, expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.id,
                    record.user_id,
                    digest_hex(refresh_token.as_bytes()),
                    record.expires_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| StoreError::classify("_alyx_sessions", e))?;
        Ok(record)
    }

    /// Looks up a live session by raw refresh token. Expired sessions
    /// are treated as absent (and lazily deleted).
    pub fn find_live(&self, refresh_token: &str) -> Result<Option<SessionRecord>, StoreError> {
        let hash = digest_hex(refresh_token.as_bytes());
        let found = self
            .pool
            .read()
            .query_row(
                "SELECT id, user_id, expires_at FROM _alyx_sessions
                 WHERE refresh_token_hash = ?1",
                params![hash],
                |row| {
                    let expires: String = row.get(2)?;
                    Ok(SessionRecord {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        expires_at: DateTime::parse_from_rfc3339(&expires)
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                    })
                },
            )
            .optional()
            .map_err(|e| StoreError::classify("_alyx_sessions", e))?;

        match found {
            Some(session) if session.expires_at > Utc::now() => Ok(Some(session)),
            Some(session) => {
                self.delete(&session.id)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Rotates a session: the old refresh token stops working, the new
    /// one takes over the same session row with a fresh expiry.
    pub fn rotate(
        &self,
        session_id: &str,
        new_refresh_token: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let changed = self
            .pool
            .write()
            .execute(
                "UPDATE _alyx_sessions
                 SET refresh_token_hash = ?1, expires_at = ?2
                 WHERE id = ?3",
                params![
                    digest_hex(new_refresh_token.as_bytes()),
                    (Utc::now() + ttl).to_rfc3339(),
                    session_id,
                ],
            )
            .map_err(|e| StoreError::classify("_alyx_sessions", e))?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                collection: "_alyx_sessions".to_string(),
                id: session_id.to_string(),
            });
        }
        Ok(())
    }

    /// Deletes one session (logout).
    pub fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        self.pool
            .write()
            .execute(
                "DELETE FROM _alyx_sessions WHERE id = ?1",
                params![session_id],
            )
            .map_err(|e| StoreError::classify("_alyx_sessions", e))?;
        Ok(())
    }

    /// Deletes every session of a user.
    pub fn delete_for_user(&self, user_id: &str) -> Result<u64, StoreError> {
        let deleted = self
            .pool
            .write()
            .execute(
                "DELETE FROM _alyx_sessions WHERE user_id = ?1",
                params![user_id],
            )
            .map_err(|e| StoreError::classify("_alyx_sessions", e))?;
        Ok(deleted as u64)
    }
}
