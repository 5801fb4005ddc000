use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use alyx_core::hash::digest_hex;

use crate::error::StoreError;
use crate::pool::StorePool;

/// Hashed admin bootstrap tokens (`_alyx_admin_tokens`).
///
/// The admin UI is an external collaborator; the core only stores and
/// verifies. Tokens are random, shown once, persisted as hashes.
pub struct AdminTokenStore {
    pool: Arc<StorePool>,
}

impl AdminTokenStore {
    pub fn new(pool: Arc<StorePool>) -> Self {
        Self { pool }
    }

    /// Stores a new token and returns its id.
    pub fn create(&self, token: &str, label: Option<&str>) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.pool
            .write()
            .execute(
                "INSERT INTO _alyx_admin_tokens (id, token_hash, label, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, digest_hex(token.as_bytes()), label, Utc::now().to_rfc3339()],
            )
            .map_err(|e| StoreError::classify("_alyx_admin_tokens", e))?;
        Ok(id)
    }

    /// Verifies a presented token, updating `last_used_at` on success.
    pub fn verify(&self, token: &str) -> Result<bool, StoreError> {
        let hash = digest_hex(token.as_bytes());
        let id: Option<String> = self
            .pool
            .read()
            .query_row(
                "SELECT id FROM _alyx_admin_tokens WHERE token_hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::classify("_alyx_admin_tokens", e))?;

        match id {
            Some(id) => {
                self.pool
                    .write()
                    .execute(
                        "UPDATE _alyx_admin_tokens SET last_used_at = ?1 WHERE id = ?2",
                        params![Utc::now().to_rfc3339(), id],
                    )
                    .map_err(|e| StoreError::classify("_alyx_admin_tokens", e))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Revokes a token by id.
    pub fn revoke(&self, id: &str) -> Result<(), StoreError> {
        self.pool
            .write()
            .execute("DELETE FROM _alyx_admin_tokens WHERE id = ?1", params![id])
            .map_err(|e| StoreError::classify("_alyx_admin_tokens", e))?;
        Ok(())
    }
}

/// Upload placeholder rows (`_alyx_uploads`).
///
/// The chunked-upload state machine lives in a collaborator; the core
/// records the upload's identity and terminal status so bucket policy
/// and retention can see it.
pub struct UploadStore {
    pool: Arc<StorePool>,
}

impl UploadStore {
    pub fn new(pool: Arc<StorePool>) -> Self {
        Self { pool }
    }

    /// Registers a pending upload and returns its id.
    pub fn begin(
        &self,
        bucket: &str,
        name: &str,
        size: u64,
        content_type: &str,
    ) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.pool
            .write()
            .execute(
                "INSERT INTO _alyx_uploads
                    (id, bucket, name, size, content_type, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
                params![id, bucket, name, size, content_type, Utc::now().to_rfc3339()],
            )
            .map_err(|e| StoreError::classify("_alyx_uploads", e))?;
        Ok(id)
    }

    /// Marks an upload complete.
    pub fn complete(&self, id: &str) -> Result<(), StoreError> {
        let changed = self
            .pool
            .write()
            .execute(
                "UPDATE _alyx_uploads SET status = 'complete', completed_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id],
            )
            .map_err(|e| StoreError::classify("_alyx_uploads", e))?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                collection: "_alyx_uploads".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}
