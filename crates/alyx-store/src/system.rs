use rusqlite::Connection;
use tracing::debug;

use crate::error::StoreError;

/// Creates the runtime's own tables. Idempotent; runs at every boot
/// before anything else touches the database.
///
/// User collections live in top-level tables named after themselves;
/// everything the runtime owns is prefixed `_alyx_`.
pub fn bootstrap(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS _alyx_migrations (
            version     INTEGER PRIMARY KEY,
            name        TEXT NOT NULL,
            applied_at  TEXT NOT NULL,
            checksum    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS _alyx_users (
            id             TEXT PRIMARY KEY,
            email          TEXT NOT NULL UNIQUE,
            password_hash  TEXT NOT NULL,
            verified       INTEGER NOT NULL DEFAULT 0,
            role           TEXT NOT NULL DEFAULT 'user',
            metadata       TEXT NOT NULL DEFAULT '{}',
            created_at     TEXT NOT NULL,
            updated_at     TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS _alyx_sessions (
            id                  TEXT PRIMARY KEY,
            user_id             TEXT NOT NULL REFERENCES _alyx_users (id) ON DELETE CASCADE,
            refresh_token_hash  TEXT NOT NULL UNIQUE,
            expires_at          TEXT NOT NULL,
            created_at          TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_alyx_sessions_user
            ON _alyx_sessions (user_id);

        CREATE TABLE IF NOT EXISTS _alyx_oauth_accounts (
            id                TEXT PRIMARY KEY,
            user_id           TEXT NOT NULL REFERENCES _alyx_users (id) ON DELETE CASCADE,
            provider          TEXT NOT NULL,
            provider_user_id  TEXT NOT NULL,
            created_at        TEXT NOT NULL,
            UNIQUE (provider, provider_user_id)
        );

        CREATE TABLE IF NOT EXISTS _alyx_deployments (
            version             INTEGER PRIMARY KEY,
            schema_hash         TEXT NOT NULL,
            functions_hash      TEXT NOT NULL,
            schema_snapshot     TEXT NOT NULL,
            functions_snapshot  TEXT NOT NULL,
            status              TEXT NOT NULL,
            rollback_to         INTEGER,
            deployed_at         TEXT NOT NULL,
            deployed_by         TEXT NOT NULL,
            description         TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS _alyx_admin_tokens (
            id            TEXT PRIMARY KEY,
            token_hash    TEXT NOT NULL UNIQUE,
            label         TEXT,
            created_at    TEXT NOT NULL,
            last_used_at  TEXT
        );

        CREATE TABLE IF NOT EXISTS _alyx_uploads (
            id            TEXT PRIMARY KEY,
            bucket        TEXT NOT NULL,
            name          TEXT,
            size          INTEGER,
            content_type  TEXT,
            status        TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            completed_at  TEXT
        );

        CREATE TABLE IF NOT EXISTS _alyx_executions (
            id            TEXT PRIMARY KEY,
            function_id   TEXT NOT NULL,
            request_id    TEXT,
            trigger_type  TEXT NOT NULL,
            trigger_id    TEXT,
            status        TEXT NOT NULL,
            started_at    TEXT NOT NULL,
            completed_at  TEXT,
            duration_ms   INTEGER,
            input         TEXT,
            output        TEXT,
            error         TEXT,
            logs          TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_alyx_executions_function
            ON _alyx_executions (function_id, started_at);
        "#,
    )
    .map_err(|e| StoreError::Internal {
        message: format!("bootstrap failed: {e}"),
    })?;
    debug!("system tables ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::StorePool;

    #[test]
    fn bootstrap_is_idempotent() {
        let pool = StorePool::open_in_memory().unwrap();
        bootstrap(&pool.write()).unwrap();
        bootstrap(&pool.write()).unwrap();

        let count: i64 = pool
            .read()
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name LIKE '_alyx_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 8);
    }

    #[test]
    fn sessions_cascade_with_user() {
        let pool = StorePool::open_in_memory().unwrap();
        bootstrap(&pool.write()).unwrap();
        let conn = pool.write();
        conn.execute(
            "INSERT INTO _alyx_users (id, email, password_hash, created_at, updated_at)
             VALUES ('u1', 'a@b.com', 'x', 'now', 'now')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO _alyx_sessions (id, user_id, refresh_token_hash, expires_at, created_at)
             VALUES ('s1', 'u1', 'h', 'later', 'now')",
            [],
        )
        .unwrap();
        conn.execute("DELETE FROM _alyx_users WHERE id = 'u1'", [])
            .unwrap();
        let sessions: i64 = conn
            .query_row("SELECT count(*) FROM _alyx_sessions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(sessions, 0);
    }
}
