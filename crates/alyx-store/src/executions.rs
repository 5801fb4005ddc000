use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::pool::StorePool;

/// Terminal and in-flight states of a function invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    TimedOut,
    Canceled,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Canceled => "canceled",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "success" => Self::Success,
            "timed_out" => Self::TimedOut,
            "canceled" => Self::Canceled,
            _ => Self::Failed,
        }
    }

    /// Terminal records are eligible for retention cleanup.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// One row of the execution ledger (`_alyx_executions`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub function_id: String,
    pub request_id: Option<String>,
    pub trigger_type: String,
    pub trigger_id: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub logs: Vec<String>,
}

/// Append-mostly persistence for the execution ledger.
pub struct ExecutionStore {
    pool: Arc<StorePool>,
}

impl ExecutionStore {
    pub fn new(pool: Arc<StorePool>) -> Self {
        Self { pool }
    }

    /// Appends a `running` row at invocation start.
    pub fn begin(
        &self,
        function_id: &str,
        request_id: Option<&str>,
        trigger_type: &str,
        trigger_id: Option<&str>,
        input: Option<&serde_json::Value>,
    ) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.pool
            .write()
            .execute(
                "INSERT INTO _alyx_executions
                    (id, function_id, request_id, trigger_type, trigger_id,
                     status, started_at, input, logs)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'running', ?6, ?7, '[]')",
                params![
                    id,
                    function_id,
                    request_id,
                    trigger_type,
                    trigger_id,
                    Utc::now().to_rfc3339(),
                    input.map(|v| v.to_string()),
                ],
            )
            .map_err(|e| StoreError::classify("_alyx_executions", e))?;
        Ok(id)
    }

    /// Finalizes a row with its terminal state.
    pub fn finish(
        &self,
        id: &str,
        status: ExecutionStatus,
        duration_ms: u64,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
        logs: &[String],
    ) -> Result<(), StoreError> {
        self.pool
            .write()
            .execute(
                "UPDATE _alyx_executions
                 SET status = ?1, completed_at = ?2, duration_ms = ?3,
                     output = ?4, error = ?5, logs = ?6
                 WHERE id = ?7",
                params![
                    status.as_str(),
                    Utc::now().to_rfc3339(),
                    duration_ms,
                    output.map(|v| v.to_string()),
                    error,
                    serde_json::to_string(logs).unwrap_or_else(|_| "[]".to_string()),
                    id,
                ],
            )
            .map_err(|e| StoreError::classify("_alyx_executions", e))?;
        Ok(())
    }

    pub fn find(&self, id: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        self.pool
            .read()
            .query_row(
                "SELECT id, function_id, request_id, trigger_type, trigger_id, status,
                        started_at, completed_at, duration_ms, input, output, error, logs
                 FROM _alyx_executions WHERE id = ?1",
                params![id],
                record_from_row,
            )
            .optional()
            .map_err(|e| StoreError::classify("_alyx_executions", e))
    }

    /// Recent records for a function, newest first.
    pub fn recent(
        &self,
        function_id: &str,
        limit: u32,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let conn = self.pool.read();
        let mut stmt = conn
            .prepare(
                "SELECT id, function_id, request_id, trigger_type, trigger_id, status,
                        started_at, completed_at, duration_ms, input, output, error, logs
                 FROM _alyx_executions WHERE function_id = ?1
                 ORDER BY started_at DESC LIMIT ?2",
            )
            .map_err(|e| StoreError::classify("_alyx_executions", e))?;
        let rows = stmt
            .query_map(params![function_id, limit], record_from_row)
            .map_err(|e| StoreError::classify("_alyx_executions", e))?;
        rows.collect::<Result<_, _>>()
            .map_err(|e| StoreError::classify("_alyx_executions", e))
    }

    /// Deletes terminal records older than the retention window.
    /// Returns the number removed; the retention worker calls this on
    /// a fixed cadence.
    pub fn sweep(&self, retain: Duration) -> Result<u64, StoreError> {
        let cutoff = (Utc::now() - retain).to_rfc3339();
        let deleted = self
            .pool
            .write()
            .execute(
                "DELETE FROM _alyx_executions
                 WHERE started_at < ?1
                   AND status IN ('success', 'failed', 'timed_out', 'canceled')",
                params![cutoff],
            )
            .map_err(|e| StoreError::classify("_alyx_executions", e))?;
        Ok(deleted as u64)
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> Result<ExecutionRecord, rusqlite::Error> {
    let status: String = row.get(5)?;
    let started_at: String = row.get(6)?;
    let completed_at: Option<String> = row.get(7)?;
    let input: Option<String> = row.get(9)?;
    let output: Option<String> = row.get(10)?;
    let logs: Option<String> = row.get(12)?;
    Ok(ExecutionRecord {
        id: row.get(0)?,
        function_id: row.get(1)?,
        request_id: row.get(2)?,
        trigger_type: row.get(3)?,
        trigger_id: row.get(4)?,
        status: ExecutionStatus::parse(&status),
        started_at: parse_time(&started_at),
        completed_at: completed_at.as_deref().map(parse_time),
        duration_ms: row.get(8)?,
        input: input.and_then(|s| serde_json::from_str(&s).ok()),
        output: output.and_then(|s| serde_json::from_str(&s).ok()),
        error: row.get(11)?,
        logs: logs
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
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

    fn store() -> ExecutionStore {
        let pool = StorePool::open_in_memory().unwrap();
        system::bootstrap(&pool.write()).unwrap();
        ExecutionStore::new(pool)
    }

    #[test]
    fn begin_finish_round_trip() {
        let store = store();
        let id = store
            .begin(
                "hello:node",
                Some("req-1"),
                "http",
                None,
                Some(&serde_json::json!({"name": "world"})),
            )
            .unwrap();

        let running = store.find(&id).unwrap().unwrap();
        assert_eq!(running.status, ExecutionStatus::Running);
        assert!(!running.status.is_terminal());

        store
            .finish(
                &id,
                ExecutionStatus::Success,
                42,
                Some(&serde_json::json!({"greeting": "hi"})),
                None,
                &["started".to_string(), "done".to_string()],
            )
            .unwrap();

        let done = store.find(&id).unwrap().unwrap();
        assert_eq!(done.status, ExecutionStatus::Success);
        assert_eq!(done.duration_ms, Some(42));
        assert_eq!(done.logs, vec!["started", "done"]);
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn timed_out_recorded() {
        let store = store();
        let id = store.begin("slow:node", None, "http", None, None).unwrap();
        store
            .finish(&id, ExecutionStatus::TimedOut, 100, None, Some("deadline"), &[])
            .unwrap();
        let record = store.find(&id).unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::TimedOut);
        assert_eq!(record.error.as_deref(), Some("deadline"));
    }

    #[test]
    fn sweep_removes_only_old_terminal_records() {
        let store = store();
        let done = store.begin("f:node", None, "http", None, None).unwrap();
        store
            .finish(&done, ExecutionStatus::Success, 1, None, None, &[])
            .unwrap();
        let running = store.begin("f:node", None, "http", None, None).unwrap();

        // Nothing is old enough yet.
        assert_eq!(store.sweep(Duration::days(30)).unwrap(), 0);
        // Everything terminal is older than a negative window.
        assert_eq!(store.sweep(Duration::seconds(-5)).unwrap(), 1);
        assert!(store.find(&done).unwrap().is_none());
        assert!(store.find(&running).unwrap().is_some());
    }

    #[test]
    fn recent_orders_newest_first() {
        let store = store();
        for _ in 0..3 {
            let id = store.begin("f:node", None, "http", None, None).unwrap();
            store
                .finish(&id, ExecutionStatus::Success, 1, None, None, &[])
                .unwrap();
        }
        let rows = store.recent("f:node", 2).unwrap();
        assert_eq!(rows.len(), 2);
    }
}
