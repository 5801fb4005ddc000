use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use alyx_core::diff::SchemaDiff;
use alyx_core::hash::{digest_hex, schema_hash};
use alyx_core::types::Schema;

use crate::error::StoreError;
use crate::migrate::run_changes;
use crate::pool::StorePool;
use crate::registry::{RegistrySnapshot, SchemaRegistry};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Lifecycle state of a deployment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Active,
    RolledBack,
    Failed,
}

impl DeploymentStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "rolled_back" => Self::RolledBack,
            _ => Self::Failed,
        }
    }
}

/// One versioned snapshot of (schema, functions).
///
/// Exactly one record is `active` at any time; the deployer's single
/// transaction demotes the old active and inserts the new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub version: u64,
    pub schema_hash: String,
    pub functions_hash: String,
    pub schema_snapshot: String,
    /// Function file name to source.
    pub functions_snapshot: BTreeMap<String, String>,
    pub status: DeploymentStatus,
    pub rollback_to: Option<u64>,
    pub deployed_at: DateTime<Utc>,
    pub deployed_by: String,
    pub description: String,
}

impl DeploymentRecord {
    /// The wire version label (`"v3"`).
    pub fn version_label(&self) -> String {
        format!("v{}", self.version)
    }
}

/// The input to `execute`: schema text plus the function files to ship.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployBundle {
    pub schema_text: String,
    pub schema_hash: String,
    /// Function file name to source.
    #[serde(default)]
    pub functions: BTreeMap<String, String>,
    #[serde(default)]
    pub description: String,
}

// ---------------------------------------------------------------------------
// Deployer
// ---------------------------------------------------------------------------

/// Atomic deployment execution and rollback.
pub struct Deployer {
    pool: Arc<StorePool>,
    registry: Arc<SchemaRegistry>,
    /// Where function sources are written; `None` skips file output.
    functions_dir: Option<PathBuf>,
    lock: Mutex<()>,
}

impl Deployer {
    pub fn new(
        pool: Arc<StorePool>,
        registry: Arc<SchemaRegistry>,
        functions_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            pool,
            registry,
            functions_dir,
            lock: Mutex::new(()),
        }
    }

    /// Executes a deployment bundle.
    ///
    /// Compares the bundle against the live schema, rejects when any
    /// change is unsafe and `force` is false (with the full change
    /// summary), applies the safe changes, writes function files,
    /// demotes the current active record, and inserts the new one -
    /// the record writes and the DDL share one transaction.
    pub fn execute(
        &self,
        bundle: &DeployBundle,
        force: bool,
        deployed_by: &str,
    ) -> Result<DeploymentRecord, StoreError> {
        let _guard = self.lock.lock();

        let mut target = Schema::parse(&bundle.schema_text)?;
        target.validate()?;

        let computed_hash = schema_hash(&target);
        if bundle.schema_hash != computed_hash {
            return Err(StoreError::Internal {
                message: format!(
                    "bundle hash mismatch: declared {}, computed {}",
                    bundle.schema_hash, computed_hash
                ),
            });
        }

        let current = self.registry.load();
        let changes = SchemaDiff::diff(&current.schema, &target);
        if !changes.is_safe() && !force {
            let summary: Vec<String> =
                changes.unsafe_changes().map(|c| c.to_string()).collect();
            return Err(StoreError::UnsafeChanges {
                summary: summary.join("\n"),
            });
        }

        // Compile first; a rule failure must not leave a half deployment.
        let snapshot = RegistrySnapshot::compile(target)?;

        self.write_function_files(&bundle.functions)?;

        let functions_hash = functions_hash(&bundle.functions);
        let record = {
            let conn = self.pool.write();
            conn.execute_batch("BEGIN IMMEDIATE")
                .map_err(internal_sql)?;
            let result = (|| -> Result<DeploymentRecord, StoreError> {
                run_changes(&conn, changes.safe_changes())?;

                conn.execute(
                    "UPDATE _alyx_deployments SET status = 'rolled_back' WHERE status = 'active'",
                    [],
                )
                .map_err(internal_sql)?;

                let version = next_version(&conn)?;
                let record = DeploymentRecord {
                    version,
                    schema_hash: snapshot.hash.clone(),
                    functions_hash,
                    schema_snapshot: bundle.schema_text.clone(),
                    functions_snapshot: bundle.functions.clone(),
                    status: DeploymentStatus::Active,
                    rollback_to: None,
                    deployed_at: Utc::now(),
                    deployed_by: deployed_by.to_string(),
                    description: bundle.description.clone(),
                };
                insert_record(&conn, &record)?;
                Ok(record)
            })();

            match result {
                Ok(record) => {
                    if let Err(e) = conn.execute_batch("COMMIT") {
                        let _ = conn.execute_batch("ROLLBACK");
                        return Err(internal_sql(e));
                    }
                    record
                }
                Err(err) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    warn!(error = %err, "deployment rolled back");
                    return Err(err);
                }
            }
        };

        self.registry.swap(snapshot);
        info!(version = record.version, by = deployed_by, "deployment active");
        Ok(record)
    }

    /// Re-enters the deploy path with a prior record's snapshots as
    /// the target. The new active record points back at the restored
    /// version via `rollback_to`.
    pub fn rollback(
        &self,
        version: u64,
        deployed_by: &str,
    ) -> Result<DeploymentRecord, StoreError> {
        let prior = self
            .find(version)?
            .ok_or_else(|| StoreError::UnknownDeployment {
                version: format!("v{version}"),
            })?;

        let bundle = DeployBundle {
            schema_hash: {
                let mut schema = Schema::parse(&prior.schema_snapshot)?;
                schema.validate()?;
                schema_hash(&schema)
            },
            schema_text: prior.schema_snapshot.clone(),
            functions: prior.functions_snapshot.clone(),
            description: format!("rollback to v{version}"),
        };

        // Rolling back across an unsafe boundary (the old schema may
        // drop what the new one added) is an explicit operator action.
        let mut record = self.execute(&bundle, true, deployed_by)?;
        {
            let conn = self.pool.write();
            conn.execute(
                "UPDATE _alyx_deployments SET rollback_to = ?1 WHERE version = ?2",
                params![version, record.version],
            )
            .map_err(internal_sql)?;
        }
        record.rollback_to = Some(version);
        Ok(record)
    }

    /// The single active record, if any deployment has happened.
    pub fn active(&self) -> Result<Option<DeploymentRecord>, StoreError> {
        let conn = self.pool.read();
        query_one(
            &conn,
            "SELECT version, schema_hash, functions_hash, schema_snapshot, functions_snapshot,
                    status, rollback_to, deployed_at, deployed_by, description
             FROM _alyx_deployments WHERE status = 'active'",
            [],
        )
    }

    /// A record by version.
    pub fn find(&self, version: u64) -> Result<Option<DeploymentRecord>, StoreError> {
        let conn = self.pool.read();
        query_one(
            &conn,
            "SELECT version, schema_hash, functions_hash, schema_snapshot, functions_snapshot,
                    status, rollback_to, deployed_at, deployed_by, description
             FROM _alyx_deployments WHERE version = ?1",
            params![version],
        )
    }

    /// All records, newest first.
    pub fn list(&self) -> Result<Vec<DeploymentRecord>, StoreError> {
        let conn = self.pool.read();
        let mut stmt = conn
            .prepare(
                "SELECT version, schema_hash, functions_hash, schema_snapshot, functions_snapshot,
                        status, rollback_to, deployed_at, deployed_by, description
                 FROM _alyx_deployments ORDER BY version DESC",
            )
            .map_err(internal_sql)?;
        let rows = stmt
            .query_map([], record_from_row)
            .map_err(internal_sql)?;
        rows.collect::<Result<_, _>>().map_err(internal_sql)
    }

    fn write_function_files(
        &self,
        functions: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let Some(dir) = &self.functions_dir else {
            return Ok(());
        };
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Internal {
            message: format!("create functions dir: {e}"),
        })?;
        for (name, source) in functions {
            // File names come from the operator's bundle; refuse
            // anything that escapes the directory.
            if name.contains("..") || name.contains('/') || name.contains('\\') {
                return Err(StoreError::Internal {
                    message: format!("function file name '{name}' is not a plain file name"),
                });
            }
            std::fs::write(dir.join(name), source).map_err(|e| StoreError::Internal {
                message: format!("write function file '{name}': {e}"),
            })?;
        }
        Ok(())
    }
}

/// Canonical hash over the function file map.
pub fn functions_hash(functions: &BTreeMap<String, String>) -> String {
    let canonical = serde_json::to_vec(functions).expect("function map serializes");
    digest_hex(&canonical)
}

fn next_version(conn: &Connection) -> Result<u64, StoreError> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) + 1 FROM _alyx_deployments",
        [],
        |row| row.get(0),
    )
    .map_err(internal_sql)
}

fn insert_record(conn: &Connection, record: &DeploymentRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO _alyx_deployments
            (version, schema_hash, functions_hash, schema_snapshot, functions_snapshot,
             status, rollback_to, deployed_at, deployed_by, description)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            record.version,
            record.schema_hash,
            record.functions_hash,
            record.schema_snapshot,
            serde_json::to_string(&record.functions_snapshot).expect("map serializes"),
            record.status.as_str(),
            record.rollback_to,
            record.deployed_at.to_rfc3339(),
            record.deployed_by,
            record.description,
        ],
    )
    .map_err(internal_sql)?;
    Ok(())
}

fn query_one<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Option<DeploymentRecord>, StoreError> {
    conn.query_row(sql, params, record_from_row)
        .optional()
        .map_err(internal_sql)
}

fn record_from_row(row: &rusqlite::Row<'_>) -> Result<DeploymentRecord, rusqlite::Error> {
    let functions_json: String = row.get(4)?;
    let deployed_at: String = row.get(7)?;
    let status: String = row.get(5)?;
    Ok(DeploymentRecord {
        version: row.get(0)?,
        schema_hash: row.get(1)?,
        functions_hash: row.get(2)?,
        schema_snapshot: row.get(3)?,
        functions_snapshot: serde_json::from_str(&functions_json).unwrap_or_default(),
        status: DeploymentStatus::parse(&status),
        rollback_to: row.get(6)?,
        deployed_at: DateTime::parse_from_rfc3339(&deployed_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        deployed_by: row.get(8)?,
        description: row.get(9)?,
    })
}

fn internal_sql(err: rusqlite::Error) -> StoreError {
    StoreError::Internal {
        message: err.to_string(),
    }
}
