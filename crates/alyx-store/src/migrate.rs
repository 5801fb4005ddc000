use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{info, warn};

use alyx_core::diff::{SchemaChange, SchemaDiff};
use alyx_core::hash::digest_hex;
use alyx_core::types::{DefaultValue, Schema};

use crate::ddl::change_to_sql;
use crate::error::StoreError;
use crate::pool::StorePool;
use crate::registry::{RegistrySnapshot, SchemaRegistry};

// ---------------------------------------------------------------------------
// Migrator
// ---------------------------------------------------------------------------

/// Applies safe schema changes and swaps the registry snapshot.
///
/// One mutex serializes migrations; the optimistic hash check turns a
/// lost race into `schema_drift` instead of a silent overwrite.
pub struct Migrator {
    pool: Arc<StorePool>,
    lock: Mutex<()>,
}

impl Migrator {
    pub fn new(pool: Arc<StorePool>) -> Self {
        Self {
            pool,
            lock: Mutex::new(()),
        }
    }

    /// Diffs the registry's current schema against `target`, refuses
    /// if any change is unsafe, applies the safe changes in one
    /// transaction, and swaps the registry.
    ///
    /// `expected_hash` is the schema hash the caller based its target
    /// on. A mismatch with the live registry means someone migrated in
    /// between: `schema_drift`.
    pub fn apply(
        &self,
        registry: &SchemaRegistry,
        expected_hash: &str,
        mut target: Schema,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock();

        let current = registry.load();
        if current.hash != expected_hash {
            return Err(StoreError::SchemaDrift {
                expected: expected_hash.to_string(),
                actual: current.hash.clone(),
            });
        }

        target.validate()?;
        let changes = SchemaDiff::diff(&current.schema, &target);

        if !changes.is_safe() {
            let summary: Vec<String> =
                changes.unsafe_changes().map(|c| c.to_string()).collect();
            return Err(StoreError::UnsafeChanges {
                summary: summary.join("\n"),
            });
        }

        // Compile before touching the database so a bad rule can never
        // leave DDL half-applied with no snapshot to swap in.
        let snapshot = RegistrySnapshot::compile(target)?;

        if !changes.is_empty() {
            let conn = self.pool.write();
            execute_changes(&conn, changes.changes.iter())?;
        }

        info!(
            changes = changes.len(),
            hash = %snapshot.hash,
            "schema migrated"
        );
        registry.swap(snapshot);
        Ok(())
    }
}

/// Runs each change's DDL (plus app-side backfills) inside one
/// transaction on the given connection.
pub(crate) fn execute_changes<'a>(
    conn: &Connection,
    changes: impl Iterator<Item = &'a SchemaChange>,
) -> Result<(), StoreError> {
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| internal(format!("begin migration: {e}")))?;

    match run_changes(conn, changes) {
        Ok(()) => conn.execute_batch("COMMIT").map_err(|e| {
            let _ = conn.execute_batch("ROLLBACK");
            internal(format!("commit migration: {e}"))
        }),
        Err(err) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(err)
        }
    }
}

/// The change runner without transaction management, for callers that
/// bundle DDL with their own bookkeeping writes (deployments).
pub(crate) fn run_changes<'a>(
    conn: &Connection,
    changes: impl Iterator<Item = &'a SchemaChange>,
) -> Result<(), StoreError> {
    for change in changes {
        for sql in change_to_sql(change) {
            conn.execute_batch(&sql)
                .map_err(|e| internal(format!("{sql}: {e}")))?;
        }
        backfill(conn, change)?;
    }
    Ok(())
}

/// `auto` and `now` defaults cannot be expressed as DDL literals;
/// populate existing rows app-side after ADD COLUMN.
fn backfill(conn: &Connection, change: &SchemaChange) -> Result<(), StoreError> {
    let SchemaChange::AddField { collection, field } = change else {
        return Ok(());
    };
    match &field.default {
        Some(DefaultValue::Now) => {
            let now = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
            conn.execute(
                &format!(
                    "UPDATE \"{}\" SET \"{}\" = ?1 WHERE \"{}\" IS NULL",
                    collection, field.name, field.name
                ),
                params![now],
            )
            .map_err(|e| internal(e.to_string()))?;
        }
        Some(DefaultValue::Auto) => {
            // Fresh uuid per existing row.
            let ids: Vec<i64> = {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT rowid FROM \"{}\" WHERE \"{}\" IS NULL",
                        collection, field.name
                    ))
                    .map_err(|e| internal(e.to_string()))?;
                let rows = stmt
                    .query_map([], |row| row.get(0))
                    .map_err(|e| internal(e.to_string()))?;
                rows.collect::<Result<_, _>>()
                    .map_err(|e| internal(e.to_string()))?
            };
            for rowid in ids {
                conn.execute(
                    &format!(
                        "UPDATE \"{}\" SET \"{}\" = ?1 WHERE rowid = ?2",
                        collection, field.name
                    ),
                    params![uuid::Uuid::new_v4().to_string(), rowid],
                )
                .map_err(|e| internal(e.to_string()))?;
            }
        }
        _ => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// File-based migrations
// ---------------------------------------------------------------------------

/// An on-disk migration: ordered SQL with its reverse, versioned by
/// file name (`0001_add_priority.sql`).
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationFile {
    pub version: u64,
    pub name: String,
    pub up_sql: String,
    pub down_sql: String,
    pub checksum: String,
}

impl MigrationFile {
    /// Parses `NNNN_name.sql` content with `-- alyx:up` / `-- alyx:down`
    /// section markers. The checksum covers the raw file bytes.
    pub fn parse(file_name: &str, content: &str) -> Result<Self, StoreError> {
        let stem = file_name
            .strip_suffix(".sql")
            .ok_or_else(|| bad_migration(file_name, "must end in .sql"))?;
        let (version_part, name) = stem
            .split_once('_')
            .ok_or_else(|| bad_migration(file_name, "must be '<version>_<name>.sql'"))?;
        let version: u64 = version_part
            .parse()
            .map_err(|_| bad_migration(file_name, "version must be numeric"))?;

        let up_marker = "-- alyx:up";
        let down_marker = "-- alyx:down";
        let up_start = content
            .find(up_marker)
            .ok_or_else(|| bad_migration(file_name, "missing '-- alyx:up' marker"))?;
        let down_start = content
            .find(down_marker)
            .ok_or_else(|| bad_migration(file_name, "missing '-- alyx:down' marker"))?;

        let up_sql = content[up_start + up_marker.len()..down_start].trim().to_string();
        let down_sql = content[down_start + down_marker.len()..].trim().to_string();

        Ok(Self {
            version,
            name: name.to_string(),
            up_sql,
            down_sql,
            checksum: digest_hex(content.as_bytes()),
        })
    }

    /// Loads every migration file in `dir`, sorted by version.
    pub fn load_dir(dir: &Path) -> Result<Vec<Self>, StoreError> {
        let mut migrations = Vec::new();
        if !dir.exists() {
            return Ok(migrations);
        }
        let entries = std::fs::read_dir(dir).map_err(|e| internal(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| internal(e.to_string()))?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if !file_name.ends_with(".sql") {
                continue;
            }
            let content =
                std::fs::read_to_string(entry.path()).map_err(|e| internal(e.to_string()))?;
            migrations.push(Self::parse(&file_name, &content)?);
        }
        migrations.sort_by_key(|m| m.version);
        Ok(migrations)
    }
}

/// Refuses to serve when a recorded migration's checksum no longer
/// matches the file on disk.
pub fn verify_checksums(conn: &Connection, files: &[MigrationFile]) -> Result<(), StoreError> {
    let mut stmt = conn
        .prepare("SELECT version, name, checksum FROM _alyx_migrations")
        .map_err(|e| internal(e.to_string()))?;
    let recorded: Vec<(u64, String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .map_err(|e| internal(e.to_string()))?
        .collect::<Result<_, _>>()
        .map_err(|e| internal(e.to_string()))?;

    for (version, name, checksum) in recorded {
        match files.iter().find(|f| f.version == version) {
            Some(file) if file.checksum == checksum => {}
            _ => {
                return Err(StoreError::ChecksumMismatch { version, name });
            }
        }
    }
    Ok(())
}

/// Applies every migration file newer than the ledger, each in its own
/// transaction, recording `{version, name, applied_at, checksum}`.
pub fn apply_pending(conn: &Connection, files: &[MigrationFile]) -> Result<u64, StoreError> {
    let current: u64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _alyx_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| internal(e.to_string()))?;

    let mut applied = 0;
    for file in files {
        if file.version <= current {
            continue;
        }

        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| internal(format!("begin v{}: {e}", file.version)))?;

        let result = conn
            .execute_batch(&file.up_sql)
            .map_err(|e| internal(format!("migration v{} '{}': {e}", file.version, file.name)))
            .and_then(|_| {
                conn.execute(
                    "INSERT INTO _alyx_migrations (version, name, applied_at, checksum)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        file.version,
                        file.name,
                        Utc::now().to_rfc3339(),
                        file.checksum
                    ],
                )
                .map_err(|e| internal(e.to_string()))
            });

        match result {
            Ok(_) => {
                conn.execute_batch("COMMIT")
                    .map_err(|e| internal(format!("commit v{}: {e}", file.version)))?;
                info!(version = file.version, name = %file.name, "applied migration");
                applied += 1;
            }
            Err(err) => {
                warn!(version = file.version, error = %err, "migration failed, rolling back");
                let _ = conn.execute_batch("ROLLBACK");
                return Err(err);
            }
        }
    }
    Ok(applied)
}

fn bad_migration(file: &str, reason: &str) -> StoreError {
    StoreError::Internal {
        message: format!("migration file '{file}': {reason}"),
    }
}

fn internal(message: String) -> StoreError {
    StoreError::Internal { message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alyx_core::types::{
        Collection, CollectionName, FieldDefinition, FieldName, FieldType,
    };

    fn schema_with(fields: Vec<FieldDefinition>) -> Schema {
        let mut schema = Schema {
            collections: vec![Collection::new(
                CollectionName::new("tasks").unwrap(),
                fields,
            )],
            ..Schema::default()
        };
        schema.validate().unwrap();
        schema
    }

    fn field(name: &str, ty: FieldType) -> FieldDefinition {
        FieldDefinition::new(FieldName::new(name).unwrap(), ty)
    }

    #[test]
    fn apply_creates_table_and_swaps_registry() {
        let pool = StorePool::open_in_memory().unwrap();
        let registry = SchemaRegistry::empty();
        let migrator = Migrator::new(Arc::clone(&pool));

        let empty_hash = registry.load().hash.clone();
        let target = schema_with(vec![field("title", FieldType::String)]);
        migrator.apply(&registry, &empty_hash, target).unwrap();

        let exists: bool = pool
            .read()
            .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='tasks'")
            .and_then(|mut stmt| stmt.exists([]))
            .unwrap();
        assert!(exists);
        assert_eq!(registry.load().schema.collections.len(), 1);
    }

    #[test]
    fn stale_hash_is_schema_drift() {
        let pool = StorePool::open_in_memory().unwrap();
        let registry = SchemaRegistry::empty();
        let migrator = Migrator::new(pool);

        let result = migrator.apply(
            &registry,
            "0000000000000000",
            schema_with(vec![field("title", FieldType::String)]),
        );
        assert!(matches!(result, Err(StoreError::SchemaDrift { .. })));
    }

    #[test]
    fn unsafe_changes_refused_with_summary() {
        let pool = StorePool::open_in_memory().unwrap();
        let registry = SchemaRegistry::empty();
        let migrator = Migrator::new(pool);

        let hash = registry.load().hash.clone();
        migrator
            .apply(&registry, &hash, schema_with(vec![field("title", FieldType::String)]))
            .unwrap();

        // Dropping the field is unsafe.
        let hash = registry.load().hash.clone();
        let result = migrator.apply(&registry, &hash, schema_with(vec![]));
        match result {
            Err(StoreError::UnsafeChanges { summary }) => {
                assert!(summary.contains("DROP field 'tasks.title'"));
            }
            other => panic!("expected UnsafeChanges, got {other:?}"),
        }
    }

    #[test]
    fn add_field_backfills_literal_default() {
        let pool = StorePool::open_in_memory().unwrap();
        let registry = SchemaRegistry::empty();
        let migrator = Migrator::new(Arc::clone(&pool));

        let hash = registry.load().hash.clone();
        migrator
            .apply(&registry, &hash, schema_with(vec![field("title", FieldType::String)]))
            .unwrap();

        pool.write()
            .execute(
                "INSERT INTO tasks (id, title) VALUES ('t1', 'existing')",
                [],
            )
            .unwrap();

        let mut priority = field("priority", FieldType::Int);
        priority.default = Some(alyx_core::types::DefaultValue::Literal(serde_json::json!(0)));
        let hash = registry.load().hash.clone();
        migrator
            .apply(
                &registry,
                &hash,
                schema_with(vec![field("title", FieldType::String), priority]),
            )
            .unwrap();

        let value: i64 = pool
            .read()
            .query_row("SELECT priority FROM tasks WHERE id = 't1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(value, 0);
    }

    #[test]
    fn migration_file_parse() {
        let content = "-- alyx:up\nALTER TABLE tasks ADD COLUMN x TEXT;\n-- alyx:down\nALTER TABLE tasks DROP COLUMN x;\n";
        let file = MigrationFile::parse("0003_add_x.sql", content).unwrap();
        assert_eq!(file.version, 3);
        assert_eq!(file.name, "add_x");
        assert_eq!(file.up_sql, "ALTER TABLE tasks ADD COLUMN x TEXT;");
        assert_eq!(file.down_sql, "ALTER TABLE tasks DROP COLUMN x;");
        assert_eq!(file.checksum.len(), 64);
    }

    #[test]
    fn migration_file_rejects_missing_markers() {
        assert!(MigrationFile::parse("0001_x.sql", "ALTER TABLE t").is_err());
        assert!(MigrationFile::parse("nodigits.sql", "-- alyx:up\n-- alyx:down\n").is_err());
    }

    #[test]
    fn apply_pending_records_ledger_and_skips_applied() {
        let pool = StorePool::open_in_memory().unwrap();
        crate::system::bootstrap(&pool.write()).unwrap();

        let files = vec![
            MigrationFile::parse(
                "0001_create.sql",
                "-- alyx:up\nCREATE TABLE widgets (id TEXT);\n-- alyx:down\nDROP TABLE widgets;\n",
            )
            .unwrap(),
        ];

        let applied = apply_pending(&pool.write(), &files).unwrap();
        assert_eq!(applied, 1);
        let applied_again = apply_pending(&pool.write(), &files).unwrap();
        assert_eq!(applied_again, 0);

        let (version, name): (u64, String) = pool
            .read()
            .query_row(
                "SELECT version, name FROM _alyx_migrations",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(version, 1);
        assert_eq!(name, "create");
    }

    #[test]
    fn checksum_mismatch_detected() {
        let pool = StorePool::open_in_memory().unwrap();
        crate::system::bootstrap(&pool.write()).unwrap();

        let original = MigrationFile::parse(
            "0001_create.sql",
            "-- alyx:up\nCREATE TABLE widgets (id TEXT);\n-- alyx:down\nDROP TABLE widgets;\n",
        )
        .unwrap();
        apply_pending(&pool.write(), std::slice::from_ref(&original)).unwrap();
        verify_checksums(&pool.read(), std::slice::from_ref(&original)).unwrap();

        let edited = MigrationFile::parse(
            "0001_create.sql",
            "-- alyx:up\nCREATE TABLE widgets (id TEXT, extra TEXT);\n-- alyx:down\nDROP TABLE widgets;\n",
        )
        .unwrap();
        let result = verify_checksums(&pool.read(), &[edited]);
        assert!(matches!(result, Err(StoreError::ChecksumMismatch { .. })));
    }
}
