use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use tracing::debug;

use crate::error::StoreError;

/// Default read-connection count.
const READ_CONNECTIONS: usize = 4;

/// Single write connection plus a round-robin read pool, WAL mode.
///
/// SQLite serializes writers anyway; funnelling every write through
/// one mutex-guarded connection makes the single-writer path explicit
/// and lets reads proceed concurrently under WAL.
pub struct StorePool {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
}

impl StorePool {
    /// Opens (creating if missing) the database at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, StoreError> {
        let writer = open_connection(path, false)?;
        let mut readers = Vec::with_capacity(READ_CONNECTIONS);
        for _ in 0..READ_CONNECTIONS {
            readers.push(Mutex::new(open_connection(path, true)?));
        }
        debug!(path = %path.display(), readers = READ_CONNECTIONS, "opened store pool");
        Ok(Arc::new(Self {
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
        }))
    }

    /// An in-memory pool for tests. Reads and writes share the single
    /// connection, which keeps the memory database visible everywhere.
    pub fn open_in_memory() -> Result<Arc<Self>, StoreError> {
        let conn = Connection::open_in_memory().map_err(internal)?;
        configure(&conn, false)?;
        Ok(Arc::new(Self {
            writer: Mutex::new(conn),
            readers: Vec::new(),
            next_reader: AtomicUsize::new(0),
        }))
    }

    /// Exclusive access to the write connection.
    pub fn write(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock()
    }

    /// A read connection, round-robin. Falls back to the writer when
    /// the pool has no dedicated readers (in-memory mode).
    pub fn read(&self) -> MutexGuard<'_, Connection> {
        if self.readers.is_empty() {
            return self.writer.lock();
        }
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        self.readers[idx].lock()
    }
}

fn open_connection(path: &Path, read_only: bool) -> Result<Connection, StoreError> {
    let conn = if read_only {
        Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY
                | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(internal)?
    } else {
        Connection::open(path).map_err(internal)?
    };
    configure(&conn, read_only)?;
    Ok(conn)
}

fn configure(conn: &Connection, read_only: bool) -> Result<(), StoreError> {
    if !read_only {
        // Journal mode is a database property; the writer sets it once.
        conn.pragma_update(None, "journal_mode", "WAL").map_err(internal)?;
        conn.pragma_update(None, "synchronous", "NORMAL").map_err(internal)?;
    }
    conn.pragma_update(None, "busy_timeout", 5000).map_err(internal)?;
    conn.pragma_update(None, "foreign_keys", "ON").map_err(internal)?;
    Ok(())
}

fn internal(err: rusqlite::Error) -> StoreError {
    StoreError::Internal {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_pool_reads_see_writes() {
        let pool = StorePool::open_in_memory().unwrap();
        pool.write()
            .execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (7)")
            .unwrap();
        let count: i64 = pool
            .read()
            .query_row("SELECT count(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn file_pool_reads_see_committed_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let pool = StorePool::open(&path).unwrap();
        pool.write()
            .execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1), (2)")
            .unwrap();
        let count: i64 = pool
            .read()
            .query_row("SELECT count(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn foreign_keys_enforced() {
        let pool = StorePool::open_in_memory().unwrap();
        pool.write()
            .execute_batch(
                "CREATE TABLE parent (id INTEGER PRIMARY KEY);
                 CREATE TABLE child (pid INTEGER REFERENCES parent(id));",
            )
            .unwrap();
        let result = pool.write().execute("INSERT INTO child VALUES (99)", []);
        assert!(result.is_err());
    }
}
