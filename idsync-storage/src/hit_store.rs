//! Durable FIFO storage for queued hits.

use crate::error::{StorageError, StorageResult};
use idsync_types::Timestamp;
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// One stored work item: opaque bytes plus an id and enqueue time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEntity {
    pub unique_id: String,
    pub timestamp: Timestamp,
    pub data: Vec<u8>,
}

impl DataEntity {
    /// Wraps `data` with a fresh unique id and the current time.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            unique_id: uuid_string(),
            timestamp: Timestamp::now(),
            data,
        }
    }
}

fn uuid_string() -> String {
    // v7 keeps ids in insertion order, which makes logs easier to follow
    idsync_types::EventRef::new().to_string()
}

/// Crash-consistent FIFO of [`DataEntity`] items.
///
/// Implementations must tolerate concurrent calls from the engine thread
/// (append) and the drain worker (peek/remove).
pub trait HitStore: Send + Sync {
    /// Appends an item at the tail.
    fn append(&self, entity: &DataEntity) -> StorageResult<()>;

    /// Returns up to `n` items from the head without removing them.
    fn peek(&self, n: usize) -> StorageResult<Vec<DataEntity>>;

    /// Removes up to `n` items from the head. Returns false if the store was empty.
    fn remove(&self, n: usize) -> StorageResult<bool>;

    /// Removes every item.
    fn clear(&self) -> StorageResult<()>;

    /// Number of stored items.
    fn count(&self) -> StorageResult<usize>;
}

/// [`HitStore`] backed by an append-only SQLite table.
#[derive(Clone)]
pub struct SqliteHitStore {
    conn: Arc<Mutex<Connection>>,
    table: String,
}

impl SqliteHitStore {
    /// Opens (or creates) the queue named `name` in the database at `path`.
    pub fn open(path: &Path, name: &str) -> StorageResult<Self> {
        let conn = crate::open_sqlite(path)?;
        Self::with_connection(conn, name)
    }

    /// Opens an in-memory queue (for testing).
    pub fn open_in_memory(name: &str) -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, name)
    }

    fn with_connection(conn: Connection, name: &str) -> StorageResult<Self> {
        let table = table_name(name)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            table,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS {table} (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                unique_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                data BLOB NOT NULL
            );
            ",
            table = self.table
        ))?;
        Ok(())
    }
}

/// Queue names become table names, so only identifier characters are allowed.
fn table_name(name: &str) -> StorageResult<String> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
        return Err(StorageError::InvalidData(format!("invalid queue name: {name:?}")));
    }
    Ok(format!("hits_{}", name.replace('.', "_")))
}

impl HitStore for SqliteHitStore {
    fn append(&self, entity: &DataEntity) -> StorageResult<()> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        conn.execute(
            &format!(
                "INSERT INTO {} (unique_id, timestamp, data) VALUES (?1, ?2, ?3)",
                self.table
            ),
            params![
                entity.unique_id,
                entity.timestamp.as_millis() as i64,
                entity.data
            ],
        )?;
        Ok(())
    }

    fn peek(&self, n: usize) -> StorageResult<Vec<DataEntity>> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT unique_id, timestamp, data FROM {} ORDER BY seq ASC LIMIT ?1",
            self.table
        ))?;
        let rows = stmt.query_map(params![n as i64], |row| {
            let unique_id: String = row.get(0)?;
            let millis: i64 = row.get(1)?;
            let data: Vec<u8> = row.get(2)?;
            Ok(DataEntity {
                unique_id,
                timestamp: Timestamp::from_millis(millis.max(0) as u64),
                data,
            })
        })?;
        let mut entities = Vec::new();
        for row in rows {
            entities.push(row?);
        }
        Ok(entities)
    }

    fn remove(&self, n: usize) -> StorageResult<bool> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        let removed = conn.execute(
            &format!(
                "DELETE FROM {table} WHERE seq IN \
                 (SELECT seq FROM {table} ORDER BY seq ASC LIMIT ?1)",
                table = self.table
            ),
            params![n as i64],
        )?;
        Ok(removed > 0)
    }

    fn clear(&self) -> StorageResult<()> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        conn.execute(&format!("DELETE FROM {}", self.table), [])?;
        Ok(())
    }

    fn count(&self) -> StorageResult<usize> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| {
            row.get(0)
        })?;
        Ok(count.max(0) as usize)
    }
}
