//! Namespaced key-value persistence.

use crate::error::{StorageError, StorageResult};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Byte-valued key-value store scoped to one namespace.
pub trait KeyValueStore: Send + Sync {
    /// Reads the value stored under `key`.
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Deletes `key`. Missing keys are not an error.
    fn remove(&self, key: &str) -> StorageResult<()>;
}

/// JSON and flag helpers available on every [`KeyValueStore`].
pub trait KeyValueStoreExt: KeyValueStore {
    /// Reads and decodes a JSON value.
    fn load_json<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Encodes `value` as JSON and stores it.
    fn save_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StorageResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, &bytes)
    }

    /// Reads a boolean flag, defaulting to false.
    fn get_flag(&self, key: &str) -> StorageResult<bool> {
        Ok(self.load_json::<bool>(key)?.unwrap_or(false))
    }

    fn set_flag(&self, key: &str, value: bool) -> StorageResult<()> {
        self.save_json(key, &value)
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}

/// [`KeyValueStore`] backed by a SQLite table shared by all namespaces.
#[derive(Clone)]
pub struct SqliteKeyValueStore {
    conn: Arc<Mutex<Connection>>,
    namespace: String,
}

impl SqliteKeyValueStore {
    /// Opens (or creates) the store at `path` for `namespace`.
    pub fn open(path: &Path, namespace: &str) -> StorageResult<Self> {
        let conn = crate::open_sqlite(path)?;
        Self::with_connection(conn, namespace)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory(namespace: &str) -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, namespace)
    }

    fn with_connection(conn: Connection, namespace: &str) -> StorageResult<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            namespace: namespace.to_owned(),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Returns the namespace this store reads and writes.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv_entries (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (namespace, key)
            );
            ",
        )?;
        Ok(())
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        let value = conn
            .query_row(
                "SELECT value FROM kv_entries WHERE namespace = ?1 AND key = ?2",
                params![self.namespace, key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        conn.execute(
            "INSERT INTO kv_entries (namespace, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value",
            params![self.namespace, key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        conn.execute(
            "DELETE FROM kv_entries WHERE namespace = ?1 AND key = ?2",
            params![self.namespace, key],
        )?;
        Ok(())
    }
}
