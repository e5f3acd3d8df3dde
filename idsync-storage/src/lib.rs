//! SQLite storage layer for idsync.
//!
//! Provides the two durable stores the identity engine depends on:
//!
//! - [`KeyValueStore`]: namespaced byte values, used for the identity record
//!   and push flags
//! - [`HitStore`]: a crash-safe FIFO of queued sync hits
//!
//! Both are traits so the engine can be driven by any backend; the SQLite
//! implementations are the production ones.

mod error;
mod hit_store;
mod kv_store;

pub use error::{StorageError, StorageResult};
pub use hit_store::{DataEntity, HitStore, SqliteHitStore};
pub use kv_store::{KeyValueStore, KeyValueStoreExt, SqliteKeyValueStore};

use rusqlite::Connection;
use std::path::Path;
use tracing::warn;

/// Opens a SQLite connection tuned for durable, crash-consistent writes.
///
/// Enables WAL journaling with `synchronous=FULL`. If WAL cannot be enabled
/// (read-only media, some network filesystems) the default journal is kept.
pub fn open_sqlite(path: &Path) -> StorageResult<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    match conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0)) {
        Ok(mode) if mode.eq_ignore_ascii_case("wal") => {}
        Ok(mode) => warn!(path = %path.display(), %mode, "WAL journaling unavailable"),
        Err(e) => warn!(path = %path.display(), error = %e, "failed to set journal mode"),
    }
    conn.execute_batch("PRAGMA synchronous=FULL; PRAGMA busy_timeout=5000;")?;
    Ok(conn)
}
