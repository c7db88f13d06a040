use std::sync::{Mutex, MutexGuard};

use dashmap::DashMap;
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::db::init_db;
use crate::error::{Result, StoreError};

/// Byte-level key-value contract the record store is built on.
///
/// Implementations give last-writer-wins semantics per key and nothing more:
/// no compare-and-set, no multi-key transactions.
pub trait KvStore: Send + Sync {
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete every listed key, returning how many existed.
    fn delete(&self, keys: &[&str]) -> Result<usize>;

    /// All keys starting with `prefix`, in lexical order.
    fn scan(&self, prefix: &str) -> Result<Vec<String>>;

    /// Cheap liveness check for the health endpoint.
    fn ping(&self) -> Result<()> {
        self.get("__ping__").map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// Durable store backed by a single SQLite connection behind a `Mutex`.
pub struct SqliteKv {
    db: Mutex<Connection>,
}

impl SqliteKv {
    /// Wrap an open connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        Self::new(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl KvStore for SqliteKv {
    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let db = self.conn()?;
        db.execute(
            "INSERT INTO kv (key, value, updated_at)
             VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                            updated_at = excluded.updated_at",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let db = self.conn()?;
        let value = db
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn delete(&self, keys: &[&str]) -> Result<usize> {
        let db = self.conn()?;
        let mut stmt = db.prepare_cached("DELETE FROM kv WHERE key = ?1")?;
        let mut removed = 0;
        for key in keys {
            removed += stmt.execute([key])?;
        }
        debug!(removed, "kv keys deleted");
        Ok(removed)
    }

    fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let db = self.conn()?;
        let mut stmt = db.prepare_cached(
            "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let keys = stmt
            .query_map([prefix], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Non-durable store for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvStore for MemoryKv {
    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn delete(&self, keys: &[&str]) -> Result<usize> {
        Ok(keys
            .iter()
            .filter(|k| self.entries.remove(**k).is_some())
            .count())
    }

    fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
