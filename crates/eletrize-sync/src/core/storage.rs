//! Durable Storage
//!
//! Key/value backends behind the state store. The engine only needs a flat
//! string map with prefix listing, so any backend offering that can be
//! plugged in through [`DurableStorage`].
//!
//! - [`SqliteStorage`]: one SQLite table, survives restarts
//! - [`MemoryStorage`]: session-scoped, with an optional capacity that
//!   reports [`Error::QuotaExceeded`] the way a full browser store does

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};

/// Flat string store used for persisted device state.
pub trait DurableStorage: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or replace a value. Fails with [`Error::QuotaExceeded`] when full.
    fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value; missing keys are not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// Keys starting with `prefix`, least recently written first.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

// ==================== SQLite ====================

/// SQLite-backed durable storage.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create directory: {}", e)))?;
        }

        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;

        tracing::debug!(path = %path.display(), "Opened device state database");
        Ok(storage)
    }

    /// Private database that disappears with the connection.
    pub fn open_in_memory() -> Result<Self> {
        let storage = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Cap the database size in pages. Writes beyond it fail with `SQLITE_FULL`.
    pub fn limit_pages(&self, max_pages: u32) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| Error::Storage(e.to_string()))?;
        conn.query_row(
            &format!("PRAGMA max_page_count = {}", max_pages),
            [],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(())
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| Error::Storage(e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_kv_updated ON kv_store(updated_at);
            "#,
        )?;

        Ok(())
    }
}

impl DurableStorage for SqliteStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().map_err(|e| Error::Storage(e.to_string()))?;
        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| Error::Storage(e.to_string()))?;
        conn.execute(
            r#"
            INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
            params![key, value, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| Error::Storage(e.to_string()))?;
        conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().map_err(|e| Error::Storage(e.to_string()))?;
        let mut stmt = conn.prepare(
            r#"
            SELECT key FROM kv_store
            WHERE substr(key, 1, length(?1)) = ?1
            ORDER BY updated_at ASC, rowid ASC
            "#,
        )?;
        let keys = stmt
            .query_map(params![prefix], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}

// ==================== Memory ====================

#[derive(Default)]
struct MemoryInner {
    entries: BTreeMap<String, (u64, String)>,
    clock: u64,
}

/// In-process durable storage stand-in.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
    capacity: Option<usize>,
    unavailable: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage holding at most `entries` keys.
    pub fn with_capacity(entries: usize) -> Self {
        Self {
            capacity: Some(entries),
            ..Self::default()
        }
    }

    /// Storage that rejects every operation, like a browser in private mode.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(Error::Storage("durable storage is unavailable".into()));
        }
        Ok(())
    }
}

impl DurableStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        let inner = self.inner.lock().map_err(|e| Error::Storage(e.to_string()))?;
        Ok(inner.entries.get(key).map(|(_, v)| v.clone()))
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().map_err(|e| Error::Storage(e.to_string()))?;
        if let Some(capacity) = self.capacity {
            if !inner.entries.contains_key(key) && inner.entries.len() >= capacity {
                return Err(Error::QuotaExceeded(format!(
                    "capacity of {} entries reached",
                    capacity
                )));
            }
        }
        inner.clock += 1;
        let stamp = inner.clock;
        inner.entries.insert(key.to_string(), (stamp, value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().map_err(|e| Error::Storage(e.to_string()))?;
        inner.entries.remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_available()?;
        let inner = self.inner.lock().map_err(|e| Error::Storage(e.to_string()))?;
        let mut keys: Vec<(u64, String)> = inner
            .entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, (stamp, _))| (*stamp, k.clone()))
            .collect();
        keys.sort();
        Ok(keys.into_iter().map(|(_, k)| k).collect())
    }
}
