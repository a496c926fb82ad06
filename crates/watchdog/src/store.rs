use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{Clock, SharedClock};
use dashmap::DashMap;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend failed: {0}")]
    Backend(String),
    #[error("corrupt value under {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Small key-value interface the watchdog keeps all of its state behind.
///
/// Values are JSON text. Entries written with a TTL disappear from every
/// read once they expire, whether or not `purge_expired` has run.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError>;
    /// Live entries whose key starts with `prefix`, sorted by key.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// Drop expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Sharded in-memory store. Upserts and scans lock single shards, never the
/// whole map.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: SharedClock,
}

impl MemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|ttl| self.clock.now() + ttl);
        self.entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let now = self.clock.now();
        let mut out: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.value().live(now))
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.live(now));
        Ok(before.saturating_sub(self.entries.len()))
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_kv_expires_at ON kv(expires_at);
"#;

const POOL_SIZE: u32 = 8;
const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Durable store in a single SQLite file. Expiry is kept as unix milliseconds.
///
/// Each call takes its own pooled connection. The file runs in WAL mode, so
/// scans read a snapshot while heartbeats for other instances are written,
/// and writers only contend inside SQLite for the duration of one statement.
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    clock: SharedClock,
}

fn prepare_connection(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")
}

impl SqliteStore {
    /// Open the database at the given path, creating the directory if needed.
    pub fn open(path: &Path, clock: SharedClock) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok();
        }
        let manager = SqliteConnectionManager::file(path).with_init(prepare_connection);
        let pool = Pool::builder().max_size(POOL_SIZE).build(manager)?;
        Self::from_pool(pool, clock)
    }

    /// A private in-memory database. SQLite gives every connection its own
    /// memory database, so the pool holds exactly one.
    pub fn in_memory(clock: SharedClock) -> Result<Self, StoreError> {
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(SqliteConnectionManager::memory())?;
        Self::from_pool(pool, clock)
    }

    fn from_pool(pool: Pool<SqliteConnectionManager>, clock: SharedClock) -> Result<Self, StoreError> {
        pool.get()?.execute_batch(SCHEMA)?;
        Ok(Self { pool, clock })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StoreError> {
        Ok(self.pool.get()?)
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }
}

/// Get the default database path (~/.gpulease/watchdog.db)
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".gpulease")
        .join("watchdog.db")
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, self.now_ms()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|ttl| self.now_ms() + ttl.num_milliseconds());
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, expires_at],
        )?;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv
             WHERE substr(key, 1, length(?1)) = ?1 AND (expires_at IS NULL OR expires_at > ?2)
             ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix, self.now_ms()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![self.now_ms()],
        )?;
        Ok(removed)
    }
}
