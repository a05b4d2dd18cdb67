//! Cache storage backends: SQLite and in-memory.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{CacheStorage, CachedResponse, RequestKey};
use crate::net::{Request, Response};
use crate::sync::{SyncItem, SyncQueue};

/// SQLite-based cache storage implementation.
///
/// Also holds the background-sync queue, so one database file carries all
/// of the router's persistent state.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  #[allow(dead_code)]
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("cache-router").join("cache.db"))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    Ok(())
  }
}

/// Schema for cache and sync tables.
const CACHE_SCHEMA: &str = r#"
-- Named cache namespaces (rowid gives creation order)
CREATE TABLE IF NOT EXISTS cache_namespaces (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses
CREATE TABLE IF NOT EXISTS cache_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    namespace TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers BLOB NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (namespace, request_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_namespace ON cache_entries(namespace);

-- Requests waiting for a background sync replay
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tag TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers BLOB NOT NULL,
    body BLOB NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    queued_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_tag ON sync_queue(tag);
"#;

impl CacheStorage for SqliteStorage {
  fn open_namespace(&self, name: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT OR IGNORE INTO cache_namespaces (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open namespace {}: {}", name, e))?;
    Ok(())
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_namespaces ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list namespaces: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read namespace: {}", e))?;

    Ok(names)
  }

  fn delete_namespace(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE namespace = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM cache_namespaces WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete namespace {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn lookup(&self, namespace: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row: Option<(u16, Vec<u8>, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE namespace = ? AND request_hash = ?",
        params![namespace, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    match row {
      Some((status, headers, body, cached_at)) => {
        let headers = serde_json::from_slice(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;
        Ok(Some(CachedResponse {
          response: Response {
            status,
            headers,
            body,
          },
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, namespace: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let mut conn = self.lock()?;
    let headers = serde_json::to_vec(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_namespaces (name) VALUES (?)",
      params![namespace],
    )
    .map_err(|e| eyre!("Failed to open namespace {}: {}", namespace, e))?;

    tx.execute(
      "INSERT INTO cache_entries (namespace, request_hash, method, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))
       ON CONFLICT (namespace, request_hash) DO UPDATE SET
         status = excluded.status,
         headers = excluded.headers,
         body = excluded.body,
         cached_at = excluded.cached_at",
      params![
        namespace,
        key.cache_hash(),
        key.method,
        key.url,
        response.status,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn delete(&self, namespace: &str, key: &RequestKey) -> Result<bool> {
    let removed = self
      .lock()?
      .execute(
        "DELETE FROM cache_entries WHERE namespace = ? AND request_hash = ?",
        params![namespace, key.cache_hash()],
      )
      .map_err(|e| eyre!("Failed to delete {}: {}", key, e))?;
    Ok(removed > 0)
  }

  fn keys(&self, namespace: &str) -> Result<Vec<RequestKey>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT method, url FROM cache_entries WHERE namespace = ? ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![namespace], |row| {
        Ok(RequestKey {
          method: row.get(0)?,
          url: row.get(1)?,
        })
      })
      .map_err(|e| eyre!("Failed to list keys of {}: {}", namespace, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;

    Ok(keys)
  }
}

impl SyncQueue for SqliteStorage {
  fn enqueue(&self, tag: &str, request: &Request) -> Result<i64> {
    let conn = self.lock()?;
    let headers = serde_json::to_vec(&request.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT INTO sync_queue (tag, method, url, headers, body, queued_at)
         VALUES (?, ?, ?, ?, ?, datetime('now'))",
        params![
          tag,
          request.method.as_str(),
          request.url.as_str(),
          headers,
          request.body
        ],
      )
      .map_err(|e| eyre!("Failed to queue {} for sync: {}", request, e))?;

    Ok(conn.last_insert_rowid())
  }

  fn pending(&self, tag: &str) -> Result<Vec<SyncItem>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, method, url, headers, body, attempts, queued_at FROM sync_queue
         WHERE tag = ? ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![tag], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, Vec<u8>>(3)?,
          row.get::<_, Vec<u8>>(4)?,
          row.get::<_, u32>(5)?,
          row.get::<_, String>(6)?,
        ))
      })
      .map_err(|e| eyre!("Failed to read sync queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read sync item: {}", e))?;

    rows
      .into_iter()
      .map(|(id, method, url, headers, body, attempts, queued_at)| {
        Ok(SyncItem {
          id,
          tag: tag.to_string(),
          method,
          url,
          headers: serde_json::from_slice(&headers)
            .map_err(|e| eyre!("Failed to deserialize headers of sync item {}: {}", id, e))?,
          body,
          attempts,
          queued_at: parse_datetime(&queued_at)?,
        })
      })
      .collect()
  }

  fn remove(&self, id: i64) -> Result<bool> {
    let removed = self
      .lock()?
      .execute("DELETE FROM sync_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove sync item {}: {}", id, e))?;
    Ok(removed > 0)
  }

  fn record_failure(&self, id: i64) -> Result<()> {
    self
      .lock()?
      .execute(
        "UPDATE sync_queue SET attempts = attempts + 1 WHERE id = ?",
        params![id],
      )
      .map_err(|e| eyre!("Failed to update sync item {}: {}", id, e))?;
    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

/// Process-local storage, used when persistence is turned off.
#[derive(Default)]
pub struct MemoryStorage {
  state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
  namespaces: Vec<(String, Vec<(RequestKey, CachedResponse)>)>,
  sync_queue: Vec<SyncItem>,
  next_sync_id: i64,
}

impl MemoryState {
  fn namespace_mut(&mut self, name: &str) -> &mut Vec<(RequestKey, CachedResponse)> {
    let index = match self.namespaces.iter().position(|(n, _)| n == name) {
      Some(index) => index,
      None => {
        self.namespaces.push((name.to_string(), Vec::new()));
        self.namespaces.len() - 1
      }
    };
    &mut self.namespaces[index].1
  }
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
    self.state.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn open_namespace(&self, name: &str) -> Result<()> {
    self.lock()?.namespace_mut(name);
    Ok(())
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    Ok(
      self
        .lock()?
        .namespaces
        .iter()
        .map(|(name, _)| name.clone())
        .collect(),
    )
  }

  fn delete_namespace(&self, name: &str) -> Result<bool> {
    let mut state = self.lock()?;
    let before = state.namespaces.len();
    state.namespaces.retain(|(n, _)| n != name);
    Ok(state.namespaces.len() != before)
  }

  fn lookup(&self, namespace: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let state = self.lock()?;
    Ok(
      state
        .namespaces
        .iter()
        .find(|(n, _)| n == namespace)
        .and_then(|(_, entries)| entries.iter().find(|(k, _)| k == key))
        .map(|(_, cached)| cached.clone()),
    )
  }

  fn put(&self, namespace: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let mut state = self.lock()?;
    let entries = state.namespace_mut(namespace);
    let cached = CachedResponse {
      response: response.clone(),
      cached_at: Utc::now(),
    };

    match entries.iter_mut().find(|(k, _)| k == key) {
      Some(entry) => entry.1 = cached,
      None => entries.push((key.clone(), cached)),
    }
    Ok(())
  }

  fn delete(&self, namespace: &str, key: &RequestKey) -> Result<bool> {
    let mut state = self.lock()?;
    let Some((_, entries)) = state.namespaces.iter_mut().find(|(n, _)| n == namespace) else {
      return Ok(false);
    };
    let before = entries.len();
    entries.retain(|(k, _)| k != key);
    Ok(entries.len() != before)
  }

  fn keys(&self, namespace: &str) -> Result<Vec<RequestKey>> {
    let state = self.lock()?;
    Ok(
      state
        .namespaces
        .iter()
        .find(|(n, _)| n == namespace)
        .map(|(_, entries)| entries.iter().map(|(k, _)| k.clone()).collect())
        .unwrap_or_default(),
    )
  }
}

impl SyncQueue for MemoryStorage {
  fn enqueue(&self, tag: &str, request: &Request) -> Result<i64> {
    let mut state = self.lock()?;
    state.next_sync_id += 1;
    let id = state.next_sync_id;
    state.sync_queue.push(SyncItem {
      id,
      tag: tag.to_string(),
      method: request.method.as_str().to_string(),
      url: request.url.to_string(),
      headers: request.headers.clone(),
      body: request.body.clone(),
      attempts: 0,
      queued_at: Utc::now(),
    });
    Ok(id)
  }

  fn pending(&self, tag: &str) -> Result<Vec<SyncItem>> {
    Ok(
      self
        .lock()?
        .sync_queue
        .iter()
        .filter(|item| item.tag == tag)
        .cloned()
        .collect(),
    )
  }

  fn remove(&self, id: i64) -> Result<bool> {
    let mut state = self.lock()?;
    let before = state.sync_queue.len();
    state.sync_queue.retain(|item| item.id != id);
    Ok(state.sync_queue.len() != before)
  }

  fn record_failure(&self, id: i64) -> Result<()> {
    let mut state = self.lock()?;
    if let Some(item) = state.sync_queue.iter_mut().find(|item| item.id == id) {
      item.attempts += 1;
    }
    Ok(())
  }
}
