//! Cache storage trait with SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::types::{AssetResponse, CachedEntry, Generation, RequestKey};

/// Trait for cache storage backends.
///
/// Storage is keyed first by generation, then by request identity. Writing
/// into a generation that does not exist yet creates it.
pub trait CacheStorage: Send + Sync {
  /// Create the bucket for a generation if it is missing.
  fn open(&self, generation: &Generation) -> Result<()>;

  /// All generations present, oldest first.
  fn generations(&self) -> Result<Vec<Generation>>;

  /// Delete a generation and all its entries. Returns false if it was absent.
  fn delete(&self, generation: &Generation) -> Result<bool>;

  /// Look up an entry.
  fn lookup(&self, generation: &Generation, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Insert or replace an entry.
  fn put(&self, generation: &Generation, key: &RequestKey, response: &AssetResponse)
    -> Result<()>;

  /// Number of entries stored under a generation.
  fn entry_count(&self, generation: &Generation) -> Result<usize>;
}

type Bucket = HashMap<RequestKey, CachedEntry>;

/// In-process storage. Contents vanish with the process.
#[derive(Default)]
pub struct MemoryStorage {
  inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
  next_seq: u64,
  /// Creation sequence -> generation, so listing is oldest first
  order: BTreeMap<u64, Generation>,
  buckets: HashMap<Generation, (u64, Bucket)>,
}

impl MemoryInner {
  fn bucket_mut(&mut self, generation: &Generation) -> &mut Bucket {
    let next_seq = &mut self.next_seq;
    let order = &mut self.order;
    let (_, bucket) = self
      .buckets
      .entry(generation.clone())
      .or_insert_with(|| {
        let seq = *next_seq;
        *next_seq += 1;
        order.insert(seq, generation.clone());
        (seq, Bucket::new())
      });
    bucket
  }
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
    self.inner.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, generation: &Generation) -> Result<()> {
    self.lock()?.bucket_mut(generation);
    Ok(())
  }

  fn generations(&self) -> Result<Vec<Generation>> {
    Ok(self.lock()?.order.values().cloned().collect())
  }

  fn delete(&self, generation: &Generation) -> Result<bool> {
    let mut inner = self.lock()?;
    match inner.buckets.remove(generation) {
      Some((seq, _)) => {
        inner.order.remove(&seq);
        Ok(true)
      }
      None => Ok(false),
    }
  }

  fn lookup(&self, generation: &Generation, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let inner = self.lock()?;
    Ok(
      inner
        .buckets
        .get(generation)
        .and_then(|(_, bucket)| bucket.get(key))
        .cloned(),
    )
  }

  fn put(
    &self,
    generation: &Generation,
    key: &RequestKey,
    response: &AssetResponse,
  ) -> Result<()> {
    let entry = CachedEntry {
      response: response.clone(),
      cached_at: Utc::now(),
    };
    self.lock()?.bucket_mut(generation).insert(key.clone(), entry);
    Ok(())
  }

  fn entry_count(&self, generation: &Generation) -> Result<usize> {
    Ok(
      self
        .lock()?
        .buckets
        .get(generation)
        .map(|(_, bucket)| bucket.len())
        .unwrap_or(0),
    )
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at the given path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
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
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("assetcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per cache bucket
CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
);

-- Stored responses, keyed by sha256(method + url)
CREATE TABLE IF NOT EXISTS entries (
    generation TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, entry_key)
);
"#;

impl CacheStorage for SqliteStorage {
  fn open(&self, generation: &Generation) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO generations (name) VALUES (?)",
        params![generation.as_str()],
      )
      .map_err(|e| eyre!("Failed to create generation {}: {}", generation, e))?;
    Ok(())
  }

  fn generations(&self) -> Result<Vec<Generation>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM generations ORDER BY created_at, rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read generation row: {}", e))?;

    Ok(names.into_iter().map(Generation::new).collect())
  }

  fn delete(&self, generation: &Generation) -> Result<bool> {
    let conn = self.lock()?;

    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let result = conn
      .execute(
        "DELETE FROM entries WHERE generation = ?",
        params![generation.as_str()],
      )
      .and_then(|_| {
        conn.execute(
          "DELETE FROM generations WHERE name = ?",
          params![generation.as_str()],
        )
      });

    match result {
      Ok(removed) => {
        conn
          .execute("COMMIT", [])
          .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
        Ok(removed > 0)
      }
      Err(e) => {
        let _ = conn.execute("ROLLBACK", []);
        Err(eyre!("Failed to delete generation {}: {}", generation, e))
      }
    }
  }

  fn lookup(&self, generation: &Generation, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM entries
         WHERE generation = ? AND entry_key = ?",
        params![generation.as_str(), key.digest()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} {}: {}", key.method, key.url, e))?;

    match row {
      Some((status, headers, body, cached_at_str)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(CachedEntry {
          response: AssetResponse {
            status,
            headers,
            body: body.into(),
          },
          cached_at: parse_datetime(&cached_at_str)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(
    &self,
    generation: &Generation,
    key: &RequestKey,
    response: &AssetResponse,
  ) -> Result<()> {
    let conn = self.lock()?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO generations (name) VALUES (?)",
        params![generation.as_str()],
      )
      .map_err(|e| eyre!("Failed to create generation {}: {}", generation, e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO entries (generation, entry_key, method, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          generation.as_str(),
          key.digest(),
          key.method,
          key.url,
          response.status,
          headers,
          response.body.as_ref(),
        ],
      )
      .map_err(|e| eyre!("Failed to store {} {}: {}", key.method, key.url, e))?;

    Ok(())
  }

  fn entry_count(&self, generation: &Generation) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE generation = ?",
        params![generation.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries: {}", e))?;
    Ok(count as usize)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn backends() -> Vec<(&'static str, Box<dyn CacheStorage>)> {
    vec![
      ("memory", Box::new(MemoryStorage::new())),
      ("sqlite", Box::new(SqliteStorage::open_in_memory().unwrap())),
    ]
  }

  #[test]
  fn test_put_then_lookup() {
    for (name, storage) in backends() {
      let generation = Generation::new("v1");
      let key = RequestKey::get("https://example.com/css/style.css");
      let response = AssetResponse::new(200, "body { color: red }")
        .with_header("content-type", "text/css");

      storage.put(&generation, &key, &response).unwrap();

      let entry = storage.lookup(&generation, &key).unwrap().unwrap();
      assert_eq!(entry.response, response, "{name}");
      assert_eq!(storage.entry_count(&generation).unwrap(), 1, "{name}");
    }
  }

  #[test]
  fn test_lookup_is_scoped_to_generation() {
    for (name, storage) in backends() {
      let key = RequestKey::get("https://example.com/");
      storage
        .put(&Generation::new("v1"), &key, &AssetResponse::new(200, "old"))
        .unwrap();

      assert!(
        storage
          .lookup(&Generation::new("v2"), &key)
          .unwrap()
          .is_none(),
        "{name}"
      );
    }
  }

  #[test]
  fn test_put_replaces_existing_entry() {
    for (name, storage) in backends() {
      let generation = Generation::new("v1");
      let key = RequestKey::get("https://example.com/a.js");
      storage
        .put(&generation, &key, &AssetResponse::new(200, "first"))
        .unwrap();
      storage
        .put(&generation, &key, &AssetResponse::new(200, "second"))
        .unwrap();

      let entry = storage.lookup(&generation, &key).unwrap().unwrap();
      assert_eq!(entry.response.body.as_ref(), b"second", "{name}");
      assert_eq!(storage.entry_count(&generation).unwrap(), 1, "{name}");
    }
  }

  #[test]
  fn test_generations_listed_in_creation_order() {
    for (name, storage) in backends() {
      storage.open(&Generation::new("v1")).unwrap();
      storage.open(&Generation::new("v2")).unwrap();
      storage.open(&Generation::new("v1")).unwrap();

      assert_eq!(
        storage.generations().unwrap(),
        vec![Generation::new("v1"), Generation::new("v2")],
        "{name}"
      );
    }
  }

  #[test]
  fn test_delete_removes_entries() {
    for (name, storage) in backends() {
      let old = Generation::new("v1");
      let key = RequestKey::get("https://example.com/");
      storage.put(&old, &key, &AssetResponse::new(200, "x")).unwrap();

      assert!(storage.delete(&old).unwrap(), "{name}");
      assert!(!storage.delete(&old).unwrap(), "{name}");
      assert!(storage.lookup(&old, &key).unwrap().is_none(), "{name}");
      assert_eq!(storage.entry_count(&old).unwrap(), 0, "{name}");
      assert!(storage.generations().unwrap().is_empty(), "{name}");
    }
  }

  #[test]
  fn test_sqlite_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    let generation = Generation::new("v1");
    let key = RequestKey::get("https://example.com/index.html");

    {
      let storage = SqliteStorage::open_at(&path).unwrap();
      storage
        .put(&generation, &key, &AssetResponse::new(200, "<html></html>"))
        .unwrap();
    }

    let storage = SqliteStorage::open_at(&path).unwrap();
    assert_eq!(storage.generations().unwrap(), vec![generation.clone()]);
    let entry = storage.lookup(&generation, &key).unwrap().unwrap();
    assert_eq!(entry.response.body.as_ref(), b"<html></html>");
  }
}
