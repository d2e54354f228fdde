//! SQLite-backed cache generations.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::traits::{request_key, CacheStorage};
use crate::http::{Request, Response, ResponseType};

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn keys(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn open(&self, _name: &str) -> Result<()> {
    Ok(())
  }

  fn delete(&self, _name: &str) -> Result<bool> {
    Ok(false)
  }

  fn put(&self, _name: &str, _request: &Request, _response: &Response) -> Result<()> {
    Ok(()) // Discard
  }

  fn match_in(&self, _name: &str, _request: &Request) -> Result<Option<Response>> {
    Ok(None) // Always miss
  }

  fn entry_count(&self) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// A throwaway cache living only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per named generation, rowid gives creation order
CREATE TABLE IF NOT EXISTS cache_generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    request_url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    kind TEXT NOT NULL,
    response_url TEXT,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, request_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_key ON cache_entries(request_key);
"#;

type EntryRow = (u16, String, String, Vec<u8>, String, Option<String>);

fn row_to_response(row: EntryRow) -> Result<Response> {
  let (status, status_text, headers, body, kind, url) = row;
  let headers: Vec<(String, String)> =
    serde_json::from_str(&headers).map_err(|e| eyre!("Failed to parse cached headers: {}", e))?;
  let kind: ResponseType = serde_json::from_value(serde_json::Value::String(kind))
    .map_err(|e| eyre!("Failed to parse cached response type: {}", e))?;

  Ok(Response {
    status,
    status_text,
    headers,
    body,
    kind,
    url,
  })
}

fn kind_str(kind: ResponseType) -> Result<String> {
  match serde_json::to_value(kind).map_err(|e| eyre!("Failed to serialize kind: {}", e))? {
    serde_json::Value::String(s) => Ok(s),
    other => Err(eyre!("Unexpected response type encoding: {}", other)),
  }
}

impl CacheStorage for SqliteStorage {
  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_generations ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn open(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_generations (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open cache {}: {}", name, e))?;
    Ok(())
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE cache_name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM cache_generations WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put(&self, name: &str, request: &Request, response: &Response) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
    let kind = kind_str(response.kind)?;

    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_generations (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to open cache {}: {}", name, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_name, request_key, request_url, status, status_text, headers, body, kind, response_url, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        name,
        request_key(request),
        request.url.as_str(),
        response.status,
        response.status_text,
        headers,
        response.body,
        kind,
        response.url,
      ],
    )
    .map_err(|e| eyre!("Failed to store response: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn match_in(&self, name: &str, request: &Request) -> Result<Option<Response>> {
    let conn = self.lock()?;
    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT status, status_text, headers, body, kind, response_url FROM cache_entries
         WHERE cache_name = ? AND request_key = ?",
        params![name, request_key(request)],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache {}: {}", name, e))?;

    row.map(row_to_response).transpose()
  }

  fn entry_count(&self) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count cache entries: {}", e))?;
    Ok(count as usize)
  }
}
