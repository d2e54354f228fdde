pub mod schema;

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::reset::record::{ResetCounts, ResetRecord};

/// Which key-value area a key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageArea {
  /// Survives restarts; holds sessions and user data
  Local,
  /// Scratch space scoped to one page session
  Session,
}

impl StorageArea {
  fn as_str(self) -> &'static str {
    match self {
      Self::Local => "local",
      Self::Session => "session",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
  pub name: String,
  pub value: String,
  pub domain: String,
  pub path: String,
  pub http_only: bool,
}

impl Cookie {
  pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      value: value.into(),
      domain: domain.into(),
      path: "/".to_string(),
      http_only: false,
    }
  }

  pub fn with_path(mut self, path: impl Into<String>) -> Self {
    self.path = path.into();
    self
  }

  pub fn http_only(mut self) -> Self {
    self.http_only = true;
    self
  }

  /// Whether script on `host` at `path` can read this cookie.
  pub fn visible_to(&self, host: &str, path: &str) -> bool {
    !self.http_only && domain_matches(&self.domain, host) && path_matches(&self.path, path)
  }
}

fn domain_matches(cookie_domain: &str, host: &str) -> bool {
  let domain = cookie_domain.trim_start_matches('.').to_ascii_lowercase();
  let host = host.to_ascii_lowercase();
  host == domain || host.ends_with(&format!(".{}", domain))
}

fn path_matches(cookie_path: &str, request_path: &str) -> bool {
  if cookie_path == request_path {
    return true;
  }
  request_path.starts_with(cookie_path)
    && (cookie_path.ends_with('/') || request_path[cookie_path.len()..].starts_with('/'))
}

/// Reset records kept for the storm guard and `profile`; older ones are pruned.
const RESET_RECORDS_KEPT: i64 = 20;

/// The profile database: every persistence surface a page can write to,
/// plus the reset bookkeeping.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the profile database at `path`
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// An empty profile that lives only in memory
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  // ==========================================================================
  // Key-value areas
  // ==========================================================================

  pub fn kv_get(&self, area: StorageArea, key: &str) -> Result<Option<String>> {
    let conn = self.lock()?;
    conn
      .query_row(
        "SELECT value FROM kv_store WHERE area = ? AND key = ?",
        params![area.as_str(), key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read key {}: {}", key, e))
  }

  pub fn kv_set(&self, area: StorageArea, key: &str, value: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (area, key, value) VALUES (?, ?, ?)",
        params![area.as_str(), key, value],
      )
      .map_err(|e| eyre!("Failed to write key {}: {}", key, e))?;
    Ok(())
  }

  pub fn kv_remove(&self, area: StorageArea, key: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "DELETE FROM kv_store WHERE area = ? AND key = ?",
        params![area.as_str(), key],
      )
      .map_err(|e| eyre!("Failed to remove key {}: {}", key, e))?;
    Ok(())
  }

  pub fn kv_len(&self, area: StorageArea) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM kv_store WHERE area = ?",
        params![area.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count keys: {}", e))?;
    Ok(count as usize)
  }

  /// Remove every key in the area. Returns how many were removed.
  pub fn kv_clear(&self, area: StorageArea) -> Result<usize> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM kv_store WHERE area = ?", params![area.as_str()])
      .map_err(|e| eyre!("Failed to clear {} storage: {}", area.as_str(), e))
  }

  // ==========================================================================
  // Cookies
  // ==========================================================================

  pub fn set_cookie(&self, cookie: &Cookie) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO cookies (name, value, domain, path, http_only) VALUES (?, ?, ?, ?, ?)",
        params![
          cookie.name,
          cookie.value,
          cookie.domain,
          cookie.path,
          cookie.http_only
        ],
      )
      .map_err(|e| eyre!("Failed to set cookie {}: {}", cookie.name, e))?;
    Ok(())
  }

  pub fn cookies(&self) -> Result<Vec<Cookie>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name, value, domain, path, http_only FROM cookies ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let cookies = stmt
      .query_map([], |row| {
        Ok(Cookie {
          name: row.get(0)?,
          value: row.get(1)?,
          domain: row.get(2)?,
          path: row.get(3)?,
          http_only: row.get(4)?,
        })
      })
      .map_err(|e| eyre!("Failed to query cookies: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read cookie: {}", e))?;

    Ok(cookies)
  }

  /// The `name=value; name=value` string script on `host` at `path` can read.
  pub fn readable_cookie_string(&self, host: &str, path: &str) -> Result<String> {
    let visible: Vec<String> = self
      .cookies()?
      .into_iter()
      .filter(|c| c.visible_to(host, path))
      .map(|c| format!("{}={}", c.name, c.value))
      .collect();
    Ok(visible.join("; "))
  }

  /// Expire the cookie with exactly this name, domain and path.
  /// A leading dot on the stored domain is ignored.
  pub fn expire_cookie(&self, name: &str, domain: &str, path: &str) -> Result<bool> {
    let conn = self.lock()?;
    let bare = domain.trim_start_matches('.');
    let removed = conn
      .execute(
        "DELETE FROM cookies
         WHERE name = ? AND path = ? AND http_only = 0 AND (domain = ? OR domain = ?)",
        params![name, path, bare, format!(".{}", bare)],
      )
      .map_err(|e| eyre!("Failed to expire cookie {}: {}", name, e))?;
    Ok(removed > 0)
  }

  // ==========================================================================
  // Structured databases
  // ==========================================================================

  pub fn create_structured_database(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO structured_databases (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to create database {}: {}", name, e))?;
    Ok(())
  }

  pub fn structured_database_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM structured_databases ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to enumerate databases: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read database name: {}", e))?;
    Ok(names)
  }

  pub fn delete_structured_database(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM structured_databases WHERE name = ?",
        params![name],
      )
      .map_err(|e| eyre!("Failed to delete database {}: {}", name, e))?;
    Ok(removed > 0)
  }

  // ==========================================================================
  // Reset records
  // ==========================================================================

  pub fn insert_reset_record(&self, record: &ResetRecord) -> Result<()> {
    let counts = record
      .counts
      .as_ref()
      .map(serde_json::to_string)
      .transpose()
      .map_err(|e| eyre!("Failed to serialize reset counts: {}", e))?;

    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO reset_records (reset_id, started_at, completed_at, counts)
         VALUES (?, ?, ?, ?)",
        params![
          record.reset_id,
          format_datetime(record.started_at),
          record.completed_at.map(format_datetime),
          counts
        ],
      )
      .map_err(|e| eyre!("Failed to write reset record {}: {}", record.reset_id, e))?;

    let pruned = conn
      .execute(
        "DELETE FROM reset_records WHERE rowid NOT IN (
           SELECT rowid FROM reset_records ORDER BY started_at DESC, rowid DESC LIMIT ?
         )",
        params![RESET_RECORDS_KEPT],
      )
      .map_err(|e| eyre!("Failed to prune reset records: {}", e))?;
    if pruned > 0 {
      debug!(pruned, "old reset records pruned");
    }
    Ok(())
  }

  pub fn complete_reset_record(
    &self,
    reset_id: &str,
    completed_at: DateTime<Utc>,
    counts: &ResetCounts,
  ) -> Result<()> {
    let counts =
      serde_json::to_string(counts).map_err(|e| eyre!("Failed to serialize reset counts: {}", e))?;

    let conn = self.lock()?;
    conn
      .execute(
        "UPDATE reset_records SET completed_at = ?, counts = ? WHERE reset_id = ?",
        params![format_datetime(completed_at), counts, reset_id],
      )
      .map_err(|e| eyre!("Failed to complete reset record {}: {}", reset_id, e))?;
    Ok(())
  }

  /// The most recently started reset, if any.
  pub fn last_reset_record(&self) -> Result<Option<ResetRecord>> {
    let conn = self.lock()?;
    let row: Option<(String, String, Option<String>, Option<String>)> = conn
      .query_row(
        "SELECT reset_id, started_at, completed_at, counts FROM reset_records
         ORDER BY started_at DESC, rowid DESC LIMIT 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read last reset record: {}", e))?;

    let Some((reset_id, started_at, completed_at, counts)) = row else {
      return Ok(None);
    };

    Ok(Some(ResetRecord {
      reset_id,
      started_at: parse_datetime(&started_at)?,
      completed_at: completed_at.as_deref().map(parse_datetime).transpose()?,
      // Unreadable counts do not invalidate the timestamp the storm guard needs
      counts: counts.and_then(|c| serde_json::from_str(&c).ok()),
    }))
  }
}

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
fn format_datetime(value: DateTime<Utc>) -> String {
  value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(value)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("invalid datetime '{}': {}", value, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_kv_areas_are_separate() {
    let db = Database::open_in_memory().unwrap();
    db.kv_set(StorageArea::Local, "a", "1").unwrap();
    db.kv_set(StorageArea::Session, "a", "2").unwrap();

    assert_eq!(db.kv_get(StorageArea::Local, "a").unwrap().as_deref(), Some("1"));
    assert_eq!(db.kv_clear(StorageArea::Session).unwrap(), 1);
    assert_eq!(db.kv_len(StorageArea::Local).unwrap(), 1);
    assert_eq!(db.kv_get(StorageArea::Session, "a").unwrap(), None);
  }

  #[test]
  fn test_readable_cookie_string_scoping() {
    let db = Database::open_in_memory().unwrap();
    db.set_cookie(&Cookie::new("theme", "dark", "localhost")).unwrap();
    db.set_cookie(&Cookie::new("sid", "x", "localhost").http_only()).unwrap();
    db.set_cookie(&Cookie::new("scoped", "y", "localhost").with_path("/admin")).unwrap();
    db.set_cookie(&Cookie::new("other", "z", "example.com")).unwrap();

    assert_eq!(db.readable_cookie_string("localhost", "/").unwrap(), "theme=dark");
    assert_eq!(
      db.readable_cookie_string("localhost", "/admin/x").unwrap(),
      "theme=dark; scoped=y"
    );
    assert!(!Cookie::new("a", "b", "localhost").with_path("/ad").visible_to("localhost", "/admin"));
  }

  #[test]
  fn test_expire_cookie_needs_exact_path() {
    let db = Database::open_in_memory().unwrap();
    db.set_cookie(&Cookie::new("scoped", "y", "localhost").with_path("/admin")).unwrap();
    db.set_cookie(&Cookie::new("theme", "dark", ".localhost")).unwrap();

    assert!(!db.expire_cookie("scoped", "localhost", "/").unwrap());
    assert!(db.expire_cookie("theme", "localhost", "/").unwrap());
    assert_eq!(db.cookies().unwrap().len(), 1);
  }

  #[test]
  fn test_last_reset_record_is_latest() {
    let db = Database::open_in_memory().unwrap();
    assert!(db.last_reset_record().unwrap().is_none());

    let t0 = Utc::now();
    db.insert_reset_record(&ResetRecord::begin("rs-1", t0)).unwrap();
    db.insert_reset_record(&ResetRecord::begin("rs-2", t0 + chrono::Duration::seconds(5)))
      .unwrap();
    db.complete_reset_record("rs-2", t0 + chrono::Duration::seconds(6), &ResetCounts::default())
      .unwrap();

    let last = db.last_reset_record().unwrap().unwrap();
    assert_eq!(last.reset_id, "rs-2");
    assert!(!last.is_partial());
    assert_eq!(last.counts, Some(ResetCounts::default()));
  }

  #[test]
  fn test_reset_records_are_pruned() {
    let db = Database::open_in_memory().unwrap();
    let t0 = Utc::now();
    for i in 0..RESET_RECORDS_KEPT + 5 {
      let id = format!("rs-{}", i);
      db.insert_reset_record(&ResetRecord::begin(&id, t0 + chrono::Duration::seconds(i)))
        .unwrap();
    }

    let ids: Vec<String> = {
      let conn = db.lock().unwrap();
      let mut stmt = conn
        .prepare("SELECT reset_id FROM reset_records ORDER BY started_at")
        .unwrap();
      let rows = stmt.query_map([], |row| row.get(0)).unwrap();
      rows.collect::<rusqlite::Result<_>>().unwrap()
    };
    assert_eq!(ids.len() as i64, RESET_RECORDS_KEPT);
    assert_eq!(ids[0], "rs-5");
    assert_eq!(
      db.last_reset_record().unwrap().unwrap().reset_id,
      format!("rs-{}", RESET_RECORDS_KEPT + 4)
    );
  }
}
