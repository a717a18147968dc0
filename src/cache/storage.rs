//! Record storage trait with SQLite and in-memory implementations.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, StoreError};

/// Which copy of a record a row holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CopyKind {
  /// Current working value
  Local,
  /// Baseline captured before the first unsynced edit
  Shadow,
}

impl CopyKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      CopyKind::Local => "local",
      CopyKind::Shadow => "shadow",
    }
  }

  pub fn parse(s: &str) -> Result<Self> {
    match s {
      "local" => Ok(CopyKind::Local),
      "shadow" => Ok(CopyKind::Shadow),
      other => Err(StoreError::Schema(format!("unknown copy kind '{}'", other))),
    }
  }
}

impl fmt::Display for CopyKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Primary key of a stored row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey {
  pub resource_type: String,
  pub scope_key: String,
  pub copy_kind: CopyKind,
  /// Encoded record id (see `keys::encode_id`)
  pub record_id: String,
}

impl RowKey {
  pub fn new(
    resource_type: impl Into<String>,
    scope_key: impl Into<String>,
    copy_kind: CopyKind,
    record_id: impl Into<String>,
  ) -> Self {
    Self {
      resource_type: resource_type.into(),
      scope_key: scope_key.into(),
      copy_kind,
      record_id: record_id.into(),
    }
  }

  /// Same record, other copy.
  pub fn with_kind(&self, copy_kind: CopyKind) -> Self {
    Self {
      copy_kind,
      ..self.clone()
    }
  }
}

/// A single stored row. A `None` payload is a meaningful value, not a miss.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
  pub key: RowKey,
  pub payload: Option<Value>,
}

/// Trait for record storage backends.
///
/// Every method is a point operation that is atomic on its own; nothing here
/// spans several rows.
pub trait RecordStorage: Send + Sync {
  /// Insert or replace a row.
  fn upsert(&self, key: &RowKey, payload: Option<&Value>) -> Result<()>;

  /// Insert a row only if none exists for the key. Returns whether it was inserted.
  fn insert_if_absent(&self, key: &RowKey, payload: Option<&Value>) -> Result<bool>;

  /// Delete a row. Returns whether it existed.
  fn delete(&self, key: &RowKey) -> Result<bool>;

  /// Get a single row.
  fn get(&self, key: &RowKey) -> Result<Option<StoredRow>>;

  /// Whether a row exists, whatever its payload.
  fn exists(&self, key: &RowKey) -> Result<bool>;

  /// All rows of a scope, optionally restricted to one copy kind.
  ///
  /// Order is backend specific and not stable across writes: SQLite lists in
  /// row insertion order, and replacing a row moves it to the end, while
  /// [`MemoryStorage`] lists in key order. Callers must not rely on either.
  fn list(
    &self,
    resource_type: &str,
    scope_key: &str,
    copy_kind: Option<CopyKind>,
  ) -> Result<Vec<StoredRow>>;

  /// Apply a JSON merge patch (RFC 7396) to an existing row and return the
  /// merged payload, or None if the row does not exist.
  fn merge_patch(&self, key: &RowKey, patch: &Value) -> Result<Option<Value>>;

  /// Delete every row of a scope. Returns the number of rows removed.
  fn clear_scope(&self, resource_type: &str, scope_key: &str) -> Result<usize>;
}

/// Apply `patch` onto `target` with JSON merge patch semantics: null deletes
/// a member, objects merge recursively, anything else replaces.
pub fn merge_patch(target: &mut Value, patch: &Value) {
  let Value::Object(patch_map) = patch else {
    *target = patch.clone();
    return;
  };

  if !target.is_object() {
    *target = Value::Object(serde_json::Map::new());
  }

  if let Value::Object(target_map) = target {
    for (key, value) in patch_map {
      if value.is_null() {
        target_map.remove(key);
      } else {
        merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
      }
    }
  }
}

/// Schema version written to `PRAGMA user_version` after bootstrap.
pub const SCHEMA_VERSION: i64 = 1;

/// Schema for the record table.
const CACHE_SCHEMA: &str = r#"
BEGIN;

-- One row per (resource, scope, copy, record); payload is serialized JSON
CREATE TABLE IF NOT EXISTS records (
    resource_type TEXT NOT NULL,
    scope_key TEXT NOT NULL DEFAULT '',
    copy_kind TEXT NOT NULL CHECK (copy_kind IN ('local', 'shadow')),
    record_id TEXT NOT NULL,
    payload TEXT,
    PRIMARY KEY (resource_type, scope_key, copy_kind, record_id)
);

PRAGMA user_version = 1;

COMMIT;
"#;

/// SQLite-based record storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the database at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StoreError::Schema(format!(
          "Failed to create cache directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path)?;
    debug!(path = %path.display(), "opened cache database");
    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
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
      .ok_or_else(|| StoreError::Schema("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("stagecache").join("cache.db"))
  }

  /// Create the record table the first time a database is opened.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn.lock()?;

    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    match version {
      0 => {
        conn.execute_batch(CACHE_SCHEMA)?;
        info!(version = SCHEMA_VERSION, "bootstrapped cache schema");
        Ok(())
      }
      SCHEMA_VERSION => Ok(()),
      other => Err(StoreError::Schema(format!(
        "database schema version {} is newer than supported version {}",
        other, SCHEMA_VERSION
      ))),
    }
  }
}

/// A JSON null payload is stored as a missing payload. `ResourceStore`
/// rejects null documents before they get here.
fn non_null(payload: Option<&Value>) -> Option<&Value> {
  payload.filter(|v| !v.is_null())
}

fn encode_payload(payload: Option<&Value>) -> Result<Option<String>> {
  Ok(non_null(payload).map(serde_json::to_string).transpose()?)
}

fn decode_payload(text: Option<String>) -> Result<Option<Value>> {
  Ok(text.as_deref().map(serde_json::from_str).transpose()?)
}

impl RecordStorage for SqliteStorage {
  fn upsert(&self, key: &RowKey, payload: Option<&Value>) -> Result<()> {
    let conn = self.conn.lock()?;
    let data = encode_payload(payload)?;

    conn.execute(
      "INSERT OR REPLACE INTO records (resource_type, scope_key, copy_kind, record_id, payload)
       VALUES (?1, ?2, ?3, ?4, ?5)",
      params![
        key.resource_type,
        key.scope_key,
        key.copy_kind.as_str(),
        key.record_id,
        data
      ],
    )?;

    debug!(resource = %key.resource_type, kind = %key.copy_kind, id = %key.record_id, "upserted row");
    Ok(())
  }

  fn insert_if_absent(&self, key: &RowKey, payload: Option<&Value>) -> Result<bool> {
    let conn = self.conn.lock()?;
    let data = encode_payload(payload)?;

    let inserted = conn.execute(
      "INSERT OR IGNORE INTO records (resource_type, scope_key, copy_kind, record_id, payload)
       VALUES (?1, ?2, ?3, ?4, ?5)",
      params![
        key.resource_type,
        key.scope_key,
        key.copy_kind.as_str(),
        key.record_id,
        data
      ],
    )?;

    Ok(inserted > 0)
  }

  fn delete(&self, key: &RowKey) -> Result<bool> {
    let conn = self.conn.lock()?;

    let deleted = conn.execute(
      "DELETE FROM records
       WHERE resource_type = ?1 AND scope_key = ?2 AND copy_kind = ?3 AND record_id = ?4",
      params![
        key.resource_type,
        key.scope_key,
        key.copy_kind.as_str(),
        key.record_id
      ],
    )?;

    Ok(deleted > 0)
  }

  fn get(&self, key: &RowKey) -> Result<Option<StoredRow>> {
    let conn = self.conn.lock()?;

    let text: Option<Option<String>> = conn
      .query_row(
        "SELECT payload FROM records
         WHERE resource_type = ?1 AND scope_key = ?2 AND copy_kind = ?3 AND record_id = ?4",
        params![
          key.resource_type,
          key.scope_key,
          key.copy_kind.as_str(),
          key.record_id
        ],
        |row| row.get(0),
      )
      .optional()?;

    match text {
      Some(text) => Ok(Some(StoredRow {
        key: key.clone(),
        payload: decode_payload(text)?,
      })),
      None => Ok(None),
    }
  }

  fn exists(&self, key: &RowKey) -> Result<bool> {
    let conn = self.conn.lock()?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM records
         WHERE resource_type = ?1 AND scope_key = ?2 AND copy_kind = ?3 AND record_id = ?4",
        params![
          key.resource_type,
          key.scope_key,
          key.copy_kind.as_str(),
          key.record_id
        ],
        |row| row.get(0),
      )
      .optional()?;

    Ok(found.is_some())
  }

  fn list(
    &self,
    resource_type: &str,
    scope_key: &str,
    copy_kind: Option<CopyKind>,
  ) -> Result<Vec<StoredRow>> {
    let conn = self.conn.lock()?;

    let mut stmt = conn.prepare(
      "SELECT copy_kind, record_id, payload FROM records
       WHERE resource_type = ?1 AND scope_key = ?2 AND (?3 IS NULL OR copy_kind = ?3)
       ORDER BY rowid",
    )?;

    let raw: Vec<(String, String, Option<String>)> = stmt
      .query_map(
        params![resource_type, scope_key, copy_kind.map(|k| k.as_str())],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )?
      .collect::<rusqlite::Result<_>>()?;

    raw
      .into_iter()
      .map(|(kind, record_id, text)| {
        Ok(StoredRow {
          key: RowKey::new(resource_type, scope_key, CopyKind::parse(&kind)?, record_id),
          payload: decode_payload(text)?,
        })
      })
      .collect()
  }

  fn merge_patch(&self, key: &RowKey, patch: &Value) -> Result<Option<Value>> {
    let conn = self.conn.lock()?;
    let patch = serde_json::to_string(patch)?;

    // json_patch implements RFC 7396; a null payload patches like an empty object
    let merged: Option<Option<String>> = conn
      .query_row(
        "UPDATE records SET payload = json_patch(COALESCE(payload, '{}'), ?5)
         WHERE resource_type = ?1 AND scope_key = ?2 AND copy_kind = ?3 AND record_id = ?4
         RETURNING payload",
        params![
          key.resource_type,
          key.scope_key,
          key.copy_kind.as_str(),
          key.record_id,
          patch
        ],
        |row| row.get(0),
      )
      .optional()?;

    debug!(resource = %key.resource_type, id = %key.record_id, applied = merged.is_some(), "merge patch");
    decode_payload(merged.flatten())
  }

  fn clear_scope(&self, resource_type: &str, scope_key: &str) -> Result<usize> {
    let conn = self.conn.lock()?;

    let removed = conn.execute(
      "DELETE FROM records WHERE resource_type = ?1 AND scope_key = ?2",
      params![resource_type, scope_key],
    )?;

    Ok(removed)
  }
}

/// Storage that keeps rows in process memory.
///
/// Rows are listed in key order.
#[derive(Default)]
pub struct MemoryStorage {
  rows: Mutex<BTreeMap<RowKey, Option<Value>>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl RecordStorage for MemoryStorage {
  fn upsert(&self, key: &RowKey, payload: Option<&Value>) -> Result<()> {
    self.rows.lock()?.insert(key.clone(), non_null(payload).cloned());
    Ok(())
  }

  fn insert_if_absent(&self, key: &RowKey, payload: Option<&Value>) -> Result<bool> {
    let mut rows = self.rows.lock()?;
    if rows.contains_key(key) {
      return Ok(false);
    }
    rows.insert(key.clone(), non_null(payload).cloned());
    Ok(true)
  }

  fn delete(&self, key: &RowKey) -> Result<bool> {
    Ok(self.rows.lock()?.remove(key).is_some())
  }

  fn get(&self, key: &RowKey) -> Result<Option<StoredRow>> {
    Ok(self.rows.lock()?.get(key).map(|payload| StoredRow {
      key: key.clone(),
      payload: payload.clone(),
    }))
  }

  fn exists(&self, key: &RowKey) -> Result<bool> {
    Ok(self.rows.lock()?.contains_key(key))
  }

  fn list(
    &self,
    resource_type: &str,
    scope_key: &str,
    copy_kind: Option<CopyKind>,
  ) -> Result<Vec<StoredRow>> {
    let rows = self.rows.lock()?;
    Ok(
      rows
        .iter()
        .filter(|(key, _)| {
          key.resource_type == resource_type
            && key.scope_key == scope_key
            && copy_kind.map_or(true, |kind| key.copy_kind == kind)
        })
        .map(|(key, payload)| StoredRow {
          key: key.clone(),
          payload: payload.clone(),
        })
        .collect(),
    )
  }

  fn merge_patch(&self, key: &RowKey, patch: &Value) -> Result<Option<Value>> {
    let mut rows = self.rows.lock()?;
    let Some(slot) = rows.get_mut(key) else {
      return Ok(None);
    };

    let mut target = slot.take().unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    merge_patch(&mut target, patch);
    *slot = Some(target.clone());
    Ok(Some(target))
  }

  fn clear_scope(&self, resource_type: &str, scope_key: &str) -> Result<usize> {
    let mut rows = self.rows.lock()?;
    let before = rows.len();
    rows.retain(|key, _| !(key.resource_type == resource_type && key.scope_key == scope_key));
    Ok(before - rows.len())
  }
}
