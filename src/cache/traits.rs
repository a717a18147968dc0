//! Core traits and types for the caching system.

use serde::{de::DeserializeOwned, Serialize, Serializer};
use serde_json::Value;

use super::keys::RecordId;

/// Trait for records that can be cached.
///
/// Implementors are stored as JSON documents and must expose their
/// identifier so rows can be keyed without running the storage transform.
pub trait Resource: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Identifier of this record, or None if it has none (such records
  /// cannot be stored).
  fn record_id(&self) -> Option<RecordId>;
}

/// Untyped documents are keyed by their top-level `id` field.
impl Resource for Value {
  fn record_id(&self) -> Option<RecordId> {
    self.get("id").and_then(|id| RecordId::from_value(id).ok())
  }
}

/// Baseline state of a record, as seen through its shadow row.
///
/// Whether a shadow row exists is the dirty flag; its payload is only the
/// starting point for diffing.
#[derive(Debug, Clone, PartialEq)]
pub enum Baseline<R> {
  /// No shadow row: the record is clean.
  Untracked,
  /// Shadow row with a null payload, written when the record was stored.
  /// The local copy is authoritative and there is nothing to diff against.
  Sentinel,
  /// Local payload captured before the first mutation since the last sync.
  Snapshot(R),
}

impl<R> Baseline<R> {
  pub fn is_untracked(&self) -> bool {
    matches!(self, Baseline::Untracked)
  }

  pub fn is_tracked(&self) -> bool {
    !self.is_untracked()
  }

  pub fn snapshot(&self) -> Option<&R> {
    match self {
      Baseline::Snapshot(r) => Some(r),
      _ => None,
    }
  }
}

// Untracked is never serialized on its own; CacheEntry skips the field.
impl<R: Serialize> Serialize for Baseline<R> {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    match self {
      Baseline::Snapshot(record) => record.serialize(serializer),
      Baseline::Untracked | Baseline::Sentinel => serializer.serialize_none(),
    }
  }
}

/// Combined local and shadow view of one record, as consumed by a sync
/// process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry<R> {
  pub id: RecordId,
  /// Current working copy, None if destroyed locally
  pub local: Option<R>,
  #[serde(skip_serializing_if = "Baseline::is_untracked")]
  pub shadow: Baseline<R>,
}

impl<R> CacheEntry<R> {
  pub fn is_tracked(&self) -> bool {
    self.shadow.is_tracked()
  }
}

/// Result envelope returned by refresh operations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Refreshed<T> {
  /// The records read from the cache
  pub data: T,
  /// Set when some cached rows could not be turned back into records
  pub error: Option<String>,
}

impl<T> Refreshed<T> {
  pub fn ok(data: T) -> Self {
    Self { data, error: None }
  }
}
