//! Error types for the record cache.

use thiserror::Error;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum StoreError {
  /// The operation has no local equivalent.
  #[error("{0} is not supported by the local record cache")]
  Unsupported(&'static str),

  #[error("SQLite error: {0}")]
  Storage(#[from] rusqlite::Error),

  #[error("Lock poisoned: {0}")]
  Poisoned(String),

  #[error("Schema error: {0}")]
  Schema(String),

  #[error("Failed to (de)serialize record: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("Transform failed: {0}")]
  Transform(String),

  /// A mutation targeted an id that has no local row.
  #[error("No cached {resource} record with id {id}")]
  MissingRecord { resource: String, id: String },

  #[error("Record has no id")]
  MissingId,

  #[error("Invalid record id: {0}")]
  InvalidId(String),

  /// A document or patch that cannot be told apart from a missing payload.
  #[error("Invalid document: {0}")]
  InvalidDocument(String),

  /// One or more items of a batch failed. Items that succeeded stay committed.
  #[error("{failed} of {total} batch operations failed; first error: {}", .errors.first().map(|e| e.to_string()).unwrap_or_default())]
  Batch {
    failed: usize,
    total: usize,
    errors: Vec<StoreError>,
  },

  #[error("Storage task failed: {0}")]
  Join(#[from] tokio::task::JoinError),
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
  fn from(e: std::sync::PoisonError<T>) -> Self {
    StoreError::Poisoned(e.to_string())
  }
}
