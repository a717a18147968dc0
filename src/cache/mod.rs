//! Offline record cache with staged reconciliation.
//!
//! This module provides a store that:
//! - Keeps a local working copy of each record per resource type and query scope
//! - Captures a baseline ("shadow") the first time a clean record is mutated
//! - Exposes the combined local/shadow view to an external sync process
//! - Clears tracking once the caller confirms a sync

mod keys;
mod layer;
mod materialize;
mod storage;
mod traits;
mod transform;

pub use keys::{decode_id, encode_id, encode_scope, RecordId, EMPTY_SCOPE};
pub use layer::{OfflineSubscription, ResourceStore, StoreOptions};
pub use storage::{
  merge_patch, CopyKind, MemoryStorage, RecordStorage, RowKey, SqliteStorage, StoredRow,
  SCHEMA_VERSION,
};
pub use traits::{Baseline, CacheEntry, Refreshed, Resource};
pub use transform::{decode_dates, encode_dates, BoxFuture, Pipeline, Transform};
