//! Offline-capable local cache for remotely sourced records.
//!
//! Records are cached per resource type and query scope. Local mutations are
//! staged against a baseline captured on first change, so a sync process can
//! later tell what changed and clear the tracking once the remote has it.
//!
//! # Example
//!
//! ```ignore
//! let storage = Arc::new(SqliteStorage::open()?);
//! let todos: ResourceStore<serde_json::Value, _> =
//!   ResourceStore::new(storage, "todo", &json!({"list": 3}));
//!
//! todos.store(json!({"id": 5, "name": "x"})).await?;
//! todos.update(5, json!({"name": "y"})).await?;
//!
//! for entry in todos.pending().await? {
//!   upload(&entry).await?;
//!   todos.sync([entry.id]).await?;
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;

pub use error::{Result, StoreError};
