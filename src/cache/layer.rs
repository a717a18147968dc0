//! Staging layer that tracks local mutations against a captured baseline.

use futures::future::join_all;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

use super::keys::{encode_id, encode_scope, RecordId};
use super::storage::{CopyKind, RecordStorage, RowKey};
use super::traits::Resource;
use super::transform::Pipeline;
use crate::error::{Result, StoreError};

/// Behaviour switches for a [`ResourceStore`].
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
  /// Track shadow rows so a sync process can find pending changes.
  /// When off, mutations only touch local rows.
  pub caching: bool,
}

impl Default for StoreOptions {
  fn default() -> Self {
    Self { caching: true }
  }
}

/// Handle returned by [`ResourceStore::subscribe_offline_changes`].
///
/// The store never pushes change notifications, so dropping or keeping
/// this handle has no effect.
#[derive(Debug, Default)]
pub struct OfflineSubscription;

impl OfflineSubscription {
  pub fn unsubscribe(self) {}
}

/// Local cache for one resource type under one query scope.
///
/// Every mutation first makes sure a shadow row exists for the record
/// (capturing the pre-mutation local value), then changes the local row.
/// The shadow row stays until [`ResourceStore::sync`] removes it.
pub struct ResourceStore<R, S: RecordStorage> {
  pub(super) storage: Arc<S>,
  pub(super) resource_type: String,
  pub(super) scope_key: String,
  pub(super) pipeline: Pipeline,
  options: StoreOptions,
  _marker: PhantomData<fn() -> R>,
}

impl<R: Resource, S: RecordStorage + 'static> ResourceStore<R, S> {
  /// Create a store for `resource_type` records cached under the query
  /// parameters `scope`.
  pub fn new(storage: Arc<S>, resource_type: impl Into<String>, scope: &Value) -> Self {
    Self {
      storage,
      resource_type: resource_type.into(),
      scope_key: encode_scope(scope),
      pipeline: Pipeline::default(),
      options: StoreOptions::default(),
      _marker: PhantomData,
    }
  }

  pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
    self.pipeline = pipeline;
    self
  }

  pub fn with_options(mut self, options: StoreOptions) -> Self {
    self.options = options;
    self
  }

  pub fn resource_type(&self) -> &str {
    &self.resource_type
  }

  pub fn scope_key(&self) -> &str {
    &self.scope_key
  }

  pub(super) fn key(&self, copy_kind: CopyKind, id: &RecordId) -> RowKey {
    RowKey::new(&self.resource_type, &self.scope_key, copy_kind, encode_id(id))
  }

  /// Run a storage call on the blocking pool.
  pub(super) async fn blocking<T, F>(&self, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T> + Send + 'static,
  {
    let storage = Arc::clone(&self.storage);
    tokio::task::spawn_blocking(move || f(storage.as_ref())).await?
  }

  /// Turn a stored payload back into a record.
  pub(super) async fn decode(&self, payload: Value) -> Result<R> {
    let doc = self.pipeline.to_domain(payload).await?;
    Ok(serde_json::from_value(doc)?)
  }

  fn missing(&self, id: &RecordId) -> StoreError {
    StoreError::MissingRecord {
      resource: self.resource_type.clone(),
      id: id.to_string(),
    }
  }

  /// Write a record to the local copy.
  ///
  /// With caching on, the record is marked as tracked with a null baseline
  /// unless it is already tracked. Returns the record unchanged.
  pub async fn store(&self, record: R) -> Result<R> {
    let id = record.record_id().ok_or(StoreError::MissingId)?;
    let doc = self.pipeline.to_storage(serde_json::to_value(&record)?).await?;
    if doc.is_null() {
      return Err(StoreError::InvalidDocument(format!("record {} stores as null", id)));
    }

    let local = self.key(CopyKind::Local, &id);
    let shadow = local.with_kind(CopyKind::Shadow);
    let caching = self.options.caching;

    self
      .blocking(move |s| {
        s.upsert(&local, Some(&doc))?;
        if caching {
          s.insert_if_absent(&shadow, None)?;
        }
        Ok(())
      })
      .await?;

    debug!(resource = %self.resource_type, %id, "stored record");
    Ok(record)
  }

  /// Store several records concurrently. Records that were written stay
  /// written when others fail.
  pub async fn batch_store(&self, records: Vec<R>) -> Result<Vec<R>> {
    let results = join_all(records.into_iter().map(|record| self.store(record))).await;
    collect_batch("store", results)
  }

  /// Merge-patch the local copy of a record and return the result.
  ///
  /// Null members of `partial` delete fields, others overwrite or add.
  /// The first mutation after a clean state copies the current local value
  /// into the shadow row. `partial` must be a JSON object.
  pub async fn update(&self, id: impl Into<RecordId>, partial: Value) -> Result<R> {
    let id = id.into();
    if !partial.is_object() {
      return Err(StoreError::InvalidDocument(format!(
        "patch for record {} is not an object",
        id
      )));
    }
    let patch = self.pipeline.to_storage(partial).await?;
    if patch.is_null() {
      return Err(StoreError::InvalidDocument(format!("patch for record {} stores as null", id)));
    }

    let local = self.key(CopyKind::Local, &id);
    let caching = self.options.caching;
    let missing = self.missing(&id);

    let merged = self
      .blocking(move |s| {
        let Some(current) = s.get(&local)? else {
          return Err(missing);
        };
        if caching {
          capture_baseline(s, &local, current.payload.as_ref())?;
        }
        // The row can vanish between the read and the patch
        s.merge_patch(&local, &patch)?.ok_or(missing)
      })
      .await?;

    debug!(resource = %self.resource_type, %id, "updated record");
    self.decode(merged).await
  }

  /// Update several records concurrently, without rollback on failure.
  pub async fn batch_update<I, K>(&self, items: I) -> Result<Vec<R>>
  where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<RecordId>,
  {
    let results = join_all(
      items
        .into_iter()
        .map(|(id, partial)| self.update(id, partial)),
    )
    .await;
    collect_batch("update", results)
  }

  /// Remove the local copy of a record. The record stays tracked until it
  /// is synced.
  pub async fn destroy(&self, id: impl Into<RecordId>) -> Result<()> {
    let id = id.into();
    let local = self.key(CopyKind::Local, &id);
    let caching = self.options.caching;
    let missing = self.missing(&id);

    self
      .blocking(move |s| {
        let Some(current) = s.get(&local)? else {
          return Err(missing);
        };
        if caching {
          capture_baseline(s, &local, current.payload.as_ref())?;
        }
        s.delete(&local)?;
        Ok(())
      })
      .await?;

    debug!(resource = %self.resource_type, %id, "destroyed record");
    Ok(())
  }

  /// Destroy several records concurrently, without rollback on failure.
  pub async fn batch_destroy<I, K>(&self, ids: I) -> Result<()>
  where
    I: IntoIterator<Item = K>,
    K: Into<RecordId>,
  {
    let results = join_all(ids.into_iter().map(|id| self.destroy(id))).await;
    collect_batch("destroy", results).map(|_| ())
  }

  /// Predicate queries cannot be answered from the local cache.
  pub async fn query(&self, _params: &Value) -> Result<Vec<R>> {
    Err(StoreError::Unsupported("query"))
  }

  /// Register interest in local changes. The store does not notify, so the
  /// listener is never called.
  pub fn subscribe_offline_changes<F>(&self, _listener: F) -> OfflineSubscription
  where
    F: Fn() + Send + Sync + 'static,
  {
    OfflineSubscription
  }
}

/// Copy the pre-mutation local payload into the shadow row unless the
/// record is already tracked.
fn capture_baseline<S: RecordStorage>(
  storage: &S,
  local: &RowKey,
  payload: Option<&Value>,
) -> Result<()> {
  let shadow = local.with_kind(CopyKind::Shadow);
  if storage.insert_if_absent(&shadow, payload)? {
    debug!(resource = %local.resource_type, id = %local.record_id, "captured baseline");
  }
  Ok(())
}

/// Gather the results of independent batch items. Any failure turns the
/// whole batch into an error; successful items are not undone.
pub(super) fn collect_batch<T>(operation: &str, results: Vec<Result<T>>) -> Result<Vec<T>> {
  let total = results.len();
  let mut values = Vec::with_capacity(total);
  let mut errors = Vec::new();

  for result in results {
    match result {
      Ok(value) => values.push(value),
      Err(e) => errors.push(e),
    }
  }

  if errors.is_empty() {
    return Ok(values);
  }

  warn!(
    operation,
    failed = errors.len(),
    total,
    "batch finished with failures"
  );
  Err(StoreError::Batch {
    failed: errors.len(),
    total,
    errors,
  })
}

impl<R, S: RecordStorage> Clone for ResourceStore<R, S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      resource_type: self.resource_type.clone(),
      scope_key: self.scope_key.clone(),
      pipeline: self.pipeline.clone(),
      options: self.options,
      _marker: PhantomData,
    }
  }
}
