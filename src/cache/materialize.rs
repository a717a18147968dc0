//! Read side of the cache: refreshes and the combined local/shadow view a
//! sync process works from.

use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{info, warn};

use super::keys::{decode_id, RecordId};
use super::layer::ResourceStore;
use super::storage::{CopyKind, RecordStorage, StoredRow};
use super::traits::{Baseline, CacheEntry, Refreshed, Resource};
use crate::error::{Result, StoreError};

/// Rows sharing one record id.
#[derive(Default)]
struct Grouped {
  local: Option<StoredRow>,
  shadow: Option<StoredRow>,
}

impl<R: Resource, S: RecordStorage + 'static> ResourceStore<R, S> {
  /// Turn a failure to deserialize into `None` so one stale row does not
  /// hide the rest of the scope.
  fn skip_undecodable<T>(&self, record_id: &str, result: Result<T>) -> Result<Option<T>> {
    match result {
      Ok(value) => Ok(Some(value)),
      Err(StoreError::Serialization(e)) => {
        warn!(resource = %self.resource_type, id = %record_id, error = %e, "skipping undecodable cached record");
        Ok(None)
      }
      Err(e) => Err(e),
    }
  }

  async fn decode_payload(&self, payload: Option<Value>) -> Result<Option<R>> {
    match payload {
      Some(payload) => Ok(Some(self.decode(payload).await?)),
      None => Ok(None),
    }
  }

  /// All locally cached records of the scope, in storage order.
  ///
  /// Rows that no longer deserialize into `R` are skipped and counted in
  /// the envelope's error.
  pub async fn refresh_all(&self) -> Result<Refreshed<Vec<R>>> {
    let resource_type = self.resource_type.clone();
    let scope_key = self.scope_key.clone();
    let rows = self
      .blocking(move |s| s.list(&resource_type, &scope_key, Some(CopyKind::Local)))
      .await?;

    let decoded = join_all(rows.into_iter().map(|row| async move {
      let id = row.key.record_id.clone();
      (id, self.decode_payload(row.payload).await)
    }))
    .await;

    let mut data = Vec::with_capacity(decoded.len());
    let mut skipped = 0;
    for (id, result) in decoded {
      match self.skip_undecodable(&id, result)? {
        Some(Some(record)) => data.push(record),
        Some(None) => {}
        None => skipped += 1,
      }
    }

    let error = (skipped > 0).then(|| {
      format!(
        "{} cached {} record(s) could not be decoded",
        skipped, self.resource_type
      )
    });
    Ok(Refreshed { data, error })
  }

  /// A single cached record, or None if it is not cached.
  pub async fn refresh(&self, id: impl Into<RecordId>) -> Result<Refreshed<Option<R>>> {
    let local = self.key(CopyKind::Local, &id.into());
    let row = self.blocking(move |s| s.get(&local)).await?;

    let record = match row {
      Some(row) => self.decode_payload(row.payload).await?,
      None => None,
    };
    Ok(Refreshed::ok(record))
  }

  /// Local and shadow copies of every record in the scope, grouped by id.
  ///
  /// Records whose local or shadow row no longer deserializes into `R` are
  /// left out and logged, like in [`ResourceStore::refresh_all`].
  pub async fn get_cache(&self) -> Result<Vec<CacheEntry<R>>> {
    let resource_type = self.resource_type.clone();
    let scope_key = self.scope_key.clone();
    let rows = self
      .blocking(move |s| s.list(&resource_type, &scope_key, None))
      .await?;

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Grouped> = HashMap::new();
    for row in rows {
      let group = groups.entry(row.key.record_id.clone()).or_insert_with(|| {
        order.push(row.key.record_id.clone());
        Grouped::default()
      });
      match row.key.copy_kind {
        CopyKind::Local => group.local = Some(row),
        CopyKind::Shadow => group.shadow = Some(row),
      }
    }

    let mut entries = Vec::with_capacity(order.len());
    for record_id in order {
      let Some(group) = groups.remove(&record_id) else {
        continue;
      };

      let local = match group.local {
        Some(row) => self.decode_payload(row.payload).await,
        None => Ok(None),
      };
      let Some(local) = self.skip_undecodable(&record_id, local)? else {
        continue;
      };
      let shadow = match group.shadow {
        None => Ok(Baseline::Untracked),
        Some(row) => self.decode_payload(row.payload).await.map(|payload| match payload {
          Some(record) => Baseline::Snapshot(record),
          None => Baseline::Sentinel,
        }),
      };
      let Some(shadow) = self.skip_undecodable(&record_id, shadow)? else {
        continue;
      };

      entries.push(CacheEntry {
        id: decode_id(&record_id)?,
        local,
        shadow,
      });
    }

    Ok(entries)
  }

  /// Entries with changes waiting to be synced.
  pub async fn pending(&self) -> Result<Vec<CacheEntry<R>>> {
    let entries = self.get_cache().await?;
    Ok(entries.into_iter().filter(CacheEntry::is_tracked).collect())
  }

  /// Confirm that the given records reached the remote source of truth and
  /// stop tracking them. Returns how many were tracked.
  ///
  /// Nothing is checked against the remote; call this only after the upload
  /// succeeded.
  pub async fn sync<I, K>(&self, ids: I) -> Result<usize>
  where
    I: IntoIterator<Item = K>,
    K: Into<RecordId>,
  {
    let keys: Vec<_> = ids
      .into_iter()
      .map(|id| self.key(CopyKind::Shadow, &id.into()))
      .collect();
    let requested = keys.len();

    let cleared = self
      .blocking(move |s| {
        let mut cleared = 0;
        for key in &keys {
          if s.delete(key)? {
            cleared += 1;
          }
        }
        Ok(cleared)
      })
      .await?;

    info!(resource = %self.resource_type, requested, cleared, "synced records");
    Ok(cleared)
  }

  /// Drop every row of this scope, tracked or not.
  pub async fn purge(&self) -> Result<usize> {
    let resource_type = self.resource_type.clone();
    let scope_key = self.scope_key.clone();
    let removed = self
      .blocking(move |s| s.clear_scope(&resource_type, &scope_key))
      .await?;

    info!(resource = %self.resource_type, removed, "purged scope");
    Ok(removed)
  }

  /// Whether a record currently has a shadow row.
  pub async fn is_tracked(&self, id: impl Into<RecordId>) -> Result<bool> {
    let shadow = self.key(CopyKind::Shadow, &id.into());
    self.blocking(move |s| s.exists(&shadow)).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::{MemoryStorage, SqliteStorage};
  use serde_json::json;
  use std::sync::Arc;

  fn todos<S: RecordStorage + 'static>(storage: &Arc<S>, scope: Value) -> ResourceStore<Value, S> {
    ResourceStore::new(Arc::clone(storage), "todo", &scope)
  }

  async fn scenario<S: RecordStorage + 'static>(storage: Arc<S>) {
    let store = todos(&storage, json!({}));

    store.store(json!({"id": 5, "name": "x"})).await.unwrap();
    assert_eq!(
      serde_json::to_value(store.get_cache().await.unwrap()).unwrap(),
      json!([{"id": 5, "local": {"id": 5, "name": "x"}, "shadow": null}])
    );

    store.update(5, json!({"name": "y"})).await.unwrap();
    let cache = store.get_cache().await.unwrap();
    assert_eq!(cache[0].local, Some(json!({"id": 5, "name": "y"})));
    assert_eq!(cache[0].shadow, Baseline::Sentinel);

    assert_eq!(store.sync([5]).await.unwrap(), 1);
    assert_eq!(
      serde_json::to_value(store.get_cache().await.unwrap()).unwrap(),
      json!([{"id": 5, "local": {"id": 5, "name": "y"}}])
    );

    store.destroy(5).await.unwrap();
    let cache = store.get_cache().await.unwrap();
    assert_eq!(cache.len(), 1);
    assert_eq!(cache[0].local, None);
    assert_eq!(cache[0].shadow, Baseline::Snapshot(json!({"id": 5, "name": "y"})));
    assert_eq!(store.refresh(5).await.unwrap(), Refreshed::ok(None));
  }

  #[tokio::test]
  async fn test_scenario_memory() {
    scenario(Arc::new(MemoryStorage::new())).await;
  }

  #[tokio::test]
  async fn test_scenario_sqlite() {
    scenario(Arc::new(SqliteStorage::open_in_memory().unwrap())).await;
  }

  async fn scope_isolation<S: RecordStorage + 'static>(storage: Arc<S>) {
    let page1 = todos(&storage, json!({"page": 1}));
    let page2 = todos(&storage, json!({"page": 2}));
    let notes: ResourceStore<Value, _> = ResourceStore::new(Arc::clone(&storage), "note", &json!({"page": 1}));

    page1.store(json!({"id": 1, "title": "a"})).await.unwrap();
    page2.store(json!({"id": 1, "title": "b"})).await.unwrap();
    notes.store(json!({"id": 1, "title": "c"})).await.unwrap();

    page1.update(1, json!({"title": "a2"})).await.unwrap();
    page1.destroy(1).await.unwrap();
    page1.sync([1]).await.unwrap();

    assert_eq!(page1.refresh_all().await.unwrap().data, Vec::<Value>::new());
    assert_eq!(
      page2.refresh_all().await.unwrap().data,
      vec![json!({"id": 1, "title": "b"})]
    );
    assert_eq!(
      notes.refresh(1).await.unwrap().data,
      Some(json!({"id": 1, "title": "c"}))
    );
    assert!(page2.is_tracked(1).await.unwrap());
    assert!(notes.is_tracked(1).await.unwrap());
  }

  #[tokio::test]
  async fn test_scope_isolation() {
    scope_isolation(Arc::new(MemoryStorage::new())).await;
    scope_isolation(Arc::new(SqliteStorage::open_in_memory().unwrap())).await;
  }

  async fn id_fidelity<S: RecordStorage + 'static>(storage: Arc<S>) {
    let store = todos(&storage, json!({}));

    store.store(json!({"id": 1, "kind": "number"})).await.unwrap();
    store.store(json!({"id": "1", "kind": "string"})).await.unwrap();

    assert_eq!(store.refresh_all().await.unwrap().data.len(), 2);
    assert_eq!(
      store.refresh(1).await.unwrap().data,
      Some(json!({"id": 1, "kind": "number"}))
    );
    assert_eq!(
      store.refresh("1").await.unwrap().data,
      Some(json!({"id": "1", "kind": "string"}))
    );

    let ids: Vec<RecordId> = store
      .get_cache()
      .await
      .unwrap()
      .into_iter()
      .map(|entry| entry.id)
      .collect();
    assert!(ids.contains(&RecordId::Int(1)));
    assert!(ids.contains(&RecordId::from("1")));

    store.update("1", json!({"kind": "text"})).await.unwrap();
    assert_eq!(
      store.refresh(1).await.unwrap().data,
      Some(json!({"id": 1, "kind": "number"}))
    );
  }

  #[tokio::test]
  async fn test_numeric_and_string_ids_do_not_collide() {
    id_fidelity(Arc::new(MemoryStorage::new())).await;
    id_fidelity(Arc::new(SqliteStorage::open_in_memory().unwrap())).await;
  }

  async fn sync_then_recapture<S: RecordStorage + 'static>(storage: Arc<S>) {
    let store = todos(&storage, json!({}));

    store.store(json!({"id": 1, "n": 1})).await.unwrap();
    store.sync([1]).await.unwrap();
    assert!(store.pending().await.unwrap().is_empty());

    store.update(1, json!({"n": 2})).await.unwrap();
    store.update(1, json!({"n": 3})).await.unwrap();
    let pending = store.pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].shadow.snapshot(), Some(&json!({"id": 1, "n": 1})));

    store.sync([1]).await.unwrap();
    store.update(1, json!({"n": 4})).await.unwrap();
    let pending = store.pending().await.unwrap();
    assert_eq!(pending[0].shadow.snapshot(), Some(&json!({"id": 1, "n": 3})));

    // Syncing an untracked id is not an error
    assert_eq!(store.sync([1, 2]).await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_sync_then_recapture() {
    sync_then_recapture(Arc::new(MemoryStorage::new())).await;
    sync_then_recapture(Arc::new(SqliteStorage::open_in_memory().unwrap())).await;
  }

  #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
  struct Named {
    id: i64,
    name: String,
  }

  impl Resource for Named {
    fn record_id(&self) -> Option<RecordId> {
      Some(RecordId::Int(self.id))
    }
  }

  fn named(id: i64) -> Named {
    Named {
      id,
      name: "ok".to_string(),
    }
  }

  async fn undecodable_rows<S: RecordStorage + 'static>(storage: Arc<S>) {
    todos(&storage, json!({})).store(json!({"id": 1})).await.unwrap();

    let typed: ResourceStore<Named, S> = ResourceStore::new(Arc::clone(&storage), "todo", &json!({}));
    typed.store(named(2)).await.unwrap();
    typed.store(named(3)).await.unwrap();
    typed.sync([3]).await.unwrap();
    typed.update(3, json!({"name": "changed"})).await.unwrap();

    let refreshed = typed.refresh_all().await.unwrap();
    assert_eq!(refreshed.data.len(), 2);
    assert!(refreshed.data.contains(&named(2)));
    assert!(refreshed.error.is_some());

    let cache = typed.get_cache().await.unwrap();
    let ids: Vec<RecordId> = cache.iter().map(|entry| entry.id.clone()).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&RecordId::Int(2)));
    assert!(ids.contains(&RecordId::Int(3)));

    let pending = typed.pending().await.unwrap();
    assert_eq!(pending.len(), 2);
    let changed = pending
      .iter()
      .find(|entry| entry.id == RecordId::Int(3))
      .unwrap();
    assert_eq!(changed.shadow.snapshot(), Some(&named(3)));

    // The untyped view still sees every row
    assert_eq!(todos(&storage, json!({})).get_cache().await.unwrap().len(), 3);
  }

  #[tokio::test]
  async fn test_undecodable_rows_are_skipped() {
    undecodable_rows(Arc::new(MemoryStorage::new())).await;
    undecodable_rows(Arc::new(SqliteStorage::open_in_memory().unwrap())).await;
  }

  #[tokio::test]
  async fn test_purge() {
    let storage = Arc::new(MemoryStorage::new());
    let store = todos(&storage, json!({}));
    store
      .batch_store(vec![json!({"id": 1}), json!({"id": 2})])
      .await
      .unwrap();

    assert_eq!(store.purge().await.unwrap(), 4);
    assert!(store.get_cache().await.unwrap().is_empty());
  }
}
