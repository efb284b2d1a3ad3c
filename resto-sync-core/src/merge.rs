//! Merge engine: builds the local view after a fresh fetch.
//!
//! The server's list is authoritative for every record nobody touched
//! locally. Local-only records (temporary ids) and queued edits are laid on
//! top, so a fetch never silently undoes work that has not synced yet.

use std::sync::Arc;

use crate::cache::EntityCache;
use crate::connectivity::ConnectivityMonitor;
use crate::entity::{EntityRecord, EntityType};
use crate::oplog::{Mutation, OperationLog, PendingOperation};
use crate::remote::{Endpoints, Remote};

/// Where the records of a fetch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    /// Offline: the cached snapshot, network skipped.
    Offline,
    /// Fresh server list merged with local state.
    Remote,
    /// The fetch failed; the cached snapshot stands in.
    CacheFallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub records: Vec<EntityRecord>,
    pub source: FetchSource,
}

pub struct MergeEngine {
    cache: Arc<EntityCache>,
    log: Arc<OperationLog>,
    monitor: ConnectivityMonitor,
    remote: Arc<dyn Remote>,
    endpoints: Endpoints,
}

impl MergeEngine {
    pub fn new(
        cache: Arc<EntityCache>,
        log: Arc<OperationLog>,
        monitor: ConnectivityMonitor,
        remote: Arc<dyn Remote>,
        endpoints: Endpoints,
    ) -> Self {
        Self {
            cache,
            log,
            monitor,
            remote,
            endpoints,
        }
    }

    /// Fetches `entity_type` and returns the merged local view.
    ///
    /// Never fails: when the network is unavailable the cached snapshot is
    /// returned instead.
    pub async fn fetch(&self, entity_type: EntityType) -> FetchOutcome {
        if !self.monitor.is_online() {
            return FetchOutcome {
                records: self.cache.records(entity_type),
                source: FetchSource::Offline,
            };
        }

        let endpoint = self.endpoints.view(entity_type);
        let raw = match self.remote.fetch_all(&endpoint).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(%entity_type, error = %e, "Fetch failed, using cached snapshot");
                return FetchOutcome {
                    records: self.cache.records(entity_type),
                    source: FetchSource::CacheFallback,
                };
            }
        };

        let fetched: Vec<EntityRecord> = raw
            .into_iter()
            .filter_map(|value| match EntityRecord::from_remote(entity_type, value) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(%entity_type, error = %e, "Skipping undecodable server record");
                    None
                }
            })
            .collect();

        // Read, merge and write under the cache's lock so a local write
        // landing meanwhile is either merged in or applied afterwards.
        let saved = self.cache.modify(entity_type, |records| {
            let cached = std::mem::take(records);
            *records = merge_snapshot(fetched.clone(), cached, &self.log.list_for(entity_type));
            records.clone()
        });
        let merged = match saved {
            Ok(merged) => merged,
            Err(e) => {
                tracing::warn!(%entity_type, error = %e, "Failed to persist merged snapshot");
                merge_snapshot(
                    fetched,
                    self.cache.records(entity_type),
                    &self.log.list_for(entity_type),
                )
            }
        };
        tracing::debug!(%entity_type, count = merged.len(), "Merged server snapshot");

        FetchOutcome {
            records: merged,
            source: FetchSource::Remote,
        }
    }
}

/// Combines a server list with local-only records and pending edits.
///
/// Order matters: start from the server list, append cached records with
/// temporary ids, then replay pending updates and finally pending deletes in
/// enqueue order.
pub fn merge_snapshot(
    fetched: Vec<EntityRecord>,
    cached: Vec<EntityRecord>,
    pending: &[PendingOperation],
) -> Vec<EntityRecord> {
    let mut merged = fetched;
    for record in cached {
        if record.id().is_temporary() && !merged.iter().any(|r| r.id() == record.id()) {
            merged.push(record);
        }
    }

    let mut pending: Vec<&PendingOperation> = pending.iter().collect();
    pending.sort_by_key(|op| op.enqueued_at);

    for op in &pending {
        if let Mutation::Update { id, patch } = &op.mutation {
            for record in merged.iter_mut().filter(|r| r.id() == id) {
                if let Err(e) = record.apply(patch) {
                    tracing::warn!(operation_id = %op.operation_id, error = %e, "Skipping pending update");
                }
            }
        }
    }

    for op in &pending {
        if let Mutation::Delete { id } = &op.mutation {
            merged.retain(|r| r.id() != id);
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityId, EntityPatch};
    use crate::remote::{RemoteError, Submission};
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    /// Serves a fixed listing, or fails every fetch.
    struct ListingRemote {
        listing: Mutex<Result<Vec<Value>, RemoteError>>,
    }

    #[async_trait]
    impl Remote for ListingRemote {
        async fn submit(&self, _: &str, _: Submission) -> Result<Value, RemoteError> {
            Err(RemoteError::Transport("not used".to_string()))
        }

        async fn fetch_all(&self, _: &str) -> Result<Vec<Value>, RemoteError> {
            self.listing.lock().unwrap().clone()
        }
    }

    struct Fixture {
        engine: MergeEngine,
        cache: Arc<EntityCache>,
        log: Arc<OperationLog>,
        monitor: ConnectivityMonitor,
    }

    fn fixture(listing: Result<Vec<Value>, RemoteError>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(EntityCache::new(store.clone()));
        let log = Arc::new(OperationLog::new(store));
        let monitor = ConnectivityMonitor::new(true);
        let remote = Arc::new(ListingRemote {
            listing: Mutex::new(listing),
        });
        Fixture {
            engine: MergeEngine::new(
                cache.clone(),
                log.clone(),
                monitor.clone(),
                remote,
                Endpoints::default(),
            ),
            cache,
            log,
            monitor,
        }
    }

    fn item(id: &str, name: &str) -> EntityRecord {
        EntityRecord::from_remote(EntityType::Item, json!({"id": id, "name": name})).unwrap()
    }

    fn name_of(record: &EntityRecord) -> String {
        match record {
            EntityRecord::Item(item) => item.name.clone(),
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offline_returns_cache_without_fetching() {
        let f = fixture(Ok(vec![json!({"id": 1, "name": "Server"})]));
        f.cache.save(EntityType::Item, vec![item("1", "Cached")]).unwrap();
        f.monitor.set_online(false);

        let outcome = f.engine.fetch(EntityType::Item).await;

        assert_eq!(outcome.source, FetchSource::Offline);
        assert_eq!(outcome.records, vec![item("1", "Cached")]);
    }

    #[tokio::test]
    async fn test_fetch_failure_falls_back_to_cache() {
        let f = fixture(Err(RemoteError::Transport("timeout".to_string())));
        f.cache.save(EntityType::Item, vec![item("1", "Cached")]).unwrap();

        let outcome = f.engine.fetch(EntityType::Item).await;

        assert_eq!(outcome.source, FetchSource::CacheFallback);
        assert_eq!(outcome.records, vec![item("1", "Cached")]);
    }

    #[tokio::test]
    async fn test_server_wins_for_untouched_records() {
        let f = fixture(Ok(vec![json!({"id": 1, "name": "Server"})]));
        f.cache.save(EntityType::Item, vec![item("1", "Stale"), item("2", "Gone")]).unwrap();

        let outcome = f.engine.fetch(EntityType::Item).await;

        assert_eq!(outcome.source, FetchSource::Remote);
        assert_eq!(outcome.records, vec![item("1", "Server")]);
        assert_eq!(f.cache.records(EntityType::Item), outcome.records);
    }

    #[test]
    fn test_fetch_keeps_records_created_while_merging() {
        let f = fixture(Ok(vec![json!({"id": 1, "name": "Server"})]));
        let created: Vec<EntityId> = (0..40).map(|_| EntityId::temporary()).collect();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..40 {
                    futures::executor::block_on(f.engine.fetch(EntityType::Item));
                }
            });
            scope.spawn(|| {
                for id in &created {
                    let record = item(id.as_str(), "Local");
                    f.log
                        .enqueue(
                            EntityType::Item,
                            Mutation::Create {
                                record: record.clone(),
                            },
                            "items/create",
                        )
                        .unwrap();
                    f.cache.upsert(record).unwrap();
                }
            });
        });

        let cached = f.cache.records(EntityType::Item);
        for id in &created {
            assert!(cached.iter().any(|r| r.id() == id), "lost {}", id);
        }
    }

    #[tokio::test]
    async fn test_temporary_records_survive_fetch() {
        let f = fixture(Ok(vec![json!({"id": 1, "name": "Server"})]));
        let temp = EntityId::temporary();
        f.cache
            .save(EntityType::Item, vec![item(temp.as_str(), "Local")])
            .unwrap();

        let outcome = f.engine.fetch(EntityType::Item).await;

        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[1].id(), &temp);
    }

    #[tokio::test]
    async fn test_pending_update_and_delete_overlay_server_list() {
        let f = fixture(Ok(vec![
            json!({"id": 1, "name": "Tea", "price": 2.0}),
            json!({"id": 2, "name": "Coffee"}),
        ]));
        f.log
            .enqueue(
                EntityType::Item,
                Mutation::Update {
                    id: "1".into(),
                    patch: EntityPatch::from_value(EntityType::Item, json!({"name": "Chai"}))
                        .unwrap(),
                },
                "items/update",
            )
            .unwrap();
        f.log
            .enqueue(
                EntityType::Item,
                Mutation::Delete { id: "2".into() },
                "items/delete",
            )
            .unwrap();

        let outcome = f.engine.fetch(EntityType::Item).await;

        assert_eq!(outcome.records.len(), 1);
        assert_eq!(name_of(&outcome.records[0]), "Chai");
        match &outcome.records[0] {
            EntityRecord::Item(item) => assert_eq!(item.price, 2.0),
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let f = fixture(Ok(vec![
            json!({"id": 1, "name": "Tea"}),
            json!({"id": 2, "name": "Coffee"}),
        ]));
        f.cache
            .save(EntityType::Item, vec![item(EntityId::temporary().as_str(), "Local")])
            .unwrap();
        f.log
            .enqueue(
                EntityType::Item,
                Mutation::Update {
                    id: "2".into(),
                    patch: EntityPatch::from_value(EntityType::Item, json!({"name": "Latte"}))
                        .unwrap(),
                },
                "items/update",
            )
            .unwrap();

        let first = f.engine.fetch(EntityType::Item).await;
        let after_first = f.cache.records(EntityType::Item);
        let second = f.engine.fetch(EntityType::Item).await;

        assert_eq!(first.records, second.records);
        assert_eq!(after_first, f.cache.records(EntityType::Item));
    }

    #[tokio::test]
    async fn test_undecodable_server_records_are_skipped() {
        let f = fixture(Ok(vec![
            json!({"id": 1, "name": "Tea"}),
            json!({"id": 2, "price": "free"}),
        ]));

        let outcome = f.engine.fetch(EntityType::Item).await;

        assert_eq!(outcome.records, vec![item("1", "Tea")]);
    }
}
