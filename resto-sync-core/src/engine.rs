//! UI-facing facade over the cache, the log and the sync machinery.
//!
//! Every write lands in the operation log first and in the cache second,
//! whether or not the client is online. Replay happens only through
//! [`SyncEngine::sync_now`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::EntityCache;
use crate::connectivity::ConnectivityMonitor;
use crate::entity::{EntityId, EntityPatch, EntityRecord, EntityType};
use crate::error::{Result, SyncError};
use crate::lock::{SyncLock, DEFAULT_LOCK_TTL};
use crate::merge::{FetchOutcome, MergeEngine};
use crate::oplog::{Mutation, OperationKind, OperationLog, PendingOperation};
use crate::remote::{Endpoints, Remote};
use crate::storage::{FileStore, KeyValueStore};
use crate::sync::{DrainOutcome, SyncOrchestrator};

/// Tunables for a [`SyncEngine`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub lock_ttl: Duration,
    pub endpoints: Endpoints,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_LOCK_TTL,
            endpoints: Endpoints::default(),
        }
    }
}

/// Aggregate state for "N changes pending" style indicators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub pending: usize,
    pub online: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub draining: bool,
}

pub struct SyncEngine {
    cache: Arc<EntityCache>,
    log: Arc<OperationLog>,
    monitor: ConnectivityMonitor,
    endpoints: Endpoints,
    merge: MergeEngine,
    orchestrator: SyncOrchestrator,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        remote: Arc<dyn Remote>,
        monitor: ConnectivityMonitor,
        settings: EngineSettings,
    ) -> Self {
        let cache = Arc::new(EntityCache::new(store.clone()));
        let log = Arc::new(OperationLog::new(store.clone()));
        let merge = MergeEngine::new(
            cache.clone(),
            log.clone(),
            monitor.clone(),
            remote.clone(),
            settings.endpoints.clone(),
        );
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            cache.clone(),
            log.clone(),
            SyncLock::new(store, settings.lock_ttl),
            monitor.clone(),
            remote,
        );

        Self {
            cache,
            log,
            monitor,
            endpoints: settings.endpoints,
            merge,
            orchestrator,
        }
    }

    /// Opens an engine persisting to files under `data_dir`.
    pub fn open(
        data_dir: PathBuf,
        remote: Arc<dyn Remote>,
        monitor: ConnectivityMonitor,
        settings: EngineSettings,
    ) -> Self {
        Self::new(Arc::new(FileStore::new(data_dir)), remote, monitor, settings)
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    /// Records a new entity locally under a fresh temporary id.
    ///
    /// Any id already set on `record` is replaced.
    pub fn create(&self, mut record: EntityRecord) -> Result<EntityId> {
        let entity_type = record.entity_type();
        let id = EntityId::temporary();
        record.set_id(id.clone());

        self.log.enqueue(
            entity_type,
            Mutation::Create {
                record: record.clone(),
            },
            self.endpoints.for_kind(entity_type, OperationKind::Create),
        )?;
        self.cache.upsert(record)?;

        tracing::info!(%entity_type, %id, "Created locally");
        Ok(id)
    }

    /// Applies `patch` to a cached record and queues it for the server.
    pub fn update(&self, entity_type: EntityType, id: &EntityId, patch: EntityPatch) -> Result<()> {
        self.require(entity_type, id)?;

        self.log.enqueue(
            entity_type,
            Mutation::Update {
                id: id.clone(),
                patch: patch.clone(),
            },
            self.endpoints.for_kind(entity_type, OperationKind::Update),
        )?;
        self.cache.apply_patch(entity_type, id, &patch)?;

        tracing::info!(%entity_type, %id, "Updated locally");
        Ok(())
    }

    /// Removes a cached record and queues the delete for the server.
    pub fn delete(&self, entity_type: EntityType, id: &EntityId) -> Result<()> {
        self.require(entity_type, id)?;

        self.log.enqueue(
            entity_type,
            Mutation::Delete { id: id.clone() },
            self.endpoints.for_kind(entity_type, OperationKind::Delete),
        )?;
        self.cache.remove(entity_type, id)?;

        tracing::info!(%entity_type, %id, "Deleted locally");
        Ok(())
    }

    /// The cached view, without touching the network.
    pub fn list(&self, entity_type: EntityType) -> Vec<EntityRecord> {
        self.cache.records(entity_type)
    }

    pub fn get(&self, entity_type: EntityType, id: &EntityId) -> Option<EntityRecord> {
        self.cache.get(entity_type, id)
    }

    /// Pending operations in enqueue order.
    pub fn pending(&self) -> Vec<PendingOperation> {
        self.log.list()
    }

    /// Refreshes `entity_type` from the server, keeping local edits.
    pub async fn fetch(&self, entity_type: EntityType) -> FetchOutcome {
        self.merge.fetch(entity_type).await
    }

    /// Drains the operation log once.
    pub async fn sync_now(&self) -> Result<DrainOutcome> {
        self.orchestrator.drain().await
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            pending: self.log.len(),
            online: self.monitor.is_online(),
            last_synced_at: self.orchestrator.last_synced_at(),
            draining: self.orchestrator.is_draining(),
        }
    }

    fn require(&self, entity_type: EntityType, id: &EntityId) -> Result<()> {
        if self.cache.get(entity_type, id).is_none() {
            return Err(SyncError::NotFound {
                entity_type,
                id: id.clone(),
            });
        }
        Ok(())
    }
}
