//! Operation log: durable list of mutations not yet confirmed by the server.
//!
//! The log is the single source of truth for "not yet durable server-side".
//! Every local write lands here, online or not, and only the sync
//! orchestrator removes entries once the server has confirmed them.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{EntityId, EntityMismatch, EntityPatch, EntityRecord, EntityType};
use crate::error::Result;
use crate::storage::{put_json, KeyValueStore, StorageError, PENDING_OPERATIONS_KEY};

/// Key under which unparseable log contents are preserved.
const CORRUPT_LOG_KEY: &str = "pending_operations.corrupt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

/// What a pending operation does to its record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Mutation {
    Create { record: EntityRecord },
    Update { id: EntityId, patch: EntityPatch },
    Delete { id: EntityId },
}

impl Mutation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Mutation::Create { .. } => OperationKind::Create,
            Mutation::Update { .. } => OperationKind::Update,
            Mutation::Delete { .. } => OperationKind::Delete,
        }
    }

    /// Id of the record this mutation targets.
    pub fn record_id(&self) -> &EntityId {
        match self {
            Mutation::Create { record } => record.id(),
            Mutation::Update { id, .. } | Mutation::Delete { id } => id,
        }
    }

    fn set_record_id(&mut self, new_id: EntityId) {
        match self {
            Mutation::Create { record } => record.set_id(new_id),
            Mutation::Update { id, .. } | Mutation::Delete { id } => *id = new_id,
        }
    }

    /// Entity type carried by the payload itself, if any.
    fn payload_type(&self) -> Option<EntityType> {
        match self {
            Mutation::Create { record } => Some(record.entity_type()),
            Mutation::Update { patch, .. } => Some(patch.entity_type()),
            Mutation::Delete { .. } => None,
        }
    }
}

/// A queued mutation awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub operation_id: Uuid,
    pub entity_type: EntityType,
    pub mutation: Mutation,
    pub target_endpoint: String,
    /// Logical timestamp, strictly increasing across enqueues.
    pub enqueued_at: u64,
    /// Identifies the record this operation belongs to, fixed at enqueue.
    pub group_key: String,
}

impl PendingOperation {
    pub fn kind(&self) -> OperationKind {
        self.mutation.kind()
    }

    pub fn record_id(&self) -> &EntityId {
        self.mutation.record_id()
    }
}

/// Group key shared by every operation on one record.
pub fn group_key(entity_type: EntityType, id: &EntityId) -> String {
    format!("{}:{}", entity_type.collection(), id)
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogState {
    /// Last issued logical timestamp.
    clock: u64,
    operations: Vec<PendingOperation>,
}

/// Persistent, ordered log of pending operations.
pub struct OperationLog {
    store: Arc<dyn KeyValueStore>,
    write_lock: Mutex<()>,
}

impl OperationLog {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Appends a new operation and returns its id.
    ///
    /// The operation is persisted before this returns.
    pub fn enqueue(
        &self,
        entity_type: EntityType,
        mutation: Mutation,
        target_endpoint: impl Into<String>,
    ) -> Result<Uuid> {
        if let Some(payload_type) = mutation.payload_type() {
            if payload_type != entity_type {
                return Err(EntityMismatch {
                    record: entity_type,
                    patch: payload_type,
                }
                .into());
            }
        }

        let target_endpoint = target_endpoint.into();
        let operation_id = Uuid::new_v4();
        let kind = mutation.kind();

        let enqueued_at = self.modify(|state| {
            let now = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
            let enqueued_at = now.max(state.clock + 1);
            state.clock = enqueued_at;
            state.operations.push(PendingOperation {
                operation_id,
                entity_type,
                group_key: group_key(entity_type, mutation.record_id()),
                mutation,
                target_endpoint,
                enqueued_at,
            });
            enqueued_at
        })?;

        tracing::debug!(%operation_id, %entity_type, %kind, enqueued_at, "Operation enqueued");
        Ok(operation_id)
    }

    /// All pending operations, sorted by `enqueued_at`.
    pub fn list(&self) -> Vec<PendingOperation> {
        let mut operations = match self.read_state() {
            Ok(state) => state.operations,
            Err(reason) => {
                tracing::warn!(%reason, "Operation log unreadable, treating as empty");
                Vec::new()
            }
        };
        operations.sort_by_key(|op| op.enqueued_at);
        operations
    }

    /// Pending operations for one entity type, sorted by `enqueued_at`.
    pub fn list_for(&self, entity_type: EntityType) -> Vec<PendingOperation> {
        self.list()
            .into_iter()
            .filter(|op| op.entity_type == entity_type)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes one operation. Removing an unknown id is a no-op.
    pub fn remove(&self, operation_id: Uuid) -> Result<bool> {
        Ok(self.remove_many(&[operation_id])? == 1)
    }

    /// Removes every listed operation in a single write. Returns how many
    /// were present.
    pub fn remove_many(&self, operation_ids: &[Uuid]) -> Result<usize> {
        let removed = self.modify(|state| {
            let before = state.operations.len();
            state
                .operations
                .retain(|op| !operation_ids.contains(&op.operation_id));
            before - state.operations.len()
        })?;
        if removed > 0 {
            tracing::debug!(removed, "Operations removed from log");
        }
        Ok(removed)
    }

    /// Points every queued operation on `from` at `to`, including its group
    /// key. Used once the server has assigned a permanent id.
    pub fn rewrite_record_id(
        &self,
        entity_type: EntityType,
        from: &EntityId,
        to: &EntityId,
    ) -> Result<usize> {
        let rewritten = self.modify(|state| {
            let mut rewritten = 0;
            for op in state
                .operations
                .iter_mut()
                .filter(|op| op.entity_type == entity_type && op.record_id() == from)
            {
                op.mutation.set_record_id(to.clone());
                op.group_key = group_key(entity_type, to);
                rewritten += 1;
            }
            rewritten
        })?;
        Ok(rewritten)
    }

    fn read_state(&self) -> std::result::Result<LogState, String> {
        match self.store.get(PENDING_OPERATIONS_KEY) {
            Ok(Some(contents)) => serde_json::from_str(&contents).map_err(|e| e.to_string()),
            Ok(None) => Ok(LogState::default()),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Read-modify-write of the whole log.
    ///
    /// Holds the in-process mutex and the store's key lock, so neither
    /// another thread nor another process sharing the store can interleave
    /// between the read and the write. Corrupt contents are copied to a side
    /// key before being replaced, so a write never destroys operations that
    /// merely failed to parse.
    fn modify<T>(&self, f: impl FnOnce(&mut LogState) -> T) -> Result<T, StorageError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let _key = self.store.lock_key(PENDING_OPERATIONS_KEY)?;

        let mut state = match self.store.get(PENDING_OPERATIONS_KEY) {
            Ok(Some(contents)) => match serde_json::from_str::<LogState>(&contents) {
                Ok(state) => state,
                Err(e) => self.set_aside(&contents, &e.to_string())?,
            },
            Ok(None) => LogState::default(),
            Err(StorageError::Corrupt {
                reason, contents, ..
            }) => self.set_aside(&contents, &reason)?,
            Err(e) => return Err(e),
        };

        let result = f(&mut state);
        put_json(self.store.as_ref(), PENDING_OPERATIONS_KEY, &state)?;
        Ok(result)
    }

    fn set_aside(&self, contents: &str, reason: &str) -> Result<LogState, StorageError> {
        tracing::error!(
            error = %reason,
            backup = CORRUPT_LOG_KEY,
            "Operation log corrupt, preserving contents and starting empty"
        );
        self.store.put(CORRUPT_LOG_KEY, contents)?;
        Ok(LogState::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::storage::{FileStore, MemoryStore};
    use serde_json::json;
    use tempfile::TempDir;

    fn test_log() -> (OperationLog, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (OperationLog::new(store.clone()), store)
    }

    fn create_item(id: &EntityId) -> Mutation {
        Mutation::Create {
            record: EntityRecord::from_remote(EntityType::Item, json!({"id": id, "name": "Tea"}))
                .unwrap(),
        }
    }

    fn update_item(id: &str, patch: serde_json::Value) -> Mutation {
        Mutation::Update {
            id: id.into(),
            patch: EntityPatch::from_value(EntityType::Item, patch).unwrap(),
        }
    }

    #[test]
    fn test_enqueue_assigns_increasing_timestamps() {
        let (log, _store) = test_log();
        let temp = EntityId::temporary();

        let first = log
            .enqueue(EntityType::Item, create_item(&temp), "items/create")
            .unwrap();
        let second = log
            .enqueue(
                EntityType::Item,
                update_item(temp.as_str(), json!({"price": 2.0})),
                "items/update",
            )
            .unwrap();

        let ops = log.list();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].operation_id, first);
        assert_eq!(ops[1].operation_id, second);
        assert!(ops[0].enqueued_at < ops[1].enqueued_at);
        assert_eq!(ops[0].group_key, ops[1].group_key);
        assert_eq!(ops[0].group_key, format!("items:{}", temp));
    }

    #[test]
    fn test_enqueue_rejects_mismatched_payload() {
        let (log, _store) = test_log();
        let result = log.enqueue(
            EntityType::Category,
            create_item(&EntityId::temporary()),
            "categories/create",
        );
        assert!(matches!(result, Err(SyncError::EntityMismatch(_))));
        assert!(log.is_empty());
    }

    #[test]
    fn test_list_for_filters_by_entity_type() {
        let (log, _store) = test_log();
        log.enqueue(EntityType::Item, update_item("1", json!({"price": 1.0})), "items/update")
            .unwrap();
        log.enqueue(
            EntityType::Table,
            Mutation::Delete { id: "9".into() },
            "tables/delete",
        )
        .unwrap();

        let tables = log.list_for(EntityType::Table);
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].kind(), OperationKind::Delete);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let (log, _store) = test_log();
        let id = log
            .enqueue(EntityType::Item, Mutation::Delete { id: "5".into() }, "items/delete")
            .unwrap();

        assert!(!log.remove(Uuid::new_v4()).unwrap());
        assert_eq!(log.len(), 1);
        assert!(log.remove(id).unwrap());
        assert!(log.is_empty());
    }

    #[test]
    fn test_clock_survives_drain() {
        let (log, _store) = test_log();
        let first = log
            .enqueue(EntityType::Item, Mutation::Delete { id: "1".into() }, "items/delete")
            .unwrap();
        let stamp = log.list()[0].enqueued_at;
        log.remove(first).unwrap();

        log.enqueue(EntityType::Item, Mutation::Delete { id: "2".into() }, "items/delete")
            .unwrap();
        assert!(log.list()[0].enqueued_at > stamp);
    }

    #[test]
    fn test_rewrite_record_id_updates_group_key() {
        let (log, _store) = test_log();
        let temp = EntityId::temporary();
        log.enqueue(
            EntityType::Item,
            update_item(temp.as_str(), json!({"price": 4.0})),
            "items/update",
        )
        .unwrap();

        let permanent = EntityId::from(42);
        assert_eq!(
            log.rewrite_record_id(EntityType::Item, &temp, &permanent)
                .unwrap(),
            1
        );

        let op = &log.list()[0];
        assert_eq!(op.record_id(), &permanent);
        assert_eq!(op.group_key, "items:42");
    }

    #[test]
    fn test_corrupt_log_is_preserved_before_overwrite() {
        let (log, store) = test_log();
        store.put(PENDING_OPERATIONS_KEY, "[[[").unwrap();

        assert!(log.list().is_empty());

        log.enqueue(EntityType::Item, Mutation::Delete { id: "1".into() }, "items/delete")
            .unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(store.get(CORRUPT_LOG_KEY).unwrap().as_deref(), Some("[[["));
    }

    #[test]
    fn test_non_utf8_log_is_set_aside() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join("pending_operations.json"),
            [0xff, 0xfe, b'['],
        )
        .unwrap();
        let store = Arc::new(FileStore::new(temp_dir.path().to_path_buf()));
        let log = OperationLog::new(store.clone());

        assert!(log.list().is_empty());
        log.enqueue(EntityType::Item, Mutation::Delete { id: "1".into() }, "items/delete")
            .unwrap();

        assert_eq!(log.len(), 1);
        assert!(store.get(CORRUPT_LOG_KEY).unwrap().is_some());
    }

    #[test]
    fn test_two_handles_on_one_directory_keep_every_operation() {
        let temp_dir = TempDir::new().unwrap();
        let open = || OperationLog::new(Arc::new(FileStore::new(temp_dir.path().to_path_buf())));
        let (first, second) = (open(), open());

        std::thread::scope(|scope| {
            for log in [&first, &second] {
                scope.spawn(move || {
                    for i in 0..100u64 {
                        log.enqueue(
                            EntityType::Item,
                            Mutation::Delete { id: i.into() },
                            "items/delete",
                        )
                        .unwrap();
                    }
                });
            }
        });

        let ops = open().list();
        assert_eq!(ops.len(), 200);
        assert!(ops.windows(2).all(|w| w[0].enqueued_at < w[1].enqueued_at));
    }

    #[test]
    fn test_operations_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().to_path_buf();
        let id = OperationLog::new(Arc::new(FileStore::new(path.clone())))
            .enqueue(EntityType::Item, Mutation::Delete { id: "7".into() }, "items/delete")
            .unwrap();

        let reopened = OperationLog::new(Arc::new(FileStore::new(path)));
        let ops = reopened.list();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation_id, id);
    }
}
