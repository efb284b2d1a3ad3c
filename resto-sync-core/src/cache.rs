//! Entity cache: the client's current view of each record set.
//!
//! One snapshot per entity type. Reads never fail: a missing snapshot is the
//! normal first-run state, and a corrupt one degrades to an empty list so the
//! client stays usable offline. [`CacheLoad`] keeps the two cases apart for
//! callers that care.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{EntityId, EntityPatch, EntityRecord, EntityType};
use crate::error::Result;
use crate::storage::{cache_key, put_json, KeyValueStore, StorageError};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheSnapshot {
    saved_at: DateTime<Utc>,
    records: Vec<EntityRecord>,
}

/// Outcome of reading a cached snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLoad {
    Snapshot {
        records: Vec<EntityRecord>,
        saved_at: DateTime<Utc>,
    },
    /// Nothing has been saved for this entity type yet.
    Missing,
    /// Stored data could not be parsed.
    CorruptionDetected { reason: String },
    /// The store itself could not be read.
    Unavailable { reason: String },
}

impl CacheLoad {
    /// Records of the snapshot, empty for every other outcome.
    pub fn into_records(self) -> Vec<EntityRecord> {
        match self {
            CacheLoad::Snapshot { records, .. } => records,
            _ => Vec::new(),
        }
    }

    pub fn saved_at(&self) -> Option<DateTime<Utc>> {
        match self {
            CacheLoad::Snapshot { saved_at, .. } => Some(*saved_at),
            _ => None,
        }
    }
}

/// Per-entity-type snapshot store.
pub struct EntityCache {
    store: Arc<dyn KeyValueStore>,
    write_lock: Mutex<()>,
}

impl EntityCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Replaces the full snapshot for `entity_type`.
    pub fn save(
        &self,
        entity_type: EntityType,
        records: Vec<EntityRecord>,
    ) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let _key = self.store.lock_key(&cache_key(entity_type.collection()))?;
        self.write(entity_type, records)
    }

    /// Returns the last saved snapshot.
    pub fn load(&self, entity_type: EntityType) -> CacheLoad {
        let key = cache_key(entity_type.collection());
        let contents = match self.store.get(&key) {
            Ok(Some(contents)) => contents,
            Ok(None) => return CacheLoad::Missing,
            Err(StorageError::Corrupt { reason, .. }) => {
                tracing::warn!(%entity_type, %reason, "Entity cache corrupt, treating as empty");
                return CacheLoad::CorruptionDetected { reason };
            }
            Err(e) => {
                tracing::warn!(%entity_type, error = %e, "Entity cache unreadable");
                return CacheLoad::Unavailable {
                    reason: e.to_string(),
                };
            }
        };

        let snapshot: CacheSnapshot = match serde_json::from_str(&contents) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(%entity_type, error = %e, "Entity cache corrupt, treating as empty");
                return CacheLoad::CorruptionDetected {
                    reason: e.to_string(),
                };
            }
        };

        if let Some(stray) = snapshot
            .records
            .iter()
            .find(|r| r.entity_type() != entity_type)
        {
            let reason = format!(
                "{} record {} found in {} snapshot",
                stray.entity_type(),
                stray.id(),
                entity_type
            );
            tracing::warn!(%entity_type, %reason, "Entity cache corrupt, treating as empty");
            return CacheLoad::CorruptionDetected { reason };
        }

        CacheLoad::Snapshot {
            records: snapshot.records,
            saved_at: snapshot.saved_at,
        }
    }

    /// Snapshot records, or empty when missing or unreadable.
    pub fn records(&self, entity_type: EntityType) -> Vec<EntityRecord> {
        self.load(entity_type).into_records()
    }

    /// Finds a record by id.
    pub fn get(&self, entity_type: EntityType, id: &EntityId) -> Option<EntityRecord> {
        self.records(entity_type)
            .into_iter()
            .find(|r| r.id() == id)
    }

    /// Read-modify-write on one snapshot as a single step, exclusive
    /// against other threads and other processes sharing the store.
    pub fn modify<T>(
        &self,
        entity_type: EntityType,
        f: impl FnOnce(&mut Vec<EntityRecord>) -> T,
    ) -> Result<T, StorageError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let _key = self.store.lock_key(&cache_key(entity_type.collection()))?;
        let mut records = self.records(entity_type);
        let result = f(&mut records);
        self.write(entity_type, records)?;
        Ok(result)
    }

    /// Inserts `record`, replacing any record with the same id.
    pub fn upsert(&self, record: EntityRecord) -> Result<(), StorageError> {
        self.modify(record.entity_type(), |records| {
            match records.iter_mut().find(|r| r.id() == record.id()) {
                Some(existing) => *existing = record,
                None => records.push(record),
            }
        })
    }

    /// Removes the record with `id`. Returns whether it existed.
    pub fn remove(&self, entity_type: EntityType, id: &EntityId) -> Result<bool, StorageError> {
        self.modify(entity_type, |records| {
            let before = records.len();
            records.retain(|r| r.id() != id);
            records.len() != before
        })
    }

    /// Overlays `patch` onto the cached record with `id`. Returns whether
    /// the record was cached.
    pub fn apply_patch(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        patch: &EntityPatch,
    ) -> Result<bool> {
        let applied = self.modify(entity_type, |records| {
            match records.iter_mut().find(|r| r.id() == id) {
                Some(record) => record.apply(patch).map(|()| true),
                None => Ok(false),
            }
        })??;
        Ok(applied)
    }

    /// Moves the record stored under `temp_id` to `permanent_id`.
    ///
    /// Any record already cached under `permanent_id` is dropped first so
    /// exactly one record remains under the new id. Returns whether the
    /// temporary record was found.
    pub fn promote(
        &self,
        entity_type: EntityType,
        temp_id: &EntityId,
        permanent_id: &EntityId,
    ) -> Result<bool, StorageError> {
        self.modify(entity_type, |records| {
            if !records.iter().any(|r| r.id() == temp_id) {
                return false;
            }
            records.retain(|r| r.id() != permanent_id);
            for record in records.iter_mut().filter(|r| r.id() == temp_id) {
                record.set_id(permanent_id.clone());
            }
            true
        })
    }

    fn write(
        &self,
        entity_type: EntityType,
        records: Vec<EntityRecord>,
    ) -> Result<(), StorageError> {
        let snapshot = CacheSnapshot {
            saved_at: Utc::now(),
            records,
        };
        put_json(
            self.store.as_ref(),
            &cache_key(entity_type.collection()),
            &snapshot,
        )?;
        tracing::debug!(%entity_type, count = snapshot.records.len(), "Entity cache saved");
        Ok(())
    }
}
