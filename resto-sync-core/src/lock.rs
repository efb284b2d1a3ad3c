//! Drain lock persisted next to the data it protects.
//!
//! The lock lives in the same store as the cache and the operation log, so
//! its state survives restarts and there is no separate in-memory flag that
//! could disagree with it. A holder that crashed leaves its record behind;
//! once the record is older than the TTL the next drain reclaims it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::{put_json, KeyValueStore, StorageError, SYNC_LOCK_KEY};

/// Default lock lifetime. Must comfortably exceed the slowest drain.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockRecord {
    holder: Uuid,
    acquired_at: DateTime<Utc>,
}

/// Observed state of the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Unlocked,
    Held { acquired_at: DateTime<Utc> },
    /// Held for longer than the TTL; the next acquisition reclaims it.
    Abandoned { acquired_at: DateTime<Utc> },
}

pub struct SyncLock {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
    rmw: Mutex<()>,
}

impl SyncLock {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            rmw: Mutex::new(()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Acquires the lock unless a live holder exists.
    ///
    /// Returns `Ok(None)` when another drain owns the lock. The returned
    /// guard releases the lock when dropped.
    pub fn try_acquire(&self) -> Result<Option<LockGuard<'_>>, StorageError> {
        let _rmw = self.rmw.lock().unwrap_or_else(|e| e.into_inner());
        let _key = self.store.lock_key(SYNC_LOCK_KEY)?;
        let now = Utc::now();

        match self.read()? {
            Some(Ok(record)) if !self.is_expired(record.acquired_at, now) => {
                tracing::debug!(holder = %record.holder, "Sync lock held elsewhere");
                return Ok(None);
            }
            Some(Ok(record)) => {
                tracing::warn!(
                    holder = %record.holder,
                    acquired_at = %record.acquired_at,
                    ttl_secs = self.ttl.as_secs(),
                    "Reclaiming abandoned sync lock"
                );
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Sync lock record corrupt, reclaiming");
            }
            None => {}
        }

        let record = LockRecord {
            holder: Uuid::new_v4(),
            acquired_at: now,
        };
        put_json(self.store.as_ref(), SYNC_LOCK_KEY, &record)?;
        tracing::debug!(holder = %record.holder, "Sync lock acquired");

        Ok(Some(LockGuard {
            lock: self,
            holder: record.holder,
            released: false,
        }))
    }

    /// Reports the current lock state, applying the TTL check.
    pub fn status(&self) -> Result<LockStatus, StorageError> {
        Ok(match self.read()? {
            None => LockStatus::Unlocked,
            Some(Ok(record)) if self.is_expired(record.acquired_at, Utc::now()) => {
                LockStatus::Abandoned {
                    acquired_at: record.acquired_at,
                }
            }
            Some(Ok(record)) => LockStatus::Held {
                acquired_at: record.acquired_at,
            },
            Some(Err(_)) => LockStatus::Abandoned {
                acquired_at: DateTime::<Utc>::default(),
            },
        })
    }

    fn is_expired(&self, acquired_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match now.signed_duration_since(acquired_at).to_std() {
            Ok(age) => age >= self.ttl,
            // Acquired "in the future": clock moved backwards, treat as live.
            Err(_) => false,
        }
    }

    /// The stored record, with unparseable or non-text data as `Some(Err)`.
    fn read(&self) -> Result<Option<Result<LockRecord, String>>, StorageError> {
        match self.store.get(SYNC_LOCK_KEY) {
            Ok(contents) => Ok(contents
                .map(|contents| serde_json::from_str(&contents).map_err(|e| e.to_string()))),
            Err(StorageError::Corrupt { reason, .. }) => Ok(Some(Err(reason))),
            Err(e) => Err(e),
        }
    }

    /// Removes the lock record if it still belongs to `holder`.
    fn release(&self, holder: Uuid) -> Result<(), StorageError> {
        let _rmw = self.rmw.lock().unwrap_or_else(|e| e.into_inner());
        let _key = self.store.lock_key(SYNC_LOCK_KEY)?;
        match self.read()? {
            Some(Ok(record)) if record.holder != holder => {
                tracing::warn!(
                    holder = %holder,
                    current = %record.holder,
                    "Sync lock was reclaimed by another drain, leaving it in place"
                );
                Ok(())
            }
            _ => {
                self.store.remove(SYNC_LOCK_KEY)?;
                tracing::debug!(%holder, "Sync lock released");
                Ok(())
            }
        }
    }
}

/// Scoped ownership of the sync lock. Dropping it releases the lock.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    lock: &'a SyncLock,
    holder: Uuid,
    released: bool,
}

impl LockGuard<'_> {
    pub fn holder(&self) -> Uuid {
        self.holder
    }

    /// Releases the lock now, reporting storage failures.
    pub fn release(mut self) -> Result<(), StorageError> {
        self.released = true;
        self.lock.release(self.holder)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.lock.release(self.holder) {
            tracing::error!(error = %e, "Failed to release sync lock");
        }
    }
}
