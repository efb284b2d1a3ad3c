//! Persistent key-value storage shared by the cache, the operation log and
//! the sync lock.
//!
//! Every value is a JSON document stored under a logical key:
//! - `cache.<collection>`: entity snapshot for one entity type
//! - `pending_operations`: the operation log
//! - `last_sync`: timestamp of the last drain that left nothing behind
//! - `sync_lock`: the drain lock (absent when unlocked)

mod file;
mod memory;

use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

pub use file::FileStore;
pub use memory::MemoryStore;

pub const PENDING_OPERATIONS_KEY: &str = "pending_operations";
pub const LAST_SYNC_KEY: &str = "last_sync";
pub const SYNC_LOCK_KEY: &str = "sync_lock";

/// Key under which the snapshot for a collection is cached.
pub fn cache_key(collection: &str) -> String {
    format!("cache.{}", collection)
}

/// Synchronous key-value persistence.
///
/// Implementations must make `put` and `remove` durable before returning.
pub trait KeyValueStore: Send + Sync {
    /// Returns the stored text, or `StorageError::Corrupt` when the bytes on
    /// disk are not text at all.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn put(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Excludes every other holder of `key` on the same storage, including
    /// other handles and other processes, until the returned guard drops.
    ///
    /// Read-modify-write callers hold this across the read and the write.
    /// Not reentrant: taking the same key twice on one thread deadlocks.
    fn lock_key(&self, key: &str) -> Result<KeyLock<'_>, StorageError>;
}

/// Exclusive access to one storage key. Released on drop.
#[must_use = "the key is unlocked as soon as the guard is dropped"]
pub struct KeyLock<'a> {
    release: Option<Box<dyn FnOnce() + Send + 'a>>,
}

impl<'a> KeyLock<'a> {
    /// A guard that runs `release` when dropped.
    pub fn new(release: impl FnOnce() + Send + 'a) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Serializes `value` and stores it under `key`.
pub(crate) fn put_json<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let encoded = serde_json::to_string(value).map_err(|e| StorageError::Encode {
        key: key.to_string(),
        source: e,
    })?;
    store.put(key, &encoded)
}

/// Errors that can occur during storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode value for '{key}': {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// The stored bytes are unusable. `contents` is a lossy rendering kept
    /// for backups.
    #[error("Corrupt data for '{key}': {reason}")]
    Corrupt {
        key: String,
        reason: String,
        contents: String,
    },

    #[error("Invalid storage key: '{0}'")]
    InvalidKey(String),
}
