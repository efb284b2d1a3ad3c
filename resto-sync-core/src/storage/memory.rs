use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard};

use super::{KeyLock, KeyValueStore, StorageError};

/// In-process store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    locked: Mutex<HashSet<String>>,
    unlocked: Condvar,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn locked(&self) -> MutexGuard<'_, HashSet<String>> {
        self.locked.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries().remove(key);
        Ok(())
    }

    fn lock_key(&self, key: &str) -> Result<KeyLock<'_>, StorageError> {
        let mut locked = self.locked();
        while locked.contains(key) {
            locked = self
                .unlocked
                .wait(locked)
                .unwrap_or_else(|e| e.into_inner());
        }
        locked.insert(key.to_string());

        let key = key.to_string();
        Ok(KeyLock::new(move || {
            self.locked().remove(&key);
            self.unlocked.notify_all();
        }))
    }
}
