//! File-backed store: one JSON file per key inside a data directory.
//!
//! Several processes may share a data directory (a long-running `watch`
//! next to one-shot commands), so writes never share a temp file and
//! [`KeyValueStore::lock_key`] takes an OS advisory lock on a `<key>.lock`
//! file next to the data.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use tempfile::NamedTempFile;

use super::{KeyLock, KeyValueStore, StorageError};

#[derive(Debug, Clone)]
pub struct FileStore {
    data_dir: PathBuf,
}

impl FileStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Returns the file backing `key`.
    pub fn path(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.data_dir.join(format!("{}.json", key)))
    }

    fn ensure_dir(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.data_dir).map_err(|e| StorageError::Io {
            path: self.data_dir.clone(),
            source: e,
        })
    }
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path(key)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Io { path, source: e }),
        };
        match String::from_utf8(bytes) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) => Err(StorageError::Corrupt {
                key: key.to_string(),
                reason: e.utf8_error().to_string(),
                contents: String::from_utf8_lossy(e.as_bytes()).into_owned(),
            }),
        }
    }

    /// Writes to a uniquely named temp file in the data directory, syncs it
    /// and renames it over the target, so readers never observe a
    /// half-written value.
    fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path(key)?;
        self.ensure_dir()?;

        let write = || -> io::Result<()> {
            let mut file = NamedTempFile::new_in(&self.data_dir)?;
            file.write_all(value.as_bytes())?;
            file.as_file().sync_all()?;
            file.persist(&path).map_err(|e| e.error)?;
            Ok(())
        };
        write().map_err(|e| StorageError::Io {
            path: path.clone(),
            source: e,
        })
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io { path, source: e }),
        }
    }

    fn lock_key(&self, key: &str) -> Result<KeyLock<'_>, StorageError> {
        validate_key(key)?;
        self.ensure_dir()?;
        let path = self.data_dir.join(format!("{}.lock", key));

        let open_and_lock = || -> io::Result<fs::File> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            FileExt::lock_exclusive(&file)?;
            Ok(file)
        };
        let file = open_and_lock().map_err(|e| StorageError::Io {
            path: path.clone(),
            source: e,
        })?;

        // Closing the descriptor drops the advisory lock.
        Ok(KeyLock::new(move || drop(file)))
    }
}
