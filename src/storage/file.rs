use super::{InMemoryStorage, StorageBackend};
use serde_json::Value;
use std::convert::Infallible;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Storage that loads a JSON snapshot on open and writes it back on [`FileStorage::save`].
///
/// Writes stay in memory until the caller saves, so a run never persists
/// anything on its own.
#[derive(Debug, Clone)]
pub struct FileStorage {
    file_path: PathBuf,
    entries: InMemoryStorage,
}

#[derive(Debug, thiserror::Error)]
pub enum FileStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<Infallible> for FileStorageError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

impl FileStorage {
    /// Open a snapshot file; a missing or blank file yields an empty storage
    pub fn open<P: AsRef<Path>>(file_path: P) -> Result<Self, FileStorageError> {
        let file_path = file_path.as_ref().to_path_buf();
        let entries = match fs::read_to_string(&file_path) {
            Ok(content) if content.trim().is_empty() => InMemoryStorage::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => InMemoryStorage::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self { file_path, entries })
    }

    /// Write the current contents to the snapshot file
    pub fn save(&self) -> Result<(), FileStorageError> {
        fs::write(&self.file_path, serde_json::to_string_pretty(&self.entries)?)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }
}

impl StorageBackend for FileStorage {
    type Error = FileStorageError;

    fn set(&mut self, key: String, value: Value) -> Result<(), FileStorageError> {
        Ok(self.entries.set(key, value)?)
    }

    fn get(&self, key: &str) -> Result<Option<Value>, FileStorageError> {
        Ok(self.entries.get(key)?)
    }

    fn remove(&mut self, key: &str) -> Result<Option<Value>, FileStorageError> {
        Ok(self.entries.remove(key)?)
    }

    fn contains_key(&self, key: &str) -> Result<bool, FileStorageError> {
        Ok(self.entries.contains_key(key)?)
    }

    fn keys(&self) -> Result<Vec<String>, FileStorageError> {
        Ok(self.entries.keys()?)
    }

    fn clear(&mut self) -> Result<(), FileStorageError> {
        Ok(self.entries.clear()?)
    }

    fn len(&self) -> Result<usize, FileStorageError> {
        Ok(self.entries.len()?)
    }
}
