//! The shared store: the run-scoped key/value context every node reads in
//! `prep` and writes in `post`.
//!
//! Values are `serde_json::Value`, so nodes agree on keys rather than on Rust
//! types. The typed helpers ([`SharedStore::put`], [`SharedStore::get_as`],
//! [`SharedStore::require`]) convert at the edges.

use crate::storage::{InMemoryStorage, StorageBackend};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::BTreeMap;

/// Errors raised by the typed store helpers
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A key a node depends on has not been written yet
    #[error("key not found in shared store: {0}")]
    KeyNotFound(String),

    /// The stored value does not deserialize into the requested type
    #[error("value at key '{key}' has an unexpected shape: {source}")]
    UnexpectedShape {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Key/value context shared by all nodes of one run.
#[derive(Debug)]
pub struct SharedStore<S: StorageBackend> {
    storage: S,
}

/// The default in-memory store
pub type InMemorySharedStore = SharedStore<InMemoryStorage>;

impl<S: StorageBackend> SharedStore<S> {
    pub fn with_storage(storage: S) -> Self {
        Self { storage }
    }

    pub fn set(&mut self, key: String, value: Value) -> Result<(), S::Error> {
        self.storage.set(key, value)
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>, S::Error> {
        self.storage.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Result<Option<Value>, S::Error> {
        self.storage.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> Result<bool, S::Error> {
        self.storage.contains_key(key)
    }

    pub fn keys(&self) -> Result<Vec<String>, S::Error> {
        self.storage.keys()
    }

    pub fn clear(&mut self) -> Result<(), S::Error> {
        self.storage.clear()
    }

    pub fn len(&self) -> Result<usize, S::Error> {
        self.storage.len()
    }

    pub fn is_empty(&self) -> Result<bool, S::Error> {
        self.storage.is_empty()
    }

    /// Serialize `value` and store it under `key`
    pub fn put<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: T,
    ) -> Result<(), StoreError> {
        let json_value = serde_json::to_value(value)?;
        self.storage
            .set(key.into(), json_value)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    /// Read and deserialize the value at `key`, if present
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.storage.get(key) {
            Ok(Some(value)) => serde_json::from_value(value)
                .map(Some)
                .map_err(|source| StoreError::UnexpectedShape {
                    key: key.to_string(),
                    source,
                }),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    /// Like [`get_as`](Self::get_as), but a missing key is an error.
    ///
    /// This is what `prep` phases use for their required inputs.
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T, StoreError> {
        self.get_as(key)?
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))
    }

    /// Copy of every entry, ordered by key
    pub fn snapshot(&self) -> Result<BTreeMap<String, Value>, S::Error> {
        let mut entries = BTreeMap::new();
        for key in self.storage.keys()? {
            if let Some(value) = self.storage.get(&key)? {
                entries.insert(key, value);
            }
        }
        Ok(entries)
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }
}

impl InMemorySharedStore {
    pub fn new() -> Self {
        Self::with_storage(InMemoryStorage::new())
    }
}

impl Default for InMemorySharedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for InMemorySharedStore {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self::with_storage(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}
