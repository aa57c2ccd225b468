//! Storage backends for the shared store
//!
//! The shared store is a thin typed layer over a [`StorageBackend`]:
//!
//! - Memory storage (always available)
//! - File snapshot storage (feature: `storage-file`)
//!
//! A store lives for one flow run. Callers that want to carry state into a later
//! run either keep the store around or use a file snapshot they save explicitly.

use serde_json::Value;
use std::error::Error;

/// Where a [`SharedStore`](crate::SharedStore) keeps its JSON values.
///
/// Methods are synchronous and take `&mut self` for writes; the flow hands the
/// store to one node at a time, so no locking happens here.
pub trait StorageBackend: Send + Sync {
    type Error: Error + Send + Sync + 'static;

    /// Insert or overwrite `key`
    fn set(&mut self, key: String, value: Value) -> Result<(), Self::Error>;

    fn get(&self, key: &str) -> Result<Option<Value>, Self::Error>;

    /// Returns the previous value, if any
    fn remove(&mut self, key: &str) -> Result<Option<Value>, Self::Error>;

    fn contains_key(&self, key: &str) -> Result<bool, Self::Error>;

    fn keys(&self) -> Result<Vec<String>, Self::Error>;

    fn clear(&mut self) -> Result<(), Self::Error>;

    fn len(&self) -> Result<usize, Self::Error>;

    fn is_empty(&self) -> Result<bool, Self::Error> {
        self.len().map(|len| len == 0)
    }
}

mod memory;
pub use memory::InMemoryStorage;

#[cfg(feature = "storage-file")]
mod file;
#[cfg(feature = "storage-file")]
pub use file::{FileStorage, FileStorageError};
