use super::StorageBackend;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::convert::Infallible;

/// Process-local storage, the default for every run.
///
/// Entries are kept ordered, so `keys()` lists them sorted and two runs that
/// wrote the same data compare equal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InMemoryStorage {
    entries: BTreeMap<String, Value>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FromIterator<(String, Value)> for InMemoryStorage {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl StorageBackend for InMemoryStorage {
    type Error = Infallible;

    fn set(&mut self, key: String, value: Value) -> Result<(), Infallible> {
        self.entries.insert(key, value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Value>, Infallible> {
        Ok(self.entries.get(key).cloned())
    }

    fn remove(&mut self, key: &str) -> Result<Option<Value>, Infallible> {
        Ok(self.entries.remove(key))
    }

    fn contains_key(&self, key: &str) -> Result<bool, Infallible> {
        Ok(self.entries.contains_key(key))
    }

    fn keys(&self) -> Result<Vec<String>, Infallible> {
        Ok(self.entries.keys().cloned().collect())
    }

    fn clear(&mut self) -> Result<(), Infallible> {
        self.entries.clear();
        Ok(())
    }

    fn len(&self) -> Result<usize, Infallible> {
        Ok(self.entries.len())
    }
}
