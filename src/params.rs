//! Read-only parameters handed down the flow hierarchy.
//!
//! Where the shared store is the heap every node writes to, params are the
//! stack: a flow passes its params to each node it runs, and an enclosing flow
//! or batch flow layers its own entries on top. Nodes read them through
//! [`ExecutionContext::params`](crate::ExecutionContext::params).

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Params {
    inner: HashMap<String, Value>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: HashMap<String, Value>) -> Self {
        Self { inner: map }
    }

    pub fn set<V: Serialize>(&mut self, key: &str, value: V) -> Result<(), serde_json::Error> {
        self.inner.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Typed read; `None` when the key is absent or does not deserialize into `T`
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.inner
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.inner.get(key)
    }

    /// Layer `overrides` on top of `self`; keys in `overrides` win
    pub fn merge(&self, overrides: &Params) -> Self {
        let mut merged = self.inner.clone();
        merged.extend(overrides.inner.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self { inner: merged }
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn builder() -> ParamsBuilder {
        ParamsBuilder::default()
    }
}

/// Fluent construction of [`Params`]
#[derive(Default)]
pub struct ParamsBuilder {
    inner: HashMap<String, Value>,
}

impl ParamsBuilder {
    /// Insert an already-built JSON value
    pub fn value(mut self, key: &str, value: Value) -> Self {
        self.inner.insert(key.to_string(), value);
        self
    }

    /// Serialize and insert a value
    pub fn insert<V: Serialize>(mut self, key: &str, value: V) -> Result<Self, serde_json::Error> {
        self.inner.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(self)
    }

    pub fn build(self) -> Params {
        Params { inner: self.inner }
    }
}
