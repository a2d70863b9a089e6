//! Free-form per-connection key/value store.
//!
//! Values are held as JSON and converted at the call site, so a lookup either
//! yields the requested type or fails with [`VariableError`].

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::VariableError;

#[derive(Debug, Default)]
pub struct Variables {
    inner: DashMap<String, Value>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Serialize>(&self, key: &str, value: T) -> Result<(), VariableError> {
        let value = serde_json::to_value(value).map_err(|source| VariableError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.inner.insert(key.to_string(), value);
        Ok(())
    }

    /// Fails with [`VariableError::NotFound`] if unset and
    /// [`VariableError::Type`] if the stored value doesn't fit `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, VariableError> {
        let value = self
            .inner
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| VariableError::NotFound(key.to_string()))?;
        serde_json::from_value(value).map_err(|source| VariableError::Type {
            key: key.to_string(),
            source,
        })
    }

    /// Returns `default` when the key is unset or holds another type.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn get_raw(&self, key: &str) -> Option<Value> {
        self.inner.get(key).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.remove(key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&self) {
        self.inner.clear();
    }
}
