use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::{CacheBackend, CacheError};

/// Typed view over a [`CacheBackend`] that stores JSON values under `prefix:key`.
#[derive(Clone)]
pub struct JsonCache {
    backend: Arc<dyn CacheBackend>,
    prefix: String,
}

impl JsonCache {
    pub fn new(backend: Arc<dyn CacheBackend>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full backend key for `key`
    pub fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.backend.get(&self.key(key)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value)?;
        self.backend.set(&self.key(key), &raw, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.backend.delete(&self.key(key)).await
    }

    /// Every live value under this prefix, or `None` when there are none.
    /// Entries that no longer decode are skipped.
    pub async fn get_many<T: DeserializeOwned>(&self) -> Result<Option<Vec<T>>, CacheError> {
        let keys = self
            .backend
            .keys_with_prefix(&format!("{}:", self.prefix))
            .await?;
        if keys.is_empty() {
            return Ok(None);
        }

        let raw_values = self.backend.get_many(&keys).await?;
        let values: Vec<T> = keys
            .iter()
            .zip(raw_values)
            .filter_map(|(key, raw)| {
                let raw = raw?;
                match serde_json::from_str(&raw) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!(key = %key, error = %e, "Skipping undecodable cache entry");
                        None
                    }
                }
            })
            .collect();

        Ok(if values.is_empty() { None } else { Some(values) })
    }
}
