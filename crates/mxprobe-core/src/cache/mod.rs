//! Key-value cache boundary.
//!
//! Resolvers, the sharding service and the probe orchestrator all cache
//! through [`CacheProvider`]. Values are JSON so any backend can store
//! them; keys are plain strings scoped by prefix (`dns:`, `mx:`,
//! `smtp:probe:`). There is no pattern primitive, so prefix queries scan
//! [`CacheProvider::iterate`].

mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

pub use memory::MemoryCache;

/// Storage used by every cache-aware component.
///
/// Implementations must be safe to share between tasks without external
/// locking.
#[async_trait]
pub trait CacheProvider: Send + Sync + std::fmt::Debug {
    /// Returns the live value for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// `None` keeps the entry until it is deleted.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    /// Removes `key`. Returns whether it was present.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Removes every key in `keys`, returning how many were present.
    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Removes everything.
    async fn clear(&self) -> Result<()>;

    /// Streams a snapshot of all live entries.
    async fn iterate(&self) -> Result<BoxStream<'static, (String, Value)>>;
}

impl dyn CacheProvider {
    /// Reads `key` and deserializes it.
    ///
    /// A value that no longer deserializes is treated as a miss.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(value) = self.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(parsed) => Ok(Some(parsed)),
            Err(e) => {
                tracing::debug!(key, error = %e, "discarding undecodable cache entry");
                Ok(None)
            }
        }
    }

    /// Serializes `value` and stores it under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serde`](crate::Error::Serde) or the backend's error.
    pub async fn set_as<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, value, ttl).await
    }

    /// Collects every live key starting with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let keys = self
            .iterate()
            .await?
            .filter_map(|(key, _)| async move { key.starts_with(prefix).then_some(key) })
            .collect::<Vec<String>>()
            .await;
        Ok(keys)
    }
}

/// Cache that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCache;

#[async_trait]
impl CacheProvider for NullCache {
    async fn get(&self, _key: &str) -> Result<Option<Value>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: Value, _ttl: Option<Duration>) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<bool> {
        Ok(false)
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }

    async fn iterate(&self) -> Result<BoxStream<'static, (String, Value)>> {
        Ok(stream::empty().boxed())
    }
}

/// Cache backend selected by configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// In-process map with per-entry expiry.
    #[default]
    Memory,
    /// No caching at all.
    Disabled,
}

impl CacheBackend {
    /// Builds the backend.
    #[must_use]
    pub fn build(self) -> Arc<dyn CacheProvider> {
        match self {
            Self::Memory => Arc::new(MemoryCache::new()),
            Self::Disabled => Arc::new(NullCache),
        }
    }
}
