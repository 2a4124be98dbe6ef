//! In-memory cache backend with per-entry expiry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde_json::Value;
use tokio::time::Instant;

use super::CacheProvider;
use crate::Result;

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-memory cache with per-entry expiry.
///
/// Expired entries are dropped lazily when read and by
/// [`MemoryCache::purge_expired`]. There is no size bound or LRU.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, Slot>>>,
}

impl MemoryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| slot.is_live(now))
            .count()
    }

    /// Returns true if no live entries remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, slot| slot.is_live(now));
        before - entries.len()
    }
}

#[async_trait]
impl CacheProvider for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(key) {
                None => return Ok(None),
                Some(slot) if slot.is_live(now) => return Ok(Some(slot.value.clone())),
                Some(_) => {}
            }
        }
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), Slot { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some())
    }

    async fn clear(&self) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    async fn iterate(&self) -> Result<BoxStream<'static, (String, Value)>> {
        let now = Instant::now();
        let snapshot: Vec<(String, Value)> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, slot)| slot.is_live(now))
            .map(|(key, slot)| (key.clone(), slot.value.clone()))
            .collect();
        Ok(stream::iter(snapshot).boxed())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let cache = MemoryCache::new();
        cache
            .set("short", Value::from(1), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        cache.set("forever", Value::from(2), None).await.unwrap();
        assert_eq!(cache.len(), 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get("short").await.unwrap().is_none());
        assert_eq!(cache.get("forever").await.unwrap(), Some(Value::from(2)));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn iterate_skips_expired() {
        let cache = MemoryCache::new();
        cache
            .set("a", Value::Null, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        cache.set("b", Value::Null, None).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let keys: Vec<String> = cache.iterate().await.unwrap().map(|(k, _)| k).collect().await;
        assert_eq!(keys, vec!["b"]);
        assert_eq!(cache.purge_expired(), 1);
    }

    #[tokio::test]
    async fn overwrite_replaces() {
        let cache = MemoryCache::new();
        cache.set("k", Value::from("old"), None).await.unwrap();
        cache.set("k", Value::from("new"), None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(Value::from("new")));
        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn clones_share_storage() {
        let cache = MemoryCache::new();
        let other = cache.clone();
        other.set("k", Value::Bool(true), None).await.unwrap();
        assert!(cache.get("k").await.unwrap().is_some());
        cache.clear().await.unwrap();
        assert!(other.is_empty());
    }
}
