//! Memory cache implementation using cached::SizedCache with per-entry TTL.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use cached::{Cached, SizedCache};
use tokio::time::Instant;

use crate::cache::{AppCache, CacheError};
use crate::config::settings::MemoryCacheConfig;

struct CacheEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: Vec<u8>, ttl_seconds: u64) -> Self {
        // ttl 0 keeps the entry until it is evicted by size or removed
        let expires_at = (ttl_seconds > 0).then(|| Instant::now() + Duration::from_secs(ttl_seconds));
        Self { value, expires_at }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() >= exp)
    }
}

/// In-memory cache with size limit and per-entry TTL.
///
/// Shared between nodes only when the same instance is handed to each of
/// them, which is what single-process clusters and tests do.
pub struct MemoryCache {
    store: Mutex<SizedCache<String, CacheEntry>>,
    default_ttl: u64,
}

impl MemoryCache {
    pub fn new(config: &MemoryCacheConfig) -> Self {
        Self {
            store: Mutex::new(SizedCache::with_size(config.max_size.max(1))),
            default_ttl: config.ttl_seconds,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SizedCache<String, CacheEntry>>, CacheError> {
        self.store
            .lock()
            .map_err(|e| CacheError::Operation(e.to_string()))
    }
}

fn holds(store: &mut SizedCache<String, CacheEntry>, key: &str, expected: &[u8]) -> bool {
    store
        .cache_get(key)
        .is_some_and(|entry| !entry.is_expired() && entry.value == expected)
}

#[async_trait]
impl AppCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut store = self.lock()?;
        let expired = match store.cache_get(key) {
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            store.cache_remove(key);
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl_seconds: Option<u64>,
    ) -> Result<(), CacheError> {
        let ttl = ttl_seconds.unwrap_or(self.default_ttl);
        let mut store = self.lock()?;
        store.cache_set(key.to_string(), CacheEntry::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl_seconds: Option<u64>,
    ) -> Result<bool, CacheError> {
        let ttl = ttl_seconds.unwrap_or(self.default_ttl);
        let mut store = self.lock()?;
        if store.cache_get(key).is_some_and(|entry| !entry.is_expired()) {
            return Ok(false);
        }
        store.cache_set(key.to_string(), CacheEntry::new(value, ttl));
        Ok(true)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
        ttl_seconds: Option<u64>,
    ) -> Result<bool, CacheError> {
        let ttl = ttl_seconds.unwrap_or(self.default_ttl);
        let mut store = self.lock()?;
        if !holds(&mut store, key, expected) {
            return Ok(false);
        }
        store.cache_set(key.to_string(), CacheEntry::new(value, ttl));
        Ok(true)
    }

    async fn compare_and_remove(&self, key: &str, expected: &[u8]) -> Result<bool, CacheError> {
        let mut store = self.lock()?;
        if !holds(&mut store, key, expected) {
            return Ok(false);
        }
        store.cache_remove(key);
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let mut store = self.lock()?;
        store.cache_remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut store = self.lock()?;
        store.cache_clear();
        Ok(())
    }
}
