//! Cache manager that dispatches to the configured backend.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::cache::memory::MemoryCache;
use crate::cache::noop::NoOpCache;
use crate::cache::redis::RedisCache;
use crate::cache::{AppCache, CacheError};
use crate::config::settings::{CacheBackend, CacheConfig};

/// Handle on the configured backend, cloned into every component that
/// shares cluster state
#[derive(Clone)]
pub struct CacheManager {
    backend: Arc<dyn AppCache>,
    config: CacheConfig,
}

impl CacheManager {
    /// Open the configured backend; a disabled cache becomes [`NoOpCache`]
    pub async fn new(config: CacheConfig, cache_name: &str) -> Result<Self, CacheError> {
        let backend: Arc<dyn AppCache> = if !config.enabled {
            Arc::new(NoOpCache::new())
        } else {
            match config.backend {
                CacheBackend::Memory => Arc::new(MemoryCache::new(&config.memory)),
                CacheBackend::Redis => Arc::new(RedisCache::new(&config.redis, cache_name).await?),
            }
        };

        Ok(Self { backend, config })
    }

    /// Wrap an existing backend, e.g. one memory cache shared by several
    /// in-process nodes.
    pub fn from_backend(backend: Arc<dyn AppCache>, config: CacheConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &Arc<dyn AppCache> {
        &self.backend
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.backend.get(key).await
    }

    pub async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl_seconds: Option<u64>,
    ) -> Result<(), CacheError> {
        self.backend.set(key, value, ttl_seconds).await
    }

    /// Set a value only if the key holds no live entry.
    pub async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl_seconds: Option<u64>,
    ) -> Result<bool, CacheError> {
        self.backend.set_if_absent(key, value, ttl_seconds).await
    }

    pub async fn compare_and_set(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
        ttl_seconds: Option<u64>,
    ) -> Result<bool, CacheError> {
        self.backend
            .compare_and_set(key, expected, value, ttl_seconds)
            .await
    }

    pub async fn compare_and_remove(&self, key: &str, expected: &[u8]) -> Result<bool, CacheError> {
        self.backend.compare_and_remove(key, expected).await
    }

    pub async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.backend.remove(key).await
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        self.backend.clear().await
    }

    /// Values shared between nodes are stored as JSON
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.get(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| CacheError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl_seconds: Option<u64>,
    ) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.set(key, bytes, ttl_seconds).await
    }

    pub async fn set_json_if_absent<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl_seconds: Option<u64>,
    ) -> Result<bool, CacheError> {
        let bytes = serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.set_if_absent(key, bytes, ttl_seconds).await
    }
}
