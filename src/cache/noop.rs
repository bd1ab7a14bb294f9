//! Backend for a disabled cache.
//!
//! Nothing is stored and every insert-if-absent wins, so a node without a
//! cluster cache admits runs through its local registry only and always
//! holds the leader lease.

use async_trait::async_trait;

use crate::cache::{AppCache, CacheError};

#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpCache;

impl NoOpCache {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AppCache for NoOpCache {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Option<u64>) -> Result<(), CacheError> {
        Ok(())
    }

    async fn set_if_absent(
        &self,
        _key: &str,
        _value: Vec<u8>,
        _ttl: Option<u64>,
    ) -> Result<bool, CacheError> {
        Ok(true)
    }

    async fn compare_and_set(
        &self,
        _key: &str,
        _expected: &[u8],
        _value: Vec<u8>,
        _ttl: Option<u64>,
    ) -> Result<bool, CacheError> {
        Ok(true)
    }

    async fn compare_and_remove(&self, _key: &str, _expected: &[u8]) -> Result<bool, CacheError> {
        Ok(true)
    }

    async fn remove(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
