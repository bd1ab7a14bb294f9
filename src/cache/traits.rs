//! Backend interface of the cluster cache.

use async_trait::async_trait;

use crate::cache::CacheError;

/// Byte-oriented key/value store shared by the nodes of a cluster
///
/// `ttl_seconds` of `None` applies the backend's default TTL; `Some(0)` keeps
/// the entry until it is removed.
#[async_trait]
pub trait AppCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl_seconds: Option<u64>,
    ) -> Result<(), CacheError>;

    /// Store the value only if no live entry exists for the key, returning
    /// `true` when this call created it. Must be atomic across every node
    /// using the same backend.
    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl_seconds: Option<u64>,
    ) -> Result<bool, CacheError>;

    /// Overwrite the entry only while it still holds exactly `expected`,
    /// returning `true` when it was replaced. Atomic like `set_if_absent`.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
        ttl_seconds: Option<u64>,
    ) -> Result<bool, CacheError>;

    /// Remove the entry only while it still holds exactly `expected`
    async fn compare_and_remove(&self, key: &str, expected: &[u8]) -> Result<bool, CacheError>;

    async fn remove(&self, key: &str) -> Result<(), CacheError>;

    /// Drop every entry of this cache
    async fn clear(&self) -> Result<(), CacheError>;
}
