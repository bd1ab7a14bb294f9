use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheError, CacheManager};

const LEADER_KEY: &str = "leader";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lease {
    node_id: String,
    acquired: DateTime<Utc>,
}

/// Lease based leader election over the cluster cache
///
/// The lease TTL outlives one scheduling tick, so a live leader renews it
/// every tick and a dead one is replaced within two ticks. Renewal and
/// resignation only touch the lease while it still holds the bytes this node
/// read, so a lease taken over in between is left alone. With the cache
/// disabled every node considers itself leader.
pub struct LeaderElection {
    node_id: String,
    cache: CacheManager,
    ttl_seconds: u64,
    leader: AtomicBool,
}

impl LeaderElection {
    pub fn new(node_id: impl Into<String>, cache: CacheManager, ttl_seconds: u64) -> Self {
        Self {
            node_id: node_id.into(),
            cache,
            ttl_seconds: ttl_seconds.max(1),
            leader: AtomicBool::new(false),
        }
    }

    /// Result of the last acquisition attempt
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    /// Take the lease when it is free, or extend it when this node holds it
    ///
    /// Cache errors count as not leading.
    pub async fn try_acquire_or_renew(&self) -> bool {
        let leading = match self.current_lease().await {
            Ok(Some((lease, raw))) if lease.node_id == self.node_id => self.renew(raw).await,
            Ok(Some(_)) => false,
            Ok(None) => self.acquire().await,
            Err(e) => {
                tracing::warn!(node_id = %self.node_id, error = %e, "Could not read leader lease");
                false
            }
        };

        let was_leading = self.leader.swap(leading, Ordering::SeqCst);
        if leading != was_leading {
            if leading {
                tracing::info!(node_id = %self.node_id, "Became leader");
            } else {
                tracing::info!(node_id = %self.node_id, "Lost leadership");
            }
        }
        leading
    }

    /// The stored lease together with its raw bytes
    async fn current_lease(&self) -> Result<Option<(Lease, Vec<u8>)>, CacheError> {
        let Some(raw) = self.cache.get(LEADER_KEY).await? else {
            return Ok(None);
        };
        let lease =
            serde_json::from_slice(&raw).map_err(|e| CacheError::Serialization(e.to_string()))?;
        Ok(Some((lease, raw)))
    }

    async fn acquire(&self) -> bool {
        let lease = Lease {
            node_id: self.node_id.clone(),
            acquired: Utc::now(),
        };
        match self
            .cache
            .set_json_if_absent(LEADER_KEY, &lease, Some(self.ttl_seconds))
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                tracing::warn!(node_id = %self.node_id, error = %e, "Could not acquire leader lease");
                false
            }
        }
    }

    async fn renew(&self, raw: Vec<u8>) -> bool {
        match self
            .cache
            .compare_and_set(LEADER_KEY, &raw, raw.clone(), Some(self.ttl_seconds))
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                tracing::info!(node_id = %self.node_id, "Leader lease changed hands before renewal");
                false
            }
            Err(e) => {
                tracing::warn!(node_id = %self.node_id, error = %e, "Could not renew leader lease");
                false
            }
        }
    }

    /// Give the lease up so another node can take over without waiting for
    /// the TTL
    pub async fn resign(&self) {
        if !self.leader.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Ok(Some((lease, raw))) = self.current_lease().await
            && lease.node_id == self.node_id
            && let Err(e) = self.cache.compare_and_remove(LEADER_KEY, &raw).await
        {
            tracing::warn!(node_id = %self.node_id, error = %e, "Could not release leader lease");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{AppCache, CacheConfig, MemoryCache, MemoryCacheConfig, NoOpCache};
    use std::sync::Arc;
    use std::time::Duration;

    fn shared_cache() -> CacheManager {
        let backend: Arc<dyn AppCache> = Arc::new(MemoryCache::new(&MemoryCacheConfig {
            max_size: 16,
            ttl_seconds: 60,
        }));
        CacheManager::from_backend(backend, CacheConfig::default())
    }

    #[tokio::test]
    async fn test_only_one_leader() {
        let cache = shared_cache();
        let a = LeaderElection::new("a", cache.clone(), 30);
        let b = LeaderElection::new("b", cache, 30);

        assert!(a.try_acquire_or_renew().await);
        assert!(!b.try_acquire_or_renew().await);
        assert!(a.try_acquire_or_renew().await);
        assert!(a.is_leader());
        assert!(!b.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_renewal() {
        let cache = shared_cache();
        let a = LeaderElection::new("a", cache.clone(), 30);
        let b = LeaderElection::new("b", cache, 30);

        assert!(a.try_acquire_or_renew().await);
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(!b.try_acquire_or_renew().await);
        assert!(a.try_acquire_or_renew().await);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(b.try_acquire_or_renew().await);
        assert!(!a.try_acquire_or_renew().await);
    }

    #[tokio::test]
    async fn test_resign_hands_over() {
        let cache = shared_cache();
        let a = LeaderElection::new("a", cache.clone(), 30);
        let b = LeaderElection::new("b", cache, 30);

        a.try_acquire_or_renew().await;
        a.resign().await;
        assert!(!a.is_leader());
        assert!(b.try_acquire_or_renew().await);
    }

    #[tokio::test]
    async fn test_renew_fails_once_lease_changed_hands() {
        let cache = shared_cache();
        let a = LeaderElection::new("a", cache.clone(), 30);
        assert!(a.try_acquire_or_renew().await);

        let (_, raw) = a.current_lease().await.unwrap().unwrap();
        let stolen = Lease {
            node_id: "b".to_string(),
            acquired: Utc::now(),
        };
        cache.set_json(LEADER_KEY, &stolen, Some(30)).await.unwrap();

        assert!(!a.renew(raw).await);
        let (lease, _) = a.current_lease().await.unwrap().unwrap();
        assert_eq!(lease.node_id, "b");

        a.resign().await;
        let (lease, _) = a.current_lease().await.unwrap().unwrap();
        assert_eq!(lease.node_id, "b");
    }

    #[tokio::test]
    async fn test_standalone_node_always_leads() {
        let cache = CacheManager::from_backend(Arc::new(NoOpCache::new()), CacheConfig::default());
        let a = LeaderElection::new("a", cache.clone(), 30);
        let b = LeaderElection::new("b", cache, 30);
        assert!(a.try_acquire_or_renew().await);
        assert!(b.try_acquire_or_renew().await);
    }
}
