//! Cluster cache with runtime-selectable backends.
//!
//! The scheduler keeps every piece of cross-node state here: the leader
//! lease, the "running" registry, cancellation markers and the last completed
//! progress per job type. Supported backends:
//! - Memory cache (in-process; shared only by nodes holding the same instance)
//! - Redis cache (distributed, network-based)
//! - NoOp (cache disabled: standalone node)
//!
//! # Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! backend = "redis"  # or "memory"
//!
//! [cache.memory]
//! max_size = 1000
//! ttl_seconds = 300
//!
//! [cache.redis]
//! url = "redis://127.0.0.1:6379"
//! ttl_seconds = 300
//! pool_size = 4
//! connection_timeout = 5
//! key_prefix = "scheduler"
//! tls_enabled = false
//! ```

mod error;
mod manager;
mod memory;
mod noop;
mod redis;
mod traits;

pub use error::CacheError;
pub use manager::CacheManager;
pub use memory::MemoryCache;
pub use noop::NoOpCache;
pub use traits::AppCache;

// Re-export config types
pub use crate::config::settings::{CacheBackend, CacheConfig, MemoryCacheConfig, RedisCacheConfig};
