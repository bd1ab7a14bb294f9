//! Redis backend behind a bb8 pool.
//!
//! Every node of a cluster points at the same Redis; `SET NX EX` gives the
//! single-winner insert the run registry and the leader lease rely on.

use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError, Script};

use crate::cache::{AppCache, CacheError};
use crate::config::settings::RedisCacheConfig;

/// Keys deleted per `DEL` while clearing
const CLEAR_BATCH: usize = 500;

/// KEYS[1] value, ARGV: expected, new value, ttl (0 keeps it forever)
const COMPARE_AND_SET: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
    return 0
end
if tonumber(ARGV[3]) > 0 then
    redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
else
    redis.call('SET', KEYS[1], ARGV[2])
end
return 1
"#;

/// KEYS[1] value, ARGV: expected
const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
    return 0
end
return redis.call('DEL', KEYS[1])
"#;

fn op_error(e: RedisError) -> CacheError {
    CacheError::Operation(e.to_string())
}

pub struct RedisCache {
    pool: Pool<Client>,
    /// `<configured prefix>:<cache name>`
    namespace: String,
    default_ttl: u64,
    compare_and_set: Script,
    compare_and_delete: Script,
}

impl RedisCache {
    pub async fn new(config: &RedisCacheConfig, cache_name: &str) -> Result<Self, CacheError> {
        let client =
            Client::open(config.url.as_str()).map_err(|e| CacheError::Connection(e.to_string()))?;

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(Duration::from_secs(config.connection_timeout))
            .build(client)
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        tracing::debug!(url = %config.url, cache_name, "Redis cache pool ready");
        Ok(Self {
            pool,
            namespace: format!("{}:{}", config.key_prefix, cache_name),
            default_ttl: config.ttl_seconds,
            compare_and_set: Script::new(COMPARE_AND_SET),
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    async fn conn(&self) -> Result<PooledConnection<'_, Client>, CacheError> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))
    }
}

#[async_trait]
impl AppCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut pooled = self.conn().await?;
        let conn: &mut MultiplexedConnection = &mut pooled;
        conn.get(self.key(key)).await.map_err(op_error)
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl_seconds: Option<u64>,
    ) -> Result<(), CacheError> {
        let ttl = ttl_seconds.unwrap_or(self.default_ttl);
        let mut pooled = self.conn().await?;
        let conn: &mut MultiplexedConnection = &mut pooled;
        if ttl == 0 {
            conn.set::<_, _, ()>(self.key(key), value).await.map_err(op_error)
        } else {
            conn.set_ex::<_, _, ()>(self.key(key), value, ttl)
                .await
                .map_err(op_error)
        }
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl_seconds: Option<u64>,
    ) -> Result<bool, CacheError> {
        let ttl = ttl_seconds.unwrap_or(self.default_ttl);
        let mut command = redis::cmd("SET");
        command.arg(self.key(key)).arg(value).arg("NX");
        if ttl > 0 {
            command.arg("EX").arg(ttl);
        }

        let mut pooled = self.conn().await?;
        let conn: &mut MultiplexedConnection = &mut pooled;
        // nil reply: the key already held a live value
        let reply: Option<String> = command.query_async(conn).await.map_err(op_error)?;
        Ok(reply.is_some())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
        ttl_seconds: Option<u64>,
    ) -> Result<bool, CacheError> {
        let ttl = ttl_seconds.unwrap_or(self.default_ttl);
        let mut pooled = self.conn().await?;
        let conn: &mut MultiplexedConnection = &mut pooled;
        let replaced: i64 = self
            .compare_and_set
            .key(self.key(key))
            .arg(expected)
            .arg(value)
            .arg(ttl)
            .invoke_async(conn)
            .await
            .map_err(op_error)?;
        Ok(replaced == 1)
    }

    async fn compare_and_remove(&self, key: &str, expected: &[u8]) -> Result<bool, CacheError> {
        let mut pooled = self.conn().await?;
        let conn: &mut MultiplexedConnection = &mut pooled;
        let removed: i64 = self
            .compare_and_delete
            .key(self.key(key))
            .arg(expected)
            .invoke_async(conn)
            .await
            .map_err(op_error)?;
        Ok(removed == 1)
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let mut pooled = self.conn().await?;
        let conn: &mut MultiplexedConnection = &mut pooled;
        conn.del::<_, ()>(self.key(key)).await.map_err(op_error)
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut pooled = self.conn().await?;
        let conn: &mut MultiplexedConnection = &mut pooled;

        let pattern = format!("{}:*", self.namespace);
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(CLEAR_BATCH)
                .query_async(&mut *conn)
                .await
                .map_err(op_error)?;
            if !keys.is_empty() {
                conn.del::<_, ()>(keys).await.map_err(op_error)?;
            }
            if next == 0 {
                return Ok(());
            }
            cursor = next;
        }
    }
}
