//! Redis implementation of the [`Cache`] trait.
//!
//! Built on `redis::aio::ConnectionManager`, which multiplexes one
//! connection and reconnects transparently. Every operation runs under the
//! 500ms cache-op budget; overruns surface as `Timeout` so callers can apply
//! their own retry policy.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use tracing::{debug, error};

use callsheet_core::config::timeouts;
use callsheet_core::error::{Error, Result};
use callsheet_core::metrics::Metrics;

use crate::Cache;

/// Atomic compare-and-delete used for lock release.
const DELETE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

fn map_redis_error(err: RedisError) -> Error {
    if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
        Error::connection(format!("redis: {err}"))
    } else {
        Error::internal(format!("redis: {err}"))
    }
}

/// Production cache client.
#[derive(Clone)]
pub struct RedisCache {
    connection: ConnectionManager,
    metrics: Option<Arc<Metrics>>,
}

impl RedisCache {
    /// Connect to Redis.
    ///
    /// # Errors
    /// Returns `Connection` if the URL is malformed or the server is
    /// unreachable.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            error!("invalid redis url: {e}");
            Error::connection(format!("redis client: {e}"))
        })?;
        let connection = ConnectionManager::new(client).await.map_err(|e| {
            error!("failed to connect to redis: {e}");
            Error::connection(format!("redis connect: {e}"))
        })?;
        debug!("redis connection established");
        Ok(Self {
            connection,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, RedisError>>,
    {
        let started = std::time::Instant::now();
        let result = match tokio::time::timeout(timeouts::CACHE_OP, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(map_redis_error(err)),
            Err(_) => Err(Error::timeout(op, timeouts::CACHE_OP.as_millis() as u64)),
        };
        if let Some(metrics) = &self.metrics {
            metrics.observe_duration("cache_latency_ms", started.elapsed());
        }
        result
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection.clone();
        self.bounded("cache get", async move { conn.get(key).await }).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection.clone();
        let value = value.to_vec();
        match ttl {
            Some(ttl) => {
                let ms = ttl.as_millis().max(1) as u64;
                self.bounded("cache set", async move {
                    redis::cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("PX")
                        .arg(ms)
                        .query_async(&mut conn)
                        .await
                })
                .await
            }
            None => self.bounded("cache set", async move { conn.set(key, value).await }).await,
        }
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let value = value.to_vec();
        let ms = ttl.as_millis().max(1) as u64;
        let reply: Option<String> = self.bounded("cache set_nx", async move {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ms)
                .query_async(&mut conn)
                .await
        })
        .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let removed: u64 = self.bounded("cache delete", async move { conn.del(key).await }).await?;
        Ok(removed > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut conn = self.connection.clone();
        let expected = expected.to_vec();
        let removed: u64 = self.bounded("cache delete_if_equals", async move {
            Script::new(DELETE_IF_EQUALS)
                .key(key)
                .arg(expected)
                .invoke_async(&mut conn)
                .await
        })
        .await?;
        Ok(removed > 0)
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<()> {
        let mut conn = self.connection.clone();
        let value = value.to_vec();
        self.bounded("cache hset", async move {
            conn.hset::<_, _, _, ()>(key, field, value).await
        })
        .await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection.clone();
        self.bounded("cache hget", async move { conn.hget(key, field).await }).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        let mut conn = self.connection.clone();
        self.bounded("cache hgetall", async move { conn.hgetall(key).await }).await
    }

    async fn lpush_capped(&self, key: &str, value: &[u8], cap: usize) -> Result<()> {
        let mut conn = self.connection.clone();
        let value = value.to_vec();
        let stop = cap.saturating_sub(1) as isize;
        self.bounded("cache lpush_capped", async move {
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.lpush(key, value).ignore();
            pipe.ltrim(key, 0, stop).ignore();
            pipe.query_async::<()>(&mut conn).await
        })
        .await
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Vec<u8>>> {
        let mut conn = self.connection.clone();
        self.bounded("cache lrange", async move { conn.lrange(key, start, stop).await }).await
    }

    async fn zadd(&self, key: &str, member: &[u8], score: f64) -> Result<()> {
        let mut conn = self.connection.clone();
        let member = member.to_vec();
        self.bounded("cache zadd", async move {
            conn.zadd::<_, _, _, ()>(key, member, score).await
        })
        .await
    }

    async fn zpopmin(&self, key: &str) -> Result<Option<(Vec<u8>, f64)>> {
        let mut conn = self.connection.clone();
        let popped: Vec<(Vec<u8>, f64)> =
            self.bounded("cache zpopmin", async move { conn.zpopmin(key, 1).await }).await?;
        Ok(popped.into_iter().next())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.connection.clone();
        self.bounded("cache zcard", async move { conn.zcard(key).await }).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let secs = ttl.as_secs().max(1) as i64;
        self.bounded("cache expire", async move {
            conn.expire::<_, ()>(key, secs).await
        })
        .await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.connection.clone();
        self.bounded("cache keys", async move { conn.keys(pattern).await }).await
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let reply: String = self.bounded("cache ping", async move {
            redis::cmd("PING").query_async(&mut conn).await
        })
        .await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(Error::connection(format!("unexpected PING reply: {reply}")))
        }
    }
}
