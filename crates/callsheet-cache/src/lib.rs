//! Key-value cache for sessions, permission sets, agent checkpoints, and
//! the background-task queue.
//!
//! The [`Cache`] trait is the seam every consumer programs against; the
//! production implementation is [`RedisCache`] and an in-memory double for
//! tests lives in [`test_support`]. Hot paths never scan: `keys` exists only
//! for administrative tooling.

pub mod keys;
pub mod lock;
pub mod metrics_sink;
pub mod permissions;
pub mod queue;
pub mod redis_cache;
pub mod test_support;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use callsheet_core::error::{Error, Result};

pub use lock::CacheLock;
pub use permissions::CachePermissionStore;
pub use queue::{BackgroundTask, TaskKind, TaskQueue};
pub use redis_cache::RedisCache;

/// Storage operations the rest of the system relies on.
///
/// Values are raw bytes; JSON conveniences are provided as free functions so
/// the trait stays object safe. Every implementation must honor the 500ms
/// per-op budget and map overruns to [`Error::Timeout`].
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Set with an optional TTL.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;
    /// Set only if the key does not exist; returns whether the set happened.
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;
    async fn delete(&self, key: &str) -> Result<bool>;
    /// Delete only when the stored value equals `expected` (atomic); backs
    /// safe lock release.
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool>;

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, Vec<u8>>>;

    /// Push to the head of a list and trim it to `cap` entries.
    async fn lpush_capped(&self, key: &str, value: &[u8], cap: usize) -> Result<()>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Vec<u8>>>;

    async fn zadd(&self, key: &str, member: &[u8], score: f64) -> Result<()>;
    /// Pop the member with the lowest score.
    async fn zpopmin(&self, key: &str) -> Result<Option<(Vec<u8>, f64)>>;
    async fn zcard(&self, key: &str) -> Result<u64>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Pattern scan. Administrative paths only; never called per request.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    async fn ping(&self) -> Result<()>;
}

/// Fetch and deserialize a JSON value.
pub async fn get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Result<Option<T>> {
    match cache.get(key).await? {
        Some(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|e| {
                Error::internal(format!("corrupt cache entry at {key}: {e}"))
            })?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Serialize and store a JSON value.
pub async fn set_json<T: Serialize>(
    cache: &dyn Cache,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| Error::internal(format!("serialize for {key}: {e}")))?;
    cache.set(key, &bytes, ttl).await
}
