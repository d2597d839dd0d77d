//! Named distributed locks over the cache.
//!
//! `SET NX PX` acquire with a random token, compare-and-delete release so a
//! lock that expired and was re-acquired by another holder is never deleted
//! by the original owner. Backs the at-most-one-consolidation-per-user rule.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use callsheet_core::error::Result;

use crate::{keys, Cache};

/// A held lock. Release explicitly with [`CacheLock::release`]; an
/// unreleased lock falls back to TTL expiry.
pub struct CacheLock {
    cache: Arc<dyn Cache>,
    key: String,
    token: String,
}

impl CacheLock {
    /// Try to acquire `name`. Returns `None` when another holder owns it.
    pub async fn acquire(cache: Arc<dyn Cache>, name: &str, ttl: Duration) -> Result<Option<Self>> {
        let key = keys::lock(name);
        let token = Uuid::new_v4().to_string();
        let acquired = cache.set_nx(&key, token.as_bytes(), ttl).await?;
        if !acquired {
            return Ok(None);
        }
        Ok(Some(Self { cache, key, token }))
    }

    /// Release the lock if we still hold it. Returns whether the release
    /// actually removed our token.
    pub async fn release(self) -> Result<bool> {
        let released = self
            .cache
            .delete_if_equals(&self.key, self.token.as_bytes())
            .await?;
        if !released {
            warn!(key = %self.key, "lock expired before release; skipping delete");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryCache;

    fn cache() -> Arc<dyn Cache> {
        Arc::new(MemoryCache::new())
    }

    #[tokio::test]
    async fn second_acquire_fails_while_held() {
        let cache = cache();
        let lock = CacheLock::acquire(Arc::clone(&cache), "consolidate:u1", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(lock.is_some());

        let second = CacheLock::acquire(Arc::clone(&cache), "consolidate:u1", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(second.is_none());

        assert!(lock.unwrap().release().await.unwrap());
        let third = CacheLock::acquire(cache, "consolidate:u1", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn release_after_takeover_does_not_steal() {
        let cache = cache();
        let lock = CacheLock::acquire(Arc::clone(&cache), "consolidate:u2", Duration::from_millis(5))
            .await
            .unwrap()
            .unwrap();

        // let the TTL lapse and have another holder take the lock
        tokio::time::sleep(Duration::from_millis(20)).await;
        let takeover = CacheLock::acquire(Arc::clone(&cache), "consolidate:u2", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        // the stale holder's release must not remove the new token
        assert!(!lock.release().await.unwrap());
        assert!(takeover.release().await.unwrap());
    }

    #[tokio::test]
    async fn locks_are_namespaced_by_name() {
        let cache = cache();
        let a = CacheLock::acquire(Arc::clone(&cache), "consolidate:u1", Duration::from_secs(30))
            .await
            .unwrap();
        let b = CacheLock::acquire(cache, "consolidate:u2", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(a.is_some());
        assert!(b.is_some());
    }
}
