//! Ephemeral memory-context cache (`memory_context:{thread_id}`).
//!
//! Caches the memories recalled for a conversation so consecutive turns in
//! the same thread skip the vector search. Short TTL; always safe to lose.

use std::sync::Arc;
use std::time::Duration;

use callsheet_cache::{get_json, keys, set_json, Cache};
use callsheet_core::error::Result;

use crate::manager::MemoryRecall;

const CONTEXT_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Clone)]
pub struct MemoryContextCache {
    cache: Arc<dyn Cache>,
}

impl MemoryContextCache {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    pub async fn get(&self, thread_id: &str) -> Result<Option<Vec<MemoryRecall>>> {
        get_json(self.cache.as_ref(), &keys::memory_context(thread_id)).await
    }

    pub async fn put(&self, thread_id: &str, recalls: &[MemoryRecall]) -> Result<()> {
        set_json(
            self.cache.as_ref(),
            &keys::memory_context(thread_id),
            &recalls,
            Some(CONTEXT_TTL),
        )
        .await
    }

    /// Drop the cached context, e.g. after new memories were extracted for
    /// the owning user.
    pub async fn invalidate(&self, thread_id: &str) -> Result<()> {
        self.cache.delete(&keys::memory_context(thread_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callsheet_cache::test_support::MemoryCache;

    #[tokio::test]
    async fn round_trip_and_invalidate() {
        let cache = MemoryContextCache::new(Arc::new(MemoryCache::new()));
        assert!(cache.get("c1").await.unwrap().is_none());

        let recalls = vec![MemoryRecall {
            id: "m1".to_string(),
            memory_type: crate::MemoryType::Semantic,
            summary: "budget rule for sci-fi".to_string(),
            content: "Only greenlights sci-fi on 2M+ budgets".to_string(),
            score: 0.9,
            importance: 0.8,
        }];
        cache.put("c1", &recalls).await.unwrap();
        assert_eq!(cache.get("c1").await.unwrap().unwrap(), recalls);

        cache.invalidate("c1").await.unwrap();
        assert!(cache.get("c1").await.unwrap().is_none());
    }
}
