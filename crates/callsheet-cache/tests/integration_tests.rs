//! Integration tests against a live Redis.
//!
//! Run with `cargo test -p callsheet-cache -- --ignored` and a local Redis
//! on the default port.

use std::sync::Arc;
use std::time::Duration;

use callsheet_cache::test_support::MemoryCache;
use callsheet_cache::{keys, Cache, CacheLock, RedisCache};

async fn connect() -> RedisCache {
    RedisCache::connect("redis://localhost:6379/0")
        .await
        .expect("Redis must be running on localhost to run ignored tests")
}

#[tokio::test]
#[ignore = "requires Redis running on localhost"]
async fn string_round_trip_with_ttl() {
    let cache = connect().await;
    let key = keys::session("itest-session");
    cache.delete(&key).await.unwrap();

    cache
        .set(&key, b"payload", Some(Duration::from_secs(60)))
        .await
        .unwrap();
    assert_eq!(cache.get(&key).await.unwrap(), Some(b"payload".to_vec()));

    cache.delete(&key).await.unwrap();
    assert_eq!(cache.get(&key).await.unwrap(), None);
}

#[tokio::test]
#[ignore = "requires Redis running on localhost"]
async fn zset_pop_order_matches_memory_double() {
    let redis = connect().await;
    let memory = MemoryCache::new();
    let key = "itest:queue";
    redis.delete(key).await.unwrap();

    for (member, score) in [("c", 3.0), ("a", 1.0), ("b", 2.0)] {
        redis.zadd(key, member.as_bytes(), score).await.unwrap();
        memory.zadd(key, member.as_bytes(), score).await.unwrap();
    }

    for _ in 0..3 {
        let from_redis = redis.zpopmin(key).await.unwrap().unwrap();
        let from_memory = memory.zpopmin(key).await.unwrap().unwrap();
        assert_eq!(from_redis.0, from_memory.0);
    }
}

#[tokio::test]
#[ignore = "requires Redis running on localhost"]
async fn lock_contention_on_live_redis() {
    let cache: Arc<dyn Cache> = Arc::new(connect().await);

    let lock = CacheLock::acquire(Arc::clone(&cache), "itest-lock", Duration::from_secs(10))
        .await
        .unwrap()
        .expect("first acquire succeeds");
    assert!(
        CacheLock::acquire(Arc::clone(&cache), "itest-lock", Duration::from_secs(10))
            .await
            .unwrap()
            .is_none()
    );
    assert!(lock.release().await.unwrap());
}

#[tokio::test]
#[ignore = "requires Redis running on localhost"]
async fn ping_answers() {
    connect().await.ping().await.unwrap();
}
