//! Cache-backed implementation of the core [`PermissionStore`] seam.
//!
//! Layout mirrors the relational layer's export: the slug set at
//! `permissions:user:{id}` and the role list at `roles:user:{id}`, both with
//! the same TTL so they expire together.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use callsheet_core::error::Result;
use callsheet_core::rbac::{PermissionSet, PermissionStore};

use crate::{get_json, keys, set_json, Cache};

pub struct CachePermissionStore {
    cache: Arc<dyn Cache>,
}

impl CachePermissionStore {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl PermissionStore for CachePermissionStore {
    async fn get(&self, user_id: &str) -> Result<Option<PermissionSet>> {
        get_json(self.cache.as_ref(), &keys::user_permissions(user_id)).await
    }

    async fn put(&self, user_id: &str, set: &PermissionSet, ttl_secs: u64) -> Result<()> {
        let ttl = Some(Duration::from_secs(ttl_secs));
        set_json(self.cache.as_ref(), &keys::user_permissions(user_id), set, ttl).await?;
        set_json(self.cache.as_ref(), &keys::user_roles(user_id), &set.roles, ttl).await
    }

    async fn invalidate(&self, user_id: &str) -> Result<()> {
        self.cache.delete(&keys::user_permissions(user_id)).await?;
        self.cache.delete(&keys::user_roles(user_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryCache;
    use callsheet_core::principal::Role;

    #[tokio::test]
    async fn put_get_invalidate_cycle() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let store = CachePermissionStore::new(Arc::clone(&cache));

        assert!(store.get("u1").await.unwrap().is_none());

        let set = PermissionSet::from_role(Role::Director);
        store.put("u1", &set, 900).await.unwrap();

        let cached = store.get("u1").await.unwrap().unwrap();
        assert_eq!(cached.slugs, set.slugs);

        // roles list is written alongside
        let roles: Option<Vec<String>> =
            get_json(cache.as_ref(), &keys::user_roles("u1")).await.unwrap();
        assert_eq!(roles.unwrap(), vec!["director"]);

        store.invalidate("u1").await.unwrap();
        assert!(store.get("u1").await.unwrap().is_none());
    }
}
