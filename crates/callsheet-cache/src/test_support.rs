//! In-memory [`Cache`] double for unit tests across the workspace.
//!
//! Semantics match the Redis implementation closely enough for the
//! invariants tested against it: TTL expiry, NX sets, compare-and-delete,
//! capped lists, and sorted-set pop ordering.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use callsheet_core::error::Result;

use crate::Cache;

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, Entry>,
    hashes: HashMap<String, HashMap<String, Vec<u8>>>,
    lists: HashMap<String, Vec<Vec<u8>>>,
    zsets: HashMap<String, Vec<(Vec<u8>, f64)>>,
}

/// Thread-safe in-memory cache.
#[derive(Default)]
pub struct MemoryCache {
    inner: Mutex<Inner>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        match inner.strings.get(key) {
            Some(entry) if entry.live() => Ok(Some(entry.value.clone())),
            Some(_) => {
                inner.strings.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.inner.lock().strings.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock();
        let occupied = inner.strings.get(key).map_or(false, Entry::live);
        if occupied {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        let existed = inner.strings.remove(key).is_some()
            | inner.hashes.remove(key).is_some()
            | inner.lists.remove(key).is_some()
            | inner.zsets.remove(key).is_some();
        Ok(existed)
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut inner = self.inner.lock();
        let matches = inner
            .strings
            .get(key)
            .map_or(false, |e| e.live() && e.value == expected);
        if matches {
            inner.strings.remove(key);
        }
        Ok(matches)
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<()> {
        self.inner
            .lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_vec());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .inner
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        Ok(self.inner.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn lpush_capped(&self, key: &str, value: &[u8], cap: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        let list = inner.lists.entry(key.to_string()).or_default();
        list.insert(0, value.to_vec());
        list.truncate(cap);
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Vec<u8>>> {
        let inner = self.inner.lock();
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as isize;
        let clamp = |i: isize| -> usize {
            let i = if i < 0 { len + i } else { i };
            i.clamp(0, len) as usize
        };
        let (start, stop) = (clamp(start), clamp(stop));
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(list[start..=stop.min(list.len().saturating_sub(1))].to_vec())
    }

    async fn zadd(&self, key: &str, member: &[u8], score: f64) -> Result<()> {
        let mut inner = self.inner.lock();
        let zset = inner.zsets.entry(key.to_string()).or_default();
        zset.retain(|(m, _)| m != member);
        zset.push((member.to_vec(), score));
        zset.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(())
    }

    async fn zpopmin(&self, key: &str) -> Result<Option<(Vec<u8>, f64)>> {
        let mut inner = self.inner.lock();
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(None);
        };
        if zset.is_empty() {
            return Ok(None);
        }
        Ok(Some(zset.remove(0)))
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        Ok(self.inner.lock().zsets.get(key).map_or(0, |z| z.len() as u64))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        if let Some(entry) = self.inner.lock().strings.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        // glob support limited to a trailing '*', which is all the admin
        // paths use
        let inner = self.inner.lock();
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        let matches = |k: &String| {
            if pattern.ends_with('*') {
                k.starts_with(prefix)
            } else {
                k == pattern
            }
        };
        let mut out: Vec<String> = inner
            .strings
            .keys()
            .chain(inner.hashes.keys())
            .chain(inner.lists.keys())
            .chain(inner.zsets.keys())
            .filter(|k| matches(k))
            .cloned()
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
