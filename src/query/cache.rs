use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::EntityId;

pub type KeyCache = Arc<Mutex<LruCache<String, Vec<EntityId>>>>;

/// Per-key LRU caches of committed lookups, value -> matching entities.
///
/// A key without an entry here has caching disabled; that is different from
/// an enabled cache that simply holds nothing yet.
pub struct ReadCache {
    caches: RwLock<HashMap<String, KeyCache>>,
    hit_count: AtomicUsize,
    miss_count: AtomicUsize,
}

impl ReadCache {
    pub fn new() -> Self {
        ReadCache {
            caches: RwLock::new(HashMap::new()),
            hit_count: AtomicUsize::new(0),
            miss_count: AtomicUsize::new(0),
        }
    }

    /// Enables caching for `key`, replacing whatever was cached before.
    pub fn enable(&self, key: &str, capacity: usize) -> Result<()> {
        let cap = NonZeroUsize::new(capacity)
            .ok_or_else(|| Error::new(ErrorKind::InvalidArgument, "cache capacity must be positive"))?;
        self.caches
            .write()
            .insert(key.to_string(), Arc::new(Mutex::new(LruCache::new(cap))));
        Ok(())
    }

    pub fn disable(&self, key: &str) {
        self.caches.write().remove(key);
    }

    pub fn get(&self, key: &str) -> Option<KeyCache> {
        self.caches.read().get(key).cloned()
    }

    pub fn is_enabled(&self, key: &str) -> bool {
        self.caches.read().contains_key(key)
    }

    pub fn lookup(&self, key: &str, value: &str) -> Option<Vec<EntityId>> {
        let cache = self.get(key)?;
        let mut cache = cache.lock();
        if let Some(ids) = cache.get(value) {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
            Some(ids.clone())
        } else {
            self.miss_count.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn put(&self, key: &str, value: &str, ids: Vec<EntityId>) {
        if let Some(cache) = self.get(key) {
            cache.lock().put(value.to_string(), ids);
        }
    }

    pub fn invalidate(&self, key: &str, value: &str) {
        if let Some(cache) = self.get(key) {
            cache.lock().pop(value);
        }
    }

    /// Forgets every cached value of `key`; caching stays enabled.
    pub fn invalidate_key(&self, key: &str) {
        if let Some(cache) = self.get(key) {
            cache.lock().clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let caches = self.caches.read();
        let (size, capacity) = caches.values().fold((0, 0), |(size, capacity), cache| {
            let cache = cache.lock();
            (size + cache.len(), capacity + cache.cap().get())
        });
        CacheStats {
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
            size,
            capacity,
        }
    }
}

impl Default for ReadCache {
    fn default() -> Self {
        ReadCache::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hit_count: usize,
    pub miss_count: usize,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}
