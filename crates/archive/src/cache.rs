//! Expiring, capacity-bounded memory cache.
//!
//! Holds recently used daily tables that are not hot, and derived lookup
//! structures such as channel-number lists keyed by their identity.
//!
//! Values are stored as `Arc<V>` and [`MemoryCache::get`] hands out clones
//! of the `Arc`, so evicting or expiring an entry never invalidates a value
//! a caller is still using.

use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default number of cached entries.
pub const DEFAULT_CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(100) {
    Some(capacity) => capacity,
    None => unreachable!(),
};

/// Default idle time after which an entry expires.
pub const DEFAULT_CACHE_EXPIRATION: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
struct CacheItem<V> {
    value: Arc<V>,
    accessed: Instant,
}

/// Thread-safe LRU cache with access-based expiration.
#[derive(Debug)]
pub struct MemoryCache<K: Hash + Eq, V> {
    inner: Mutex<LruCache<K, CacheItem<V>>>,
    expiration: Duration,
}

impl<K: Hash + Eq, V> Default for MemoryCache<K, V> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_EXPIRATION)
    }
}

impl<K: Hash + Eq, V> MemoryCache<K, V> {
    /// Creates a cache.
    pub fn new(capacity: NonZeroUsize, expiration: Duration) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            expiration,
        }
    }

    /// Returns the value for the key and refreshes its access time.
    ///
    /// An expired entry is removed and reported as missing.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let now = Instant::now();
        let mut cache = self.inner.lock();

        match cache.get_mut(key) {
            Some(item) if now.duration_since(item.accessed) <= self.expiration => {
                item.accessed = now;
                return Some(Arc::clone(&item.value));
            }
            Some(_) => {}
            None => return None,
        }

        cache.pop(key);
        None
    }

    /// Adds a value, replacing any previous one, and returns it.
    pub fn add(&self, key: K, value: V) -> Arc<V> {
        let value = Arc::new(value);
        self.add_shared(key, Arc::clone(&value));
        value
    }

    /// Adds an already shared value.
    pub fn add_shared(&self, key: K, value: Arc<V>) {
        let now = Instant::now();
        let mut cache = self.inner.lock();
        Self::sweep(&mut cache, now, self.expiration);
        cache.put(
            key,
            CacheItem {
                value,
                accessed: now,
            },
        );
    }

    /// Returns the cached value or inserts the one produced by `create`.
    ///
    /// `create` runs without the cache lock held. If another caller inserted
    /// the key in the meantime, its value wins.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: K,
        create: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<V>, E> {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let value = Arc::new(create()?);
        let now = Instant::now();
        let mut cache = self.inner.lock();
        if let Some(item) = cache.get_mut(&key) {
            item.accessed = now;
            return Ok(Arc::clone(&item.value));
        }
        Self::sweep(&mut cache, now, self.expiration);
        cache.put(
            key,
            CacheItem {
                value: Arc::clone(&value),
                accessed: now,
            },
        );
        Ok(value)
    }

    /// Removes an entry.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.inner.lock().pop(key).map(|item| item.value)
    }

    /// Removes every expired entry and returns how many were removed.
    pub fn remove_expired(&self) -> usize {
        let mut cache = self.inner.lock();
        Self::sweep(&mut cache, Instant::now(), self.expiration)
    }

    /// Number of entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns true if the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Removes everything.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    // Least recently used entries sit at the tail, so expired entries form a
    // contiguous run starting there.
    fn sweep(cache: &mut LruCache<K, CacheItem<V>>, now: Instant, expiration: Duration) -> usize {
        let mut removed = 0;
        while let Some((_, item)) = cache.peek_lru() {
            if now.duration_since(item.accessed) <= expiration {
                break;
            }
            cache.pop_lru();
            removed += 1;
        }
        removed
    }
}
