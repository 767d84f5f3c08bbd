//! Bounded, aged LRU cache.
//!
//! Fronts allocation handle lookups. Entries expire after a TTL and the
//! least recently used entry is evicted once the size bound is exceeded.
//! Writers that remove the backing record must call [`AgedLruCache::invalidate`];
//! everything else may be served up to one TTL stale.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct CacheInner<K, V> {
    entries: HashMap<K, (V, Instant)>,
    /// Least recently used at the front.
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V> CacheInner<K, V> {
    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.clone());
    }

    fn forget(&mut self, key: &K) {
        self.entries.remove(key);
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
    }
}

/// Size and age bounded cache with explicit invalidation.
pub struct AgedLruCache<K, V> {
    inner: Mutex<CacheInner<K, V>>,
    ttl: Duration,
    max_entries: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> AgedLruCache<K, V> {
    /// Create a cache holding at most `max_entries` for at most `ttl` each.
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Fresh cached value for `key`, if any.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let fresh = match inner.entries.get(key) {
            Some((value, stamp)) if stamp.elapsed() <= self.ttl => Some(value.clone()),
            Some(_) => None,
            None => return None,
        };
        match fresh {
            Some(value) => {
                inner.touch(key);
                Some(value)
            }
            None => {
                inner.forget(key);
                None
            }
        }
    }

    /// Insert or refresh an entry, evicting the least recently used ones
    /// beyond the size bound.
    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        inner.touch(&key);
        inner.entries.insert(key, (value, Instant::now()));
        while inner.entries.len() > self.max_entries {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }

    /// Drop one entry.
    pub fn invalidate(&self, key: &K) {
        self.inner.lock().forget(key);
    }

    /// Number of entries, stale ones included.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_refreshes() {
        let cache = AgedLruCache::new(Duration::from_secs(60), 4);
        assert_eq!(cache.get(&"a"), None);
        cache.insert("a", 7);
        cache.insert("a", 8);
        assert_eq!(cache.get(&"a"), Some(8));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = AgedLruCache::new(Duration::from_secs(60), 2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));
        cache.insert("c", 3);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn test_expiry() {
        let cache = AgedLruCache::new(Duration::from_millis(10), 4);
        cache.insert("a", 1);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get(&"a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate() {
        let cache = AgedLruCache::new(Duration::from_secs(60), 4);
        cache.insert("a", 1);
        cache.invalidate(&"a");
        assert_eq!(cache.get(&"a"), None);
        assert!(cache.is_empty());
    }
}
