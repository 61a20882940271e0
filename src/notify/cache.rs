//! Key/value cache capability used by the coordinator.

use std::fmt;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

/// A thread-safe string-keyed cache.
///
/// `get` may promote the entry in the eviction order; `peek` and `has` must
/// not.
pub trait CacheStore<V>: Send + Sync {
    /// Returns the value for `key`, promoting it.
    fn get(&self, key: &str) -> Option<V>;

    /// Returns the value for `key` without promoting it.
    fn peek(&self, key: &str) -> Option<V>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: String, value: V);

    /// Removes and returns the value for `key`.
    fn remove(&self, key: &str) -> Option<V>;

    /// Whether `key` is present.
    fn has(&self, key: &str) -> bool;

    /// Stores `value` only if `key` is absent and returns whichever value is
    /// stored afterwards.
    ///
    /// The default is a peek followed by a set. Implementations with their
    /// own lock should override it to make the pair atomic.
    fn set_if_absent(&self, key: String, value: V) -> V
    where
        V: Clone,
    {
        if let Some(existing) = self.peek(&key) {
            return existing;
        }
        self.set(key, value.clone());
        value
    }
}

/// Least-recently-used cache behind a mutex.
pub struct LruCacheStore<V> {
    inner: Mutex<LruCache<String, V>>,
}

impl<V> LruCacheStore<V> {
    /// Cache holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Cache that never evicts.
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            inner: Mutex::new(LruCache::unbounded()),
        }
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl<V> fmt::Debug for LruCacheStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LruCacheStore")
            .field("len", &inner.len())
            .field("cap", &inner.cap())
            .finish()
    }
}

impl<V: Clone + Send> CacheStore<V> for LruCacheStore<V> {
    fn get(&self, key: &str) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    fn peek(&self, key: &str) -> Option<V> {
        self.inner.lock().peek(key).cloned()
    }

    fn set(&self, key: String, value: V) {
        self.inner.lock().put(key, value);
    }

    fn remove(&self, key: &str) -> Option<V> {
        self.inner.lock().pop(key)
    }

    fn has(&self, key: &str) -> bool {
        self.inner.lock().contains(key)
    }

    fn set_if_absent(&self, key: String, value: V) -> V {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.peek(&key) {
            return existing.clone();
        }
        inner.put(key, value.clone());
        value
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn store(capacity: usize) -> LruCacheStore<u32> {
        let Some(capacity) = NonZeroUsize::new(capacity) else {
            panic!("capacity must be non-zero");
        };
        LruCacheStore::new(capacity)
    }

    #[test]
    fn get_promotes_peek_does_not() {
        let cache = store(2);
        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);

        assert_eq!(cache.peek("a"), Some(1));
        cache.set("c".to_string(), 3);
        assert!(!cache.has("a"), "peek must not save a from eviction");

        assert_eq!(cache.get("b"), Some(2));
        cache.set("d".to_string(), 4);
        assert!(cache.has("b"), "get promotes b over c");
        assert!(!cache.has("c"));
    }

    #[test]
    fn set_if_absent_keeps_existing() {
        let cache = store(4);
        assert_eq!(cache.set_if_absent("k".to_string(), 1), 1);
        assert_eq!(cache.set_if_absent("k".to_string(), 2), 1);
        assert_eq!(cache.peek("k"), Some(1));
    }

    #[test]
    fn remove_returns_value() {
        let cache: LruCacheStore<u32> = LruCacheStore::unbounded();
        cache.set("k".to_string(), 5);
        assert_eq!(cache.remove("k"), Some(5));
        assert_eq!(cache.remove("k"), None);
        assert!(cache.is_empty());
    }
}
