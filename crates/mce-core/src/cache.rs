//! Per-artifact LRU+TTL result cache (C1).
//!
//! Bounded mapping from a [`Fingerprint`](crate::fingerprint::Fingerprint) to
//! a cached evaluation result, ordered by access recency. An entry is evicted
//! either when the cache is at capacity and a new key arrives (least-recently
//! used first) or lazily, on `get`, once its age exceeds the configured TTL.
//! [`crate::janitor`] also proactively sweeps expired entries so a cold cache
//! does not accumulate garbage between calls.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::fingerprint::Fingerprint;
use crate::vm::PyValue;

struct Entry {
    value: PyValue,
    inserted_at: Instant,
}

struct Inner {
    map: LruCache<Fingerprint, Entry>,
    ttl: Duration,
}

/// A bounded, TTL-expiring cache of evaluation results for a single artifact.
///
/// Every operation takes the cache's mutex; the mutex is also exposed via
/// [`LruTtlCache::with_lock`] so the evaluator can hold it across a
/// compute-and-put sequence and avoid a thundering herd on a cache miss (see
/// [`Evaluator::eval`](crate::evaluator::Evaluator::eval)).
pub struct LruTtlCache {
    inner: Mutex<Inner>,
}

impl LruTtlCache {
    pub fn new(lru_maxsize: u32, ttl_seconds: u32) -> Self {
        let cap = NonZeroUsize::new(lru_maxsize as usize).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            inner: Mutex::new(Inner {
                map: LruCache::new(cap),
                ttl: Duration::from_secs(ttl_seconds as u64),
            }),
        }
    }

    pub fn get(&self, key: &Fingerprint) -> Option<PyValue> {
        let mut guard = self.inner.lock().expect("cache mutex poisoned");
        get_locked(&mut guard, key)
    }

    pub fn put(&self, key: Fingerprint, value: PyValue) {
        let mut guard = self.inner.lock().expect("cache mutex poisoned");
        put_locked(&mut guard, key, value);
    }

    pub fn delete(&self, key: &Fingerprint) {
        let mut guard = self.inner.lock().expect("cache mutex poisoned");
        guard.map.pop(key);
    }

    pub fn clear(&self) {
        let mut guard = self.inner.lock().expect("cache mutex poisoned");
        guard.map.clear();
    }

    pub fn keys(&self) -> Vec<Fingerprint> {
        let guard = self.inner.lock().expect("cache mutex poisoned");
        guard.map.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn size(&self) -> usize {
        let guard = self.inner.lock().expect("cache mutex poisoned");
        guard.map.len()
    }

    /// Locks the cache for the duration of the closure so a caller can
    /// re-check for a concurrent fill before computing and putting a value.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut LockedCache) -> R) -> R {
        let mut guard = self.inner.lock().expect("cache mutex poisoned");
        f(&mut LockedCache { inner: &mut guard })
    }

    /// Scans every entry and removes those whose age exceeds the TTL. Called
    /// by the janitor; never called on the request path.
    pub fn sweep(&self) -> usize {
        let mut guard = self.inner.lock().expect("cache mutex poisoned");
        let before = guard.map.len();
        let expired: Vec<Fingerprint> = guard
            .map
            .iter()
            .filter(|(_, e)| e.inserted_at.elapsed() > guard.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for k in &expired {
            guard.map.pop(k);
        }
        before - guard.map.len()
    }
}

/// A held lock on a [`LruTtlCache`]; lets the evaluator re-check a key
/// without releasing the lock between the check and the fill.
pub struct LockedCache<'a> {
    inner: &'a mut Inner,
}

impl<'a> LockedCache<'a> {
    pub fn get(&mut self, key: &Fingerprint) -> Option<PyValue> {
        get_locked(self.inner, key)
    }

    pub fn put(&mut self, key: Fingerprint, value: PyValue) {
        put_locked(self.inner, key, value);
    }
}

fn get_locked(inner: &mut Inner, key: &Fingerprint) -> Option<PyValue> {
    let expired = match inner.map.peek(key) {
        Some(e) => e.inserted_at.elapsed() > inner.ttl,
        None => return None,
    };
    if expired {
        inner.map.pop(key);
        return None;
    }
    inner.map.get(key).map(|e| e.value.clone())
}

fn put_locked(inner: &mut Inner, key: Fingerprint, value: PyValue) {
    inner.map.put(
        key,
        Entry {
            value,
            inserted_at: Instant::now(),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(n: u64) -> Fingerprint {
        Fingerprint::from_raw(n)
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let cache = LruTtlCache::new(2, 60);
        cache.put(fp(1), PyValue::Int(1));
        cache.put(fp(2), PyValue::Int(2));
        cache.put(fp(3), PyValue::Int(3));
        assert!(cache.get(&fp(1)).is_none());
        assert!(cache.get(&fp(2)).is_some());
        assert!(cache.get(&fp(3)).is_some());
    }

    #[test]
    fn ttl_expires_entries() {
        let cache = LruTtlCache::new(4, 1);
        cache.put(fp(1), PyValue::Int(10));
        assert!(cache.get(&fp(1)).is_some());
        std::thread::sleep(Duration::from_millis(1100));
        assert!(cache.get(&fp(1)).is_none());
    }

    #[test]
    fn sweep_removes_expired_without_touching_fresh() {
        let cache = LruTtlCache::new(4, 1);
        cache.put(fp(1), PyValue::Int(10));
        std::thread::sleep(Duration::from_millis(1100));
        cache.put(fp(2), PyValue::Int(20));
        let removed = cache.sweep();
        assert_eq!(removed, 1);
        assert!(cache.get(&fp(2)).is_some());
    }

    #[test]
    fn clear_empties_cache() {
        let cache = LruTtlCache::new(4, 60);
        cache.put(fp(1), PyValue::Int(1));
        cache.clear();
        assert_eq!(cache.size(), 0);
    }
}
