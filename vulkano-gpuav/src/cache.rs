use foldhash::HashMap;
use parking_lot::RwLock;
use std::{
    collections::hash_map::Entry,
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

/// A map of values that are computed at most once per key, and are immutable afterwards.
///
/// The cache only stores weak references. An entry whose value has been dropped everywhere
/// else acts as if it were vacant, and is removed the next time a value has to be computed.
/// A failed computation leaves the entry vacant, so that the same key can be retried later.
#[derive(Debug)]
pub(crate) struct WeakArcOnceCache<K, V> {
    inner: RwLock<HashMap<K, Weak<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> Default for WeakArcOnceCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> WeakArcOnceCache<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the number of entries whose value is still alive.
    pub(crate) fn len(&self) -> usize {
        self.inner
            .read()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Returns the number of entries that are stored, including dead ones.
    #[cfg(test)]
    pub(crate) fn stored_len(&self) -> usize {
        self.inner.read().len()
    }

    /// Returns how many lookups were answered from the cache, and how many had to compute a
    /// value.
    pub(crate) fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl<K, V> WeakArcOnceCache<K, V>
where
    K: Eq + Hash,
{
    /// Returns the value for the specified `key`, if it exists.
    pub(crate) fn get(&self, key: &K) -> Option<Arc<V>> {
        self.inner.read().get(key).and_then(Weak::upgrade)
    }

    /// Returns the value for `key`, computing it with `f` if the entry is vacant. If `f` returns
    /// [`Err`], the error is propagated and the entry stays vacant.
    ///
    /// Dead entries are removed whenever a value is computed, so the map never holds more
    /// entries than there are live values plus the ones dropped since the last miss.
    pub(crate) fn get_or_try_insert<E>(
        &self,
        key: K,
        f: impl FnOnce(&K) -> Result<Arc<V>, E>,
    ) -> Result<Arc<V>, E> {
        if let Some(arc) = self.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(arc);
        }

        let mut inner = self.inner.write();
        inner.retain(|_, weak| weak.strong_count() > 0);

        match inner.entry(key) {
            Entry::Occupied(mut entry) => {
                if let Some(arc) = Weak::upgrade(entry.get()) {
                    // Someone else inserted a value between the read and the write lock.
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Ok(arc)
                } else {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    let arc = f(entry.key())?;
                    entry.insert(Arc::downgrade(&arc));
                    Ok(arc)
                }
            }
            Entry::Vacant(entry) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let arc = f(entry.key())?;
                entry.insert(Arc::downgrade(&arc));
                Ok(arc)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::WeakArcOnceCache;
    use std::sync::Arc;

    #[test]
    fn computes_once() {
        let cache: WeakArcOnceCache<u32, u32> = WeakArcOnceCache::new();
        let mut calls = 0;
        let mut values = Vec::new();

        for _ in 0..3 {
            let value = cache
                .get_or_try_insert(7, |&key| {
                    calls += 1;
                    Ok::<_, ()>(Arc::new(key * 2))
                })
                .unwrap();
            assert_eq!(*value, 14);
            values.push(value);
        }

        assert_eq!(calls, 1);
        assert!(Arc::ptr_eq(&values[0], &values[2]));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats(), (2, 1));
    }

    #[test]
    fn failure_leaves_entry_vacant() {
        let cache: WeakArcOnceCache<u32, u32> = WeakArcOnceCache::new();

        assert!(cache.get_or_try_insert(1, |_| Err("nope")).is_err());
        assert!(cache.get(&1).is_none());

        let value = cache.get_or_try_insert(1, |_| Ok::<_, ()>(Arc::new(5))).unwrap();
        assert_eq!(*value, 5);
    }

    #[test]
    fn dropped_values_are_evicted() {
        let cache: WeakArcOnceCache<u32, u32> = WeakArcOnceCache::new();
        let kept = cache.get_or_try_insert(0, |_| Ok::<_, ()>(Arc::new(0))).unwrap();

        for key in 1..1000 {
            let value = cache
                .get_or_try_insert(key, |&key| Ok::<_, ()>(Arc::new(key)))
                .unwrap();
            drop(value);
            assert!(cache.stored_len() <= 2);
        }

        assert_eq!(cache.len(), 1);
        assert!(cache.get(&999).is_none());

        // A dropped entry is computed again.
        let mut calls = 0;
        let again = cache
            .get_or_try_insert(5, |&key| {
                calls += 1;
                Ok::<_, ()>(Arc::new(key))
            })
            .unwrap();
        assert_eq!((*again, calls), (5, 1));
        assert!(Arc::ptr_eq(&kept, &cache.get(&0).unwrap()));
    }
}
