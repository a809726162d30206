use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

struct MemoEntry<V> {
    value: Arc<V>,
    version: u64,
    cached_at: Instant,
}

/// Keyed memo for derived results.
///
/// An entry is served only while it is within TTL and was computed against
/// the current source version.
pub struct AggregateMemo<K, V> {
    entries: DashMap<K, MemoEntry<V>>,
    ttl: Duration,
}

impl<K, V> AggregateMemo<K, V>
where
    K: Eq + Hash,
    V: PartialEq,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Returns the cached value only when fresh and computed at `version`.
    pub fn get(&self, key: &K, version: u64) -> Option<Arc<V>> {
        let entry = self.entries.get(key)?;
        if entry.version == version && entry.cached_at.elapsed() <= self.ttl {
            Some(Arc::clone(&entry.value))
        } else {
            None
        }
    }

    /// Store a freshly computed value.
    ///
    /// If it equals what is already cached, the existing `Arc` is kept and
    /// returned so callers can detect "no change" by pointer identity.
    /// Entries past their TTL are purged first.
    pub fn store(&self, key: K, version: u64, value: V) -> Arc<V> {
        self.purge_expired();
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if *entry.value != value {
                    entry.value = Arc::new(value);
                }
                entry.version = version;
                entry.cached_at = Instant::now();
                Arc::clone(&entry.value)
            }
            Entry::Vacant(vacant) => {
                let value = Arc::new(value);
                vacant.insert(MemoEntry {
                    value: Arc::clone(&value),
                    version,
                    cached_at: Instant::now(),
                });
                value
            }
        }
    }

    fn purge_expired(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.cached_at.elapsed() <= ttl);
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
