use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Small in-memory memoizer with a per-entry deadline. Process-local
/// and lost on restart, which is fine: everything cached here is
/// recomputable (at the cost of an external API call).
pub struct TtlCache<K, V> {
    map: DashMap<K, (V, Instant)>,
    ttl: Duration,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            map: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let hit = self.map.get(key)?;
        let (value, deadline) = hit.value();
        if Instant::now() < *deadline {
            Some(value.clone())
        } else {
            drop(hit);
            self.map.remove(key);
            None
        }
    }

    pub fn insert(&self, key: K, value: V) {
        self.map.insert(key, (value, Instant::now() + self.ttl));
    }

    /// Drops dead entries; called from the hourly maintenance job so
    /// expired verdicts don't accumulate between lookups.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.map.retain(|_, (_, deadline)| now < *deadline);
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
