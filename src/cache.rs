//! Time-bounded key/value caches
//!
//! The dispatcher keeps two of these: one marking delivered broker
//! sequences (dedup) and one tracking retry state per durable. Only the
//! contract matters — get/set-with-ttl/delete — so the implementation is a
//! plain map with lazy expiry plus an opportunistic sweep.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sweep expired entries once the map grows past this many items.
const SWEEP_THRESHOLD: usize = 1024;

struct Entry<V> {
    value: V,
    deadline: Option<Instant>,
}

/// A mutex-guarded map whose entries expire after a per-entry TTL
pub struct TtlCache<K, V> {
    default_ttl: Option<Duration>,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    /// Create a cache with a default TTL applied by [`TtlCache::set`]
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl: Some(default_ttl),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Create a cache whose entries never expire unless given an explicit TTL
    pub fn unbounded() -> Self {
        Self {
            default_ttl: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch a live value, dropping it if expired
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if !expired(entry) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a value under the default TTL
    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Store a value under an explicit TTL (`None` pins it)
    pub fn set_with_ttl(&self, key: K, value: V, ttl: Option<Duration>) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= SWEEP_THRESHOLD {
            entries.retain(|_, entry| !expired(entry));
        }
        entries.insert(
            key,
            Entry {
                value,
                deadline: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    pub fn delete(&self, key: &K) {
        self.entries.lock().unwrap().remove(key);
    }

    /// Drop everything, expired or not
    pub fn flush(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, entry| !expired(entry));
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn expired<V>(entry: &Entry<V>) -> bool {
    entry
        .deadline
        .is_some_and(|deadline| Instant::now() >= deadline)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete() {
        let cache: TtlCache<String, u64> = TtlCache::new(Duration::from_secs(60));
        cache.set("a".into(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));

        cache.delete(&"a".to_string());
        assert_eq!(cache.get(&"a".to_string()), None);
    }

    #[test]
    fn entries_expire() {
        let cache: TtlCache<&str, ()> = TtlCache::new(Duration::from_millis(10));
        cache.set("k", ());
        assert!(cache.get(&"k").is_some());

        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get(&"k").is_none());
    }

    #[test]
    fn explicit_ttl_overrides_default() {
        let cache: TtlCache<&str, ()> = TtlCache::new(Duration::from_millis(10));
        cache.set_with_ttl("pinned", (), None);

        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get(&"pinned").is_some());
    }

    #[test]
    fn flush_clears_all() {
        let cache: TtlCache<u32, u32> = TtlCache::unbounded();
        cache.set(1, 1);
        cache.set(2, 2);
        assert_eq!(cache.len(), 2);

        cache.flush();
        assert!(cache.is_empty());
    }
}
