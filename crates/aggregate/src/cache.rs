use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

/// A small TTL cache for aggregation outputs. Disabled by default in the
/// aggregator config; entries expire lazily on access.
pub struct TtlCache<V> {
    ttl: Duration,
    entries: BTreeMap<u64, (Instant, V)>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&mut self, key: u64) -> Option<V> {
        let hit = self
            .entries
            .get(&key)
            .map(|(at, value)| (at.elapsed() < self.ttl, value.clone()));
        match hit {
            Some((true, value)) => Some(value),
            Some((false, _)) => {
                self.entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn put(&mut self, key: u64, value: V) {
        self.entries.insert(key, (Instant::now(), value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Hashes the serialized shape of an aggregation request.
pub fn cache_key(parts: &[&str]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for part in parts {
        part.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn entries_expire_after_ttl() {
        let mut cache = TtlCache::new(Duration::from_millis(10));
        let key = cache_key(&["a", "b"]);
        cache.put(key, 1);
        assert_eq!(cache.get(key), Some(1));
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cache.get(key), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn keys_depend_on_all_parts() {
        assert_ne!(cache_key(&["a", "b"]), cache_key(&["a", "c"]));
        assert_eq!(cache_key(&["a", "b"]), cache_key(&["a", "b"]));
    }
}
