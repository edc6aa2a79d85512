// ── Mnemo Engine: Query Cache ───────────────────────────────────────────────
//
// Process-local TTL + LRU cache in front of the read paths. Keys are
// `(operation, canonical JSON args)`; values are serialized JSON so one
// cache serves heterogeneous result types.
//
// Invalidation is wholesale: any successful mutation clears everything.
// Coarse, but simple — the read:write ratio is high enough that measured
// hit rates stay high, and it removes a whole class of stale-entry bugs.
//
// Lookups never error: a deserialization mismatch behaves like a miss.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry {
    value: String,
    stored_at: Instant,
    /// Monotonic counter stamp for LRU ordering.
    used_at: u64,
}

struct Inner {
    entries: HashMap<String, Entry>,
    clock: u64,
    hits: u64,
    misses: u64,
    invalidations: u64,
}

/// TTL + LRU query result cache.
pub struct QueryCache {
    inner: Mutex<Inner>,
    ttl: Duration,
    max_entries: usize,
}

/// Counters for the telemetry report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

impl QueryCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                clock: 0,
                hits: 0,
                misses: 0,
                invalidations: 0,
            }),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Canonical cache key: operation name + JSON-serialized args.
    /// Serialization failures fall back to a never-matching key.
    pub fn key<A: Serialize>(operation: &str, args: &A) -> String {
        match serde_json::to_string(args) {
            Ok(json) => format!("{operation}:{json}"),
            Err(_) => format!("{operation}:<unserializable>"),
        }
    }

    /// Fetch a cached value. Expired entries count as misses and are removed.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let stamp = inner.clock;

        let expired = inner
            .entries
            .get(key)
            .map(|entry| entry.stored_at.elapsed() > self.ttl);
        let parsed: Option<T> = match expired {
            None => None,
            Some(true) => {
                inner.entries.remove(key);
                None
            }
            Some(false) => {
                let entry = inner.entries.get_mut(key).expect("checked above");
                entry.used_at = stamp;
                serde_json::from_str(&entry.value).ok()
            }
        };
        if parsed.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        parsed
    }

    /// Insert a value, evicting the least-recently-used entry when full.
    pub fn put<T: Serialize>(&self, key: String, value: &T) {
        let Ok(json) = serde_json::to_string(value) else {
            return;
        };
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let stamp = inner.clock;

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_entries {
            if let Some(lru_key) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.used_at)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&lru_key);
            }
        }

        inner.entries.insert(key, Entry { value: json, stored_at: Instant::now(), used_at: stamp });
    }

    /// Wholesale invalidation — called after every successful mutation.
    pub fn invalidate_all(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.invalidations += 1;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            invalidations: inner.invalidations,
        }
    }

    /// Approximate resident size in bytes (keys + serialized values).
    pub fn resident_bytes(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .map(|(k, e)| k.len() + e.value.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> QueryCache {
        QueryCache::new(Duration::from_secs(60), 3)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let c = cache();
        let key = QueryCache::key("recall", &("postgres", 10));
        c.put(key.clone(), &vec![1i64, 2, 3]);
        assert_eq!(c.get::<Vec<i64>>(&key), Some(vec![1, 2, 3]));
        assert_eq!(c.stats().hits, 1);
    }

    #[test]
    fn test_miss_on_absent_key() {
        let c = cache();
        assert_eq!(c.get::<Vec<i64>>("nope"), None);
        assert_eq!(c.stats().misses, 1);
    }

    #[test]
    fn test_ttl_expiry() {
        let c = QueryCache::new(Duration::from_millis(0), 10);
        let key = QueryCache::key("recall", &"q");
        c.put(key.clone(), &1i64);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(c.get::<i64>(&key), None);
        assert_eq!(c.stats().entries, 0);
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let c = cache();
        for i in 0..3i64 {
            c.put(format!("k{i}"), &i);
        }
        // Touch k0 so k1 becomes the LRU victim.
        assert_eq!(c.get::<i64>("k0"), Some(0));
        c.put("k3".into(), &3i64);

        assert_eq!(c.stats().entries, 3);
        assert_eq!(c.get::<i64>("k1"), None);
        assert_eq!(c.get::<i64>("k0"), Some(0));
        assert_eq!(c.get::<i64>("k3"), Some(3));
    }

    #[test]
    fn test_invalidate_all_clears() {
        let c = cache();
        c.put("a".into(), &1i64);
        c.put("b".into(), &2i64);
        c.invalidate_all();
        assert_eq!(c.stats().entries, 0);
        assert_eq!(c.stats().invalidations, 1);
        assert_eq!(c.get::<i64>("a"), None);
    }

    #[test]
    fn test_key_is_canonical() {
        assert_eq!(
            QueryCache::key("recall", &("q", 10)),
            QueryCache::key("recall", &("q", 10))
        );
        assert_ne!(
            QueryCache::key("recall", &("q", 10)),
            QueryCache::key("recall", &("q", 11))
        );
    }

    #[test]
    fn test_type_mismatch_is_a_miss() {
        let c = cache();
        c.put("k".into(), &"text");
        assert_eq!(c.get::<i64>("k"), None);
    }
}
