//! Striped in-memory caches for sessions and statuses.
//!
//! Each cache is partitioned by a key hash into independently locked
//! buckets so the websocket hot path never contends on a single lock.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

/// A TTL'd map striped into `max(cpus - 1, 1)` buckets.
pub struct StripedCache<V: Clone> {
    name: &'static str,
    stripes: Vec<Mutex<HashMap<String, Entry<V>>>>,
    default_ttl: Option<Duration>,
}

impl<V: Clone> StripedCache<V> {
    pub fn new(name: &'static str, default_ttl: Option<Duration>) -> Self {
        let n = std::thread::available_parallelism()
            .map(|p| p.get().saturating_sub(1))
            .unwrap_or(1)
            .max(1);
        Self::with_stripes(name, n, default_ttl)
    }

    pub fn with_stripes(
        name: &'static str,
        stripes: usize,
        default_ttl: Option<Duration>,
    ) -> Self {
        StripedCache {
            name,
            stripes: (0..stripes.max(1))
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            default_ttl,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn stripe(&self, key: &str) -> &Mutex<HashMap<String, Entry<V>>> {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        &self.stripes[(h.finish() as usize) % self.stripes.len()]
    }

    /// Insert with the cache's default TTL.
    pub fn set(&self, key: &str, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    pub fn set_with_ttl(&self, key: &str, value: V, ttl: Option<Duration>) {
        let entry = Entry {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        self.stripe(key).lock().insert(key.to_string(), entry);
    }

    /// Lazy-expiring get: an expired entry is removed on access.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut map = self.stripe(key).lock();
        match map.get(key) {
            Some(e) if e.expires_at.is_none_or(|at| Instant::now() < at) => {
                Some(e.value.clone())
            }
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    /// Removing an absent key is a no-op; invalidation races are
    /// best-effort.
    pub fn remove(&self, key: &str) {
        self.stripe(key).lock().remove(key);
    }

    pub fn clear(&self) {
        for stripe in &self.stripes {
            stripe.lock().clear();
        }
    }

    pub fn len(&self) -> usize {
        self.stripes.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every live key. Used by status scans; holds one stripe lock
    /// at a time.
    pub fn scan<F: FnMut(&str, &V)>(&self, mut f: F) {
        let now = Instant::now();
        for stripe in &self.stripes {
            let map = stripe.lock();
            for (k, e) in map.iter() {
                if e.expires_at.is_none_or(|at| now < at) {
                    f(k, &e.value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove() {
        let c: StripedCache<String> = StripedCache::with_stripes("test", 4, None);
        c.set("k1", "v1".to_string());
        assert_eq!(c.get("k1"), Some("v1".to_string()));
        assert_eq!(c.get("missing"), None);

        c.remove("k1");
        assert_eq!(c.get("k1"), None);
        // Double-clear is a no-op.
        c.remove("k1");
    }

    #[test]
    fn ttl_expiry() {
        let c: StripedCache<u32> =
            StripedCache::with_stripes("test", 2, Some(Duration::from_millis(10)));
        c.set("k", 7);
        assert_eq!(c.get("k"), Some(7));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(c.get("k"), None);
        assert!(c.is_empty());
    }

    #[test]
    fn per_entry_ttl_overrides_default() {
        let c: StripedCache<u32> =
            StripedCache::with_stripes("test", 2, Some(Duration::from_millis(5)));
        c.set_with_ttl("k", 1, None);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(c.get("k"), Some(1));
    }

    #[test]
    fn clear_and_scan() {
        let c: StripedCache<u32> = StripedCache::with_stripes("test", 8, None);
        for i in 0..100 {
            c.set(&format!("k{i}"), i);
        }
        assert_eq!(c.len(), 100);

        let mut sum = 0;
        c.scan(|_, v| sum += v);
        assert_eq!(sum, (0..100).sum::<u32>());

        c.clear();
        assert!(c.is_empty());
        // Idempotent.
        c.clear();
        assert!(c.is_empty());
    }
}
