//! TTL-based deduplication cache for inbound frame ids.
//!
//! Eviction is lazy (expired entries are dropped when looked up) plus a
//! sweep that runs after any mutation once the cache reaches 90% of its
//! soft cap. A disabled cache behaves as if nothing was ever seen.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const MIN_TTL: Duration = Duration::from_secs(1);
const SWEEP_THRESHOLD: f64 = 0.9;

/// Keyed TTL set with lazy eviction and a soft cap.
#[derive(Debug)]
pub struct DedupCache {
    enabled: bool,
    ttl: Duration,
    max_size: usize,
    entries: Mutex<HashMap<String, Instant>>,
}

impl DedupCache {
    /// Create an enabled cache. `ttl` is clamped to at least one second and
    /// `max_size` to at least 1.
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            enabled: true,
            ttl: ttl.max(MIN_TTL),
            max_size: max_size.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// A no-op cache: `has` is always false, `add` always true.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ttl: MIN_TTL,
            max_size: 1,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Membership test; evicts the entry if it expired.
    pub fn has(&self, key: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let mut entries = self.lock();
        match entries.get(key) {
            Some(inserted_at) if inserted_at.elapsed() <= self.ttl => true,
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }

    /// Record a key. Returns false if it was already present (and fresh).
    pub fn add(&self, key: &str) -> bool {
        if !self.enabled {
            return true;
        }
        if self.has(key) {
            return false;
        }
        let mut entries = self.lock();
        entries.insert(key.to_string(), Instant::now());
        self.maybe_sweep(&mut entries);
        true
    }

    pub fn delete(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    fn maybe_sweep(&self, entries: &mut HashMap<String, Instant>) {
        if entries.len() as f64 >= SWEEP_THRESHOLD * self.max_size as f64 {
            let before = entries.len();
            entries.retain(|_, inserted_at| inserted_at.elapsed() <= self.ttl);
            tracing::debug!(
                evicted = before - entries.len(),
                remaining = entries.len(),
                "dedup cache sweep"
            );
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_has() {
        let cache = DedupCache::new(Duration::from_secs(60), 100);
        assert!(cache.add("frame-1"));
        assert!(cache.has("frame-1"));
        assert!(!cache.add("frame-1"), "second add reports duplicate");
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn delete_and_clear() {
        let cache = DedupCache::new(Duration::from_secs(60), 100);
        cache.add("a");
        cache.add("b");
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        cache.clear();
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn disabled_cache_is_a_no_op() {
        let cache = DedupCache::disabled();
        assert!(cache.add("x"));
        assert!(cache.add("x"), "disabled cache never reports duplicates");
        assert!(!cache.has("x"));
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn ttl_clamped_to_minimum() {
        let cache = DedupCache::new(Duration::from_millis(10), 100);
        cache.add("k");
        // Entry is still fresh because the effective TTL is 1s, not 10ms.
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.has("k"));
    }

    #[test]
    fn sweep_drops_expired_at_capacity() {
        let cache = DedupCache::new(Duration::from_secs(1), 10);
        for i in 0..8 {
            cache.add(&format!("k{i}"));
        }
        // Force the inserted_at timestamps into the past.
        {
            let mut entries = cache.entries.lock().unwrap();
            let expired = Instant::now() - Duration::from_secs(2);
            for ts in entries.values_mut() {
                *ts = expired;
            }
        }
        // The 9th insert crosses 90% of cap and sweeps the stale entries.
        cache.add("fresh");
        assert_eq!(cache.size(), 1);
        assert!(cache.has("fresh"));
    }

    #[test]
    fn expired_key_evicted_on_lookup() {
        let cache = DedupCache::new(Duration::from_secs(1), 100);
        cache.add("old");
        {
            let mut entries = cache.entries.lock().unwrap();
            *entries.get_mut("old").unwrap() = Instant::now() - Duration::from_secs(2);
        }
        assert!(!cache.has("old"));
        assert_eq!(cache.size(), 0, "lazy eviction removed the entry");
        assert!(cache.add("old"), "key is addable again after expiry");
    }
}
