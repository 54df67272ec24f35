//! Bounded, expiring cache of encoded renditions.
//!
//! Entries are raw encoded bytes keyed by request fingerprint. Capacity is
//! count-based: 75 000 entries at typical 50-200 KB renditions puts the
//! ceiling at roughly 4-15 GB of resident data, which is the provisioned
//! budget for this service. TODO: move to a bytes-bounded policy once the
//! cache-size gauge has a byte-based counterpart dashboards can alert on.
//!
//! Expiry is lazy: an entry past its TTL is dropped when a read finds it.
//! Capacity eviction is eager: inserting into a full cache first drops every
//! expired entry, then the least recently used one.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A cached rendition.
#[derive(Debug, Clone)]
struct CacheEntry {
    data: Arc<Vec<u8>>,
    inserted_at: Instant,
    last_accessed: Instant,
}

/// Thread-safe LRU cache with per-entry TTL.
pub struct RenditionCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    capacity: usize,
    ttl: Duration,
}

impl RenditionCache {
    /// Creates a cache bounded to `capacity` entries, each servable for `ttl`
    /// after insertion.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
            ttl,
        }
    }

    /// Returns the cached rendition for a fingerprint, if present and fresh.
    ///
    /// Updates the access time on hit. An expired entry is removed and
    /// reported as a miss.
    pub fn get(&self, fingerprint: &str) -> Option<Arc<Vec<u8>>> {
        let mut entries = self.entries.lock().unwrap();

        match entries.get_mut(fingerprint) {
            Some(entry) if entry.inserted_at.elapsed() >= self.ttl => {
                entries.remove(fingerprint);
                None
            }
            Some(entry) => {
                entry.last_accessed = Instant::now();
                Some(Arc::clone(&entry.data))
            }
            None => None,
        }
    }

    /// Inserts a rendition, evicting if the cache is at capacity.
    ///
    /// The TTL clock starts now even when replacing an existing entry.
    pub fn add(&self, fingerprint: &str, data: Arc<Vec<u8>>) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();

        if !entries.contains_key(fingerprint) && entries.len() >= self.capacity {
            Self::evict(&mut entries, self.ttl);
        }

        entries.insert(
            fingerprint.to_string(),
            CacheEntry {
                data,
                inserted_at: now,
                last_accessed: now,
            },
        );
    }

    /// Current entry count, reported by the cache-size gauge.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops expired entries, then the least recently used entry if the map
    /// is still at capacity.
    fn evict(entries: &mut HashMap<String, CacheEntry>, ttl: Duration) {
        let before = entries.len();
        entries.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
        if entries.len() < before {
            return;
        }

        let oldest = entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread::sleep;

    fn bytes(data: &[u8]) -> Arc<Vec<u8>> {
        Arc::new(data.to_vec())
    }

    #[test]
    fn test_get_returns_inserted_entry() {
        let cache = RenditionCache::new(10, Duration::from_secs(60));
        cache.add("a-100x100.jpg", bytes(b"rendition"));

        let hit = cache.get("a-100x100.jpg").unwrap();
        assert_eq!(*hit, b"rendition");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_get_missing_is_none() {
        let cache = RenditionCache::new(10, Duration::from_secs(60));
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn test_expired_entry_not_returned() {
        let cache = RenditionCache::new(10, Duration::from_millis(20));
        cache.add("a", bytes(b"old"));

        sleep(Duration::from_millis(30));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.len(), 0, "expired entry is removed on read");
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let cache = RenditionCache::new(3, Duration::from_secs(60));
        for i in 0..10 {
            cache.add(&format!("key-{i}"), bytes(b"data"));
            assert!(cache.len() <= 3);
        }
    }

    #[test]
    fn test_lru_entry_evicted_first() {
        let cache = RenditionCache::new(2, Duration::from_secs(60));
        cache.add("first", bytes(b"1"));
        sleep(Duration::from_millis(5));
        cache.add("second", bytes(b"2"));

        // Touch "first" so "second" becomes the LRU entry.
        sleep(Duration::from_millis(5));
        cache.get("first");

        sleep(Duration::from_millis(5));
        cache.add("third", bytes(b"3"));

        assert!(cache.get("first").is_some());
        assert!(cache.get("second").is_none());
        assert!(cache.get("third").is_some());
    }

    #[test]
    fn test_expired_entries_evicted_before_lru() {
        let cache = RenditionCache::new(2, Duration::from_millis(30));
        cache.add("stale", bytes(b"1"));
        sleep(Duration::from_millis(40));

        // "stale" is past TTL; inserting at capacity should drop it and
        // keep the fresh entry.
        cache.add("fresh", bytes(b"2"));
        cache.add("newest", bytes(b"3"));

        assert!(cache.get("stale").is_none());
        assert!(cache.get("fresh").is_some());
        assert!(cache.get("newest").is_some());
    }

    #[test]
    fn test_replace_resets_ttl() {
        let cache = RenditionCache::new(10, Duration::from_millis(50));
        cache.add("a", bytes(b"old"));
        sleep(Duration::from_millis(30));
        cache.add("a", bytes(b"new"));
        sleep(Duration::from_millis(30));

        // 60ms after the first insert but only 30ms after the replace.
        let hit = cache.get("a").unwrap();
        assert_eq!(*hit, b"new");
    }

    #[test]
    fn test_replace_does_not_grow() {
        let cache = RenditionCache::new(10, Duration::from_secs(60));
        cache.add("a", bytes(b"one"));
        cache.add("a", bytes(b"two"));
        assert_eq!(cache.len(), 1);
    }
}
