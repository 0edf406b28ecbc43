use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use cartwheel_core::config::CacheConfig;

#[derive(Clone, Debug)]
struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

/// TTL + capacity bounded read cache.
///
/// Capacity eviction removes the entry with the *earliest* expiry (not the
/// least recently used one): entries about to lapse are the cheapest to lose.
/// Expired entries are deleted lazily on read.
#[derive(Debug)]
pub struct TtlCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    capacity: usize,
}

impl TtlCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self { entries: Mutex::new(HashMap::new()), ttl, capacity }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(Duration::from_secs(config.ttl_secs), config.capacity)
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut entries = self.entries.lock().expect("cache lock poisoned");

        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            let soonest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(key, _)| key.clone());
            if let Some(victim) = soonest {
                entries.remove(&victim);
            }
        }

        entries.insert(key, CacheEntry { value, expires_at: Instant::now() + self.ttl });
    }

    /// Returns the value if present and unexpired. A read at or past the
    /// expiry instant is a miss and deletes the entry.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn clear(&self) {
        self.entries.lock().expect("cache lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::TtlCache;

    #[tokio::test(start_paused = true)]
    async fn value_is_served_until_the_ttl_boundary() {
        let cache = TtlCache::new(Duration::from_secs(60), 8);
        cache.insert("search:camera", json!({"products": []}));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.get("search:camera"), Some(json!({"products": []})));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("search:camera"), None, "read at expiry must miss");
        assert!(cache.is_empty(), "expired entry is deleted lazily on read");
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_eviction_removes_the_nearest_expiry_only() {
        let cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.insert("a", json!(1));
        tokio::time::advance(Duration::from_secs(10)).await;
        cache.insert("b", json!(2));
        cache.insert("c", json!(3));

        assert_eq!(cache.get("a"), None, "entry with nearest expiry is evicted");
        assert_eq!(cache.get("b"), Some(json!(2)));
        assert_eq!(cache.get("c"), Some(json!(3)));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reinserting_an_existing_key_does_not_evict_neighbors() {
        let cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.insert("a", json!(1));
        cache.insert("b", json!(2));
        cache.insert("a", json!(10));

        assert_eq!(cache.get("a"), Some(json!(10)));
        assert_eq!(cache.get("b"), Some(json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_empties_the_cache() {
        let cache = TtlCache::new(Duration::from_secs(60), 4);
        cache.insert("a", json!(1));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get("a"), None);
    }
}
