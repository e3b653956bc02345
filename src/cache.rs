use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use tokio::time::Instant;

/// Small TTL cache for idempotent, tightly rate-limited calls.
///
/// Expiry is checked lazily on read; nothing is evicted in the background.
#[derive(Debug)]
pub struct ResponseCache<V> {
    ttl: Duration,
    entries: Mutex<HashMap<String, (V, Instant)>>,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached value if it is younger than the ttl.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.lock();
        let (value, stored_at) = entries.get(key)?;
        if stored_at.elapsed() < self.ttl {
            #[cfg(feature = "tracing")]
            tracing::trace!(key, "response cache hit");
            return Some(value.clone());
        }
        entries.remove(key);
        None
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        self.lock().insert(key.into(), (value, Instant::now()));
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of stored entries, including ones that expired but were not read yet.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A panic while holding the lock cannot leave a map entry half-written.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, (V, Instant)>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ResponseCache;

    #[tokio::test(start_paused = true)]
    async fn returns_value_within_ttl() {
        let cache = ResponseCache::new(Duration::from_secs(30));
        cache.set("ping", 1u32);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(cache.get("ping"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn expires_at_ttl_and_evicts_lazily() {
        let cache = ResponseCache::new(Duration::from_secs(30));
        cache.set("ping", "ok".to_owned());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("ping"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn set_refreshes_insertion_time() {
        let cache = ResponseCache::new(Duration::from_secs(10));
        cache.set("k", 1);
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.set("k", 2);
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get("k"), Some(2));
    }

    #[test]
    fn keys_are_independent() {
        let cache = ResponseCache::new(Duration::from_secs(30));
        cache.set("a", 1);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));

        cache.clear();
        assert_eq!(cache.get("a"), None);
    }
}
