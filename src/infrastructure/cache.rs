use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// In-memory key-value cache with per-entry TTL.
///
/// Serves as the shared metrics surface: the metrics collector publishes raw
/// gauge values into it, the auto-scaler reads them back with defaults on
/// miss, and evaluation snapshots are written back under a short TTL.
#[derive(Debug)]
pub struct Cache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    data: Arc<RwLock<HashMap<K, CacheEntry<V>>>>,
    default_ttl: Duration,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    last_accessed: Instant,
}

impl<K, V> Cache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    #[must_use]
    pub fn new(default_ttl: Duration, max_size: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            default_ttl,
            max_size,
        }
    }

    pub async fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl).await;
    }

    pub async fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let mut data = self.data.write().await;

        if data.len() >= self.max_size && !data.contains_key(&key) {
            Self::evict_lru(&mut data);
        }

        let now = Instant::now();
        data.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + ttl,
                last_accessed: now,
            },
        );
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let mut data = self.data.write().await;

        if let Some(entry) = data.get_mut(key) {
            if Instant::now() > entry.expires_at {
                data.remove(key);
                return None;
            }
            entry.last_accessed = Instant::now();
            Some(entry.value.clone())
        } else {
            None
        }
    }

    pub async fn remove(&self, key: &K) -> Option<V> {
        let mut data = self.data.write().await;
        data.remove(key).map(|entry| entry.value)
    }

    pub async fn clear(&self) {
        self.data.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }

    /// Drop expired entries; periodic callers keep the map bounded over time.
    pub async fn cleanup_expired(&self) {
        let mut data = self.data.write().await;
        let now = Instant::now();
        data.retain(|_, entry| now <= entry.expires_at);
    }

    fn evict_lru(data: &mut HashMap<K, CacheEntry<V>>) {
        if let Some(lru_key) = data
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(k, _)| k.clone())
        {
            data.remove(&lru_key);
        }
    }
}

/// Raw gauge values published by the metrics collector
pub type MetricsCache = Cache<String, f64>;

/// Serialized evaluation snapshots written back by the auto-scaler
pub type SnapshotCache = Cache<String, String>;

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn insert_and_get() {
        let cache: Cache<String, f64> = Cache::new(Duration::from_secs(60), 100);
        cache.insert("metrics:t1:queue_depth".to_string(), 15.0).await;
        assert_eq!(cache.get(&"metrics:t1:queue_depth".to_string()).await, Some(15.0));
        assert_eq!(cache.get(&"metrics:t1:missing".to_string()).await, None);
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache: Cache<String, f64> = Cache::new(Duration::from_millis(20), 100);
        cache.insert("k".to_string(), 1.0).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get(&"k".to_string()).await, None);
    }

    #[tokio::test]
    async fn lru_eviction_at_capacity() {
        let cache: Cache<String, f64> = Cache::new(Duration::from_secs(60), 2);
        cache.insert("a".to_string(), 1.0).await;
        cache.insert("b".to_string(), 2.0).await;
        // Touch "a" so "b" becomes the least recently used entry.
        let _ = cache.get(&"a".to_string()).await;
        cache.insert("c".to_string(), 3.0).await;
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.get(&"b".to_string()).await, None);
        assert_eq!(cache.get(&"a".to_string()).await, Some(1.0));
    }
}
