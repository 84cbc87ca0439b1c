//! In-process cache store
//!
//! Single mutex around a `HashMap`; expiry is checked lazily on read and
//! swept by `purge_expired`. Multi-key writes are atomic because they are
//! applied under one lock acquisition.

use super::{CacheEntry, CacheError, CacheStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, StoredValue>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|v| !v.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredValue>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A TTL past what `Instant` can represent means no expiry
    fn stored(value: &str, ttl: Option<Duration>, now: Instant) -> StoredValue {
        StoredValue {
            value: value.to_string(),
            expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(stored) if stored.is_expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let now = Instant::now();
        self.lock().insert(key.to_string(), Self::stored(value, ttl, now));
        Ok(())
    }

    async fn set_many(&self, entries: Vec<CacheEntry>) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut map = self.lock();
        for entry in entries {
            let stored = Self::stored(&entry.value, entry.ttl, now);
            map.insert(entry.key, stored);
        }
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        let now = Instant::now();
        let mut map = self.lock();

        let (current, expires_at) = match map.get(key) {
            Some(stored) if !stored.is_expired(now) => {
                let current: i64 = stored
                    .value
                    .trim()
                    .parse()
                    .map_err(|_| CacheError::NotAnInteger(key.to_string()))?;
                (current, stored.expires_at)
            }
            _ => (0, None),
        };

        let next = current.saturating_add(delta);
        map.insert(
            key.to_string(),
            StoredValue {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = Instant::now();
        let mut map = self.lock();
        let before = map.len();
        map.retain(|_, stored| !stored.is_expired(now));
        Ok(before - map.len())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_del() {
        let store = MemoryCacheStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", "v1", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v1".to_string()));

        store.set("k", "v2", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v2".to_string()));

        store.del("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expiry() {
        let store = MemoryCacheStore::new();
        store.set("short", "1", Some(Duration::from_millis(30))).await.unwrap();
        store.set("long", "2", Some(Duration::from_secs(60))).await.unwrap();
        store.set("forever", "3", None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(store.get("short").await.unwrap(), None);
        assert_eq!(store.get("long").await.unwrap(), Some("2".to_string()));
        assert_eq!(store.get("forever").await.unwrap(), Some("3".to_string()));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryCacheStore::new();
        store.set("a", "1", Some(Duration::from_millis(10))).await.unwrap();
        store.set("b", "1", Some(Duration::from_millis(10))).await.unwrap();
        store.set("c", "1", None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.purge_expired().await.unwrap(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_set_many_applies_every_entry() {
        let store = MemoryCacheStore::new();
        store
            .set_many(vec![
                CacheEntry::new("x", "1", None),
                CacheEntry::new("y", "2", Some(Duration::from_secs(5))),
            ])
            .await
            .unwrap();

        assert_eq!(store.get("x").await.unwrap(), Some("1".to_string()));
        assert_eq!(store.get("y").await.unwrap(), Some("2".to_string()));
    }

    #[tokio::test]
    async fn test_incr() {
        let store = MemoryCacheStore::new();
        assert_eq!(store.incr("n", 3).await.unwrap(), 3);
        assert_eq!(store.incr("n", -1).await.unwrap(), 2);
        assert_eq!(store.get("n").await.unwrap(), Some("2".to_string()));

        store.set("text", "abc", None).await.unwrap();
        assert!(matches!(
            store.incr("text", 1).await,
            Err(CacheError::NotAnInteger(_))
        ));
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_never_expires() {
        let store = MemoryCacheStore::new();
        store.set("forever", "1", Some(Duration::MAX)).await.unwrap();
        store
            .set_many(vec![CacheEntry::new("also", "2", Some(Duration::from_secs(u64::MAX)))])
            .await
            .unwrap();

        assert_eq!(store.purge_expired().await.unwrap(), 0);
        assert_eq!(store.get("forever").await.unwrap(), Some("1".to_string()));
        assert_eq!(store.get("also").await.unwrap(), Some("2".to_string()));
    }
}
