//! SQLite-backed cache store
//!
//! Stores every key in one `cache_entries` table with an absolute
//! `expires_at` (unix millis, NULL = no expiry). Expired rows are invisible
//! to reads immediately and physically removed by `purge_expired`.
//!
//! `set_many` and `incr` run inside a transaction, so a batch refresh is
//! either fully visible or not at all.

use super::{CacheEntry, CacheError, CacheStore};
use crate::sqlite_pragma::apply_optimized_pragmas;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct SqliteCacheStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCacheStore {
    /// Open (or create) a cache database file
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CacheError::Unavailable(format!(
                        "Failed to create cache directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        apply_optimized_pragmas(&conn)?;
        Self::from_connection(conn)
    }

    /// Private in-memory database (tests, single-process deployments)
    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, CacheError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_cache_expires_at ON cache_entries(expires_at)",
            [],
        )?;

        log::info!("✅ SQLite cache store initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, CacheError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, CacheError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| CacheError::Unavailable("cache connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| CacheError::Unavailable(format!("cache task failed: {}", e)))?
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn expires_at(now: i64, ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)))
}

fn upsert(conn: &Connection, key: &str, value: &str, expires_at: Option<i64>) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO cache_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            expires_at = excluded.expires_at",
        params![key, value, expires_at],
    )?;
    Ok(())
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM cache_entries
                     WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                    params![key, now_millis()],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(move |conn| {
            upsert(conn, &key, &value, expires_at(now_millis(), ttl))?;
            Ok(())
        })
        .await
    }

    async fn set_many(&self, entries: Vec<CacheEntry>) -> Result<(), CacheError> {
        self.with_conn(move |conn| {
            let now = now_millis();
            let tx = conn.transaction()?;
            for entry in &entries {
                upsert(&tx, &entry.key, &entry.value, expires_at(now, entry.ttl))?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let now = now_millis();
            let tx = conn.transaction()?;

            let existing: Option<(String, Option<i64>)> = tx
                .query_row(
                    "SELECT value, expires_at FROM cache_entries
                     WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                    params![key, now],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let (current, expiry) = match existing {
                Some((value, expiry)) => {
                    let current: i64 = value
                        .trim()
                        .parse()
                        .map_err(|_| CacheError::NotAnInteger(key.clone()))?;
                    (current, expiry)
                }
                None => (0, None),
            };

            let next = current.saturating_add(delta);
            upsert(&tx, &key, &next.to_string(), expiry)?;
            tx.commit()?;
            Ok(next)
        })
        .await
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now_millis()],
            )?;
            Ok(removed)
        })
        .await
    }

    fn backend_type(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_round_trip_and_overwrite() {
        let store = SqliteCacheStore::open_in_memory().unwrap();

        store.set("visits:totals", "{\"week\":1}", None).await.unwrap();
        store.set("visits:totals", "{\"week\":2}", None).await.unwrap();

        assert_eq!(
            store.get("visits:totals").await.unwrap(),
            Some("{\"week\":2}".to_string())
        );
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expiry_hides_and_purges() {
        let store = SqliteCacheStore::open_in_memory().unwrap();
        store.set("short", "1", Some(Duration::from_millis(20))).await.unwrap();
        store.set("keep", "1", None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(store.get("short").await.unwrap(), None);
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.get("keep").await.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_set_many_is_visible_together() {
        let temp_file = NamedTempFile::new().unwrap();
        let store = SqliteCacheStore::open(temp_file.path()).unwrap();

        let entries = (0..20)
            .map(|i| CacheEntry::new(format!("k{}", i), i.to_string(), Some(Duration::from_secs(60))))
            .collect();
        store.set_many(entries).await.unwrap();

        for i in 0..20 {
            assert_eq!(store.get(&format!("k{}", i)).await.unwrap(), Some(i.to_string()));
        }
    }

    #[tokio::test]
    async fn test_set_many_rolls_back_on_failure() {
        let store = SqliteCacheStore::open_in_memory().unwrap();
        store.set("visits:totals", "old", None).await.unwrap();
        store
            .conn
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_poison BEFORE INSERT ON cache_entries
                 WHEN NEW.key = 'poison'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();

        let result = store
            .set_many(vec![
                CacheEntry::new("visits:totals", "new", None),
                CacheEntry::new("visits:daily", "[]", None),
                CacheEntry::new("poison", "x", None),
                CacheEntry::new("loans:totals", "{}", None),
            ])
            .await;
        assert!(result.is_err());

        assert_eq!(store.get("visits:totals").await.unwrap(), Some("old".to_string()));
        assert_eq!(store.get("visits:daily").await.unwrap(), None);
        assert_eq!(store.get("loans:totals").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_never_expires() {
        let store = SqliteCacheStore::open_in_memory().unwrap();
        store.set("forever", "1", Some(Duration::MAX)).await.unwrap();

        assert_eq!(store.purge_expired().await.unwrap(), 0);
        assert_eq!(store.get("forever").await.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_incr_preserves_expiry_and_rejects_text() {
        let store = SqliteCacheStore::open_in_memory().unwrap();

        assert_eq!(store.incr("delta", 2).await.unwrap(), 2);
        assert_eq!(store.incr("delta", 5).await.unwrap(), 7);

        store.set("ttl_counter", "10", Some(Duration::from_millis(30))).await.unwrap();
        assert_eq!(store.incr("ttl_counter", 1).await.unwrap(), 11);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("ttl_counter").await.unwrap(), None);

        store.set("text", "abc", None).await.unwrap();
        assert!(matches!(store.incr("text", 1).await, Err(CacheError::NotAnInteger(_))));
    }

    #[tokio::test]
    async fn test_reopen_keeps_entries() {
        let temp_file = NamedTempFile::new().unwrap();
        {
            let store = SqliteCacheStore::open(temp_file.path()).unwrap();
            store.set("live:visits:today", "42", None).await.unwrap();
        }
        let store = SqliteCacheStore::open(temp_file.path()).unwrap();
        assert_eq!(store.get("live:visits:today").await.unwrap(), Some("42".to_string()));
    }
}
