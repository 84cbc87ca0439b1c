//! Cache store contract
//!
//! Every writer in the crate (poll loop, batch aggregator, incremental
//! write-path hook) goes through [`CacheStore`]. Readers only ever call `get`.
//!
//! ## Implementations
//!
//! - `memory` - `HashMap` with per-key expiry (single process, tests)
//! - `sqlite` - `cache_entries` table, multi-key writes in one transaction
//!
//! ## Layout
//!
//! - `envelope` - `CacheEnvelope<T>` freshness wrapper
//! - `keys` - logical key namespace

pub mod envelope;
pub mod keys;
pub mod memory;
pub mod sqlite;

pub use envelope::CacheEnvelope;
pub use memory::MemoryCacheStore;
pub use sqlite::SqliteCacheStore;

use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug)]
pub enum CacheError {
    Database(rusqlite::Error),
    Serialization(serde_json::Error),
    /// Stored value is not an integer (returned by `incr`)
    NotAnInteger(String),
    Unavailable(String),
}

impl From<rusqlite::Error> for CacheError {
    fn from(err: rusqlite::Error) -> Self {
        CacheError::Database(err)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err)
    }
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Database(e) => write!(f, "Cache database error: {}", e),
            CacheError::Serialization(e) => write!(f, "Cache serialization error: {}", e),
            CacheError::NotAnInteger(key) => write!(f, "Cache value at '{}' is not an integer", key),
            CacheError::Unavailable(msg) => write!(f, "Cache unavailable: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {}

/// One key/value pair of a multi-key write
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub value: String,
    /// `None` = no expiry
    pub ttl: Option<Duration>,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ttl,
        }
    }
}

/// Key/value store with per-key expiry and atomic multi-key write
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Read a key. Expired keys read as `None`.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Write a single key, replacing any previous value and expiry
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Write all entries as one atomic operation
    ///
    /// Either every entry becomes visible or none does. Readers never observe
    /// a half-applied batch.
    async fn set_many(&self, entries: Vec<CacheEntry>) -> Result<(), CacheError>;

    /// Atomically add `delta` to an integer key and return the new value
    ///
    /// A missing (or expired) key counts as 0. The key's expiry is preserved;
    /// a freshly created key has none.
    async fn incr(&self, key: &str, delta: i64) -> Result<i64, CacheError>;

    async fn del(&self, key: &str) -> Result<(), CacheError>;

    /// Drop expired entries, returning how many were removed
    async fn purge_expired(&self) -> Result<usize, CacheError>;

    /// Backend name for logging
    fn backend_type(&self) -> &'static str;
}
