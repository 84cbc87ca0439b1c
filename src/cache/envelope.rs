//! Cache envelope - freshness metadata around every non-live aggregate
//!
//! Wire shape:
//!
//! ```json
//! {"generated_at": "2026-10-18T02:00:03.120Z", "ttl_seconds": 129600, "data": { ... }}
//! ```
//!
//! `generated_at` is stamped when the computation finished, not when the
//! value was written. `ttl_seconds` is the staleness budget advertised to
//! clients; the store's own expiry is configured alongside it but enforced
//! separately.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEnvelope<T> {
    pub generated_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub data: T,
}

impl<T> CacheEnvelope<T> {
    pub fn new(data: T, generated_at: DateTime<Utc>, ttl_seconds: u64) -> Self {
        Self {
            generated_at,
            ttl_seconds,
            data,
        }
    }

    /// Age relative to `now` (zero if `generated_at` is in the future)
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        let age = now - self.generated_at;
        if age < chrono::Duration::zero() {
            chrono::Duration::zero()
        } else {
            age
        }
    }

    /// True once the envelope is older than its advertised budget
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.age(now).num_seconds() > i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheEnvelope<U> {
        CacheEnvelope {
            generated_at: self.generated_at,
            ttl_seconds: self.ttl_seconds,
            data: f(self.data),
        }
    }
}

impl<T: Serialize> CacheEnvelope<T> {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl<T: DeserializeOwned> CacheEnvelope<T> {
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
