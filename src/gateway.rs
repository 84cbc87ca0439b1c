//! Read gateway - the read path request handlers call
//!
//! The live count may fall back to one direct source query on a cache
//! miss. Every other aggregate is served from the cache or answered with a
//! "warming" response; nothing else ever reaches the source from here.

use crate::batch::{BatchStatus, DomainSummary, TotalsSnapshot};
use crate::cache::keys::{self, Window};
use crate::cache::{CacheEnvelope, CacheStore};
use crate::live::{PeriodClock, LIVE_DOMAIN};
use crate::source::{BucketCount, DataSource, Dimension, Domain, RankEntry};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    /// TTL of a live value computed on a cache miss
    pub live_fallback_ttl: Duration,
    pub retry_after: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            live_fallback_ttl: Duration::from_secs(5),
            retry_after: Duration::from_secs(30),
        }
    }
}

/// Where a live value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveSource {
    Cache,
    Source,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveRead {
    pub total: i64,
    pub source: LiveSource,
}

/// Body of a 202 answer: try again later
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmingResponse {
    pub status: String,
    pub message: String,
    pub retry_after_seconds: u64,
}

impl WarmingResponse {
    pub fn new(message: impl Into<String>, retry_after: Duration) -> Self {
        Self {
            status: "warming".to_string(),
            message: message.into(),
            retry_after_seconds: retry_after.as_secs().max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome<T> {
    Fresh(T),
    Warming(WarmingResponse),
}

impl<T> ReadOutcome<T> {
    pub fn status_code(&self) -> u16 {
        match self {
            ReadOutcome::Fresh(_) => 200,
            ReadOutcome::Warming(_) => 202,
        }
    }

    pub fn is_warming(&self) -> bool {
        matches!(self, ReadOutcome::Warming(_))
    }

    pub fn fresh(self) -> Option<T> {
        match self {
            ReadOutcome::Fresh(value) => Some(value),
            ReadOutcome::Warming(_) => None,
        }
    }
}

impl<T: Serialize> ReadOutcome<T> {
    /// JSON response body
    pub fn body(&self) -> Result<String, serde_json::Error> {
        match self {
            ReadOutcome::Fresh(value) => serde_json::to_string(value),
            ReadOutcome::Warming(warming) => serde_json::to_string(warming),
        }
    }
}

pub struct ReadGateway {
    cache: Arc<dyn CacheStore>,
    source: Arc<dyn DataSource>,
    clock: PeriodClock,
    config: GatewayConfig,
    /// Keys whose malformed payload has already been reported
    malformed: Mutex<HashSet<String>>,
}

impl ReadGateway {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        source: Arc<dyn DataSource>,
        clock: PeriodClock,
        config: GatewayConfig,
    ) -> Self {
        Self {
            cache,
            source,
            clock,
            config,
            malformed: Mutex::new(HashSet::new()),
        }
    }

    /// Live count: cache first, then one direct count on a miss
    pub async fn live_count(&self) -> ReadOutcome<LiveRead> {
        if let Some(raw) = self.cached(keys::LIVE_COUNT).await {
            match raw.trim().parse::<i64>() {
                Ok(total) => {
                    self.clear_malformed(keys::LIVE_COUNT);
                    return ReadOutcome::Fresh(LiveRead {
                        total,
                        source: LiveSource::Cache,
                    });
                }
                Err(_) => self.note_malformed(keys::LIVE_COUNT, "not an integer"),
            }
        }

        let period = self.clock.today();
        let total = match self.source.count_between(LIVE_DOMAIN, period.range).await {
            Ok(total) => total,
            Err(e) => {
                log::warn!("⚠️  Live fallback query failed: {}", e);
                return self.warming("Live count is being computed");
            }
        };

        if let Err(e) = self
            .cache
            .set(keys::LIVE_COUNT, &total.to_string(), Some(self.config.live_fallback_ttl))
            .await
        {
            log::warn!("⚠️  Failed to cache live fallback value: {}", e);
        }

        log::debug!("🩹 Live count served from source: {}", total);
        ReadOutcome::Fresh(LiveRead {
            total,
            source: LiveSource::Source,
        })
    }

    /// Any batch-produced envelope; never computes on a miss
    pub async fn read_aggregate<T: DeserializeOwned>(&self, key: &str) -> ReadOutcome<CacheEnvelope<T>> {
        let Some(raw) = self.cached(key).await else {
            return self.warming(format!("Aggregate '{}' is being prepared", key));
        };

        match CacheEnvelope::<T>::decode(&raw) {
            Ok(envelope) => {
                self.clear_malformed(key);
                ReadOutcome::Fresh(envelope)
            }
            Err(e) => {
                self.note_malformed(key, &e.to_string());
                self.warming(format!("Aggregate '{}' is being prepared", key))
            }
        }
    }

    pub async fn series(&self, domain: Domain, window: Window) -> ReadOutcome<CacheEnvelope<Vec<BucketCount>>> {
        self.read_aggregate(&keys::window(domain, window)).await
    }

    pub async fn totals(&self, domain: Domain) -> ReadOutcome<CacheEnvelope<TotalsSnapshot>> {
        self.read_aggregate(&keys::totals(domain)).await
    }

    pub async fn top(&self, domain: Domain, dimension: Dimension) -> ReadOutcome<CacheEnvelope<Vec<RankEntry>>> {
        self.read_aggregate(&keys::top(domain, dimension)).await
    }

    pub async fn summary(&self, domain: Domain) -> ReadOutcome<CacheEnvelope<DomainSummary>> {
        self.read_aggregate(&keys::summary(domain)).await
    }

    pub async fn batch_status(&self) -> ReadOutcome<CacheEnvelope<BatchStatus>> {
        self.read_aggregate(keys::BATCH_STATUS).await
    }

    /// Cache read where a store failure counts as a miss
    async fn cached(&self, key: &str) -> Option<String> {
        match self.cache.get(key).await {
            Ok(value) => value,
            Err(e) => {
                log::warn!("⚠️  Cache read failed for '{}': {}", key, e);
                None
            }
        }
    }

    fn warming<T>(&self, message: impl Into<String>) -> ReadOutcome<T> {
        ReadOutcome::Warming(WarmingResponse::new(message, self.config.retry_after))
    }

    fn note_malformed(&self, key: &str, reason: &str) {
        let first = self
            .malformed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string());
        if first {
            log::warn!("⚠️  Malformed cache payload at '{}' treated as miss: {}", key, reason);
        }
    }

    fn clear_malformed(&self, key: &str) {
        let mut malformed = self.malformed.lock().unwrap_or_else(|p| p.into_inner());
        if !malformed.is_empty() {
            malformed.remove(key);
        }
    }
}
