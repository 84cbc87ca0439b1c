//! Incremental strategy - running delta with periodic reconciliation
//!
//! The write path calls `increment` for every new visit. `evaluate` serves
//! `base + delta` from the cache and only touches the source when the
//! reconciliation window has elapsed, the day has rolled over, or no state
//! exists yet. A skipped or doubled hook call drifts the value until the
//! next reconciliation and no further.

use super::{CounterError, Period, PeriodClock, LIVE_DOMAIN};
use crate::cache::{keys, CacheEntry, CacheStore};
use crate::source::DataSource;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Reconciled base, stored as JSON under `keys::INCREMENTAL_STATE`
///
/// The running delta lives in its own integer key so the hook can bump it
/// with an atomic `incr`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalState {
    pub base: i64,
    pub last_reconciled_at: DateTime<Utc>,
    /// Local day `base` was counted for
    pub period: NaiveDate,
}

pub struct IncrementalCounter {
    source: Arc<dyn DataSource>,
    cache: Arc<dyn CacheStore>,
    clock: PeriodClock,
    reconcile_interval: chrono::Duration,
}

impl IncrementalCounter {
    pub fn new(
        source: Arc<dyn DataSource>,
        cache: Arc<dyn CacheStore>,
        clock: PeriodClock,
        reconcile_interval: Duration,
    ) -> Self {
        Self {
            source,
            cache,
            clock,
            reconcile_interval: chrono::Duration::from_std(reconcile_interval)
                .unwrap_or_else(|_| chrono::Duration::minutes(1)),
        }
    }

    pub async fn evaluate(&self) -> Result<i64, CounterError> {
        let now = self.clock.now();
        let period = self.clock.period_at(now);

        match self.load_state().await? {
            Some(state)
                if state.period == period.date
                    && now - state.last_reconciled_at <= self.reconcile_interval =>
            {
                let delta = self.load_delta().await?;
                Ok(state.base + delta)
            }
            _ => self.reconcile(now, period).await,
        }
    }

    pub async fn increment(&self, by: i64) -> Result<(), CounterError> {
        self.cache.incr(keys::INCREMENTAL_DELTA, by).await?;
        Ok(())
    }

    /// Persisted base, if present and decodable
    pub async fn load_state(&self) -> Result<Option<IncrementalState>, CounterError> {
        let Some(raw) = self.cache.get(keys::INCREMENTAL_STATE).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                log::warn!("⚠️  Discarding undecodable incremental state: {}", e);
                Ok(None)
            }
        }
    }

    async fn load_delta(&self) -> Result<i64, CounterError> {
        let raw = self.cache.get(keys::INCREMENTAL_DELTA).await?;
        Ok(match raw {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                log::warn!("⚠️  Incremental delta '{}' is not an integer, reading as 0", raw);
                0
            }),
            None => 0,
        })
    }

    /// Replace the base with an authoritative count and zero the delta
    async fn reconcile(&self, now: DateTime<Utc>, period: Period) -> Result<i64, CounterError> {
        let base = self.source.count_between(LIVE_DOMAIN, period.range).await?;
        let state = IncrementalState {
            base,
            last_reconciled_at: now,
            period: period.date,
        };

        self.cache
            .set_many(vec![
                CacheEntry::new(keys::INCREMENTAL_STATE, serde_json::to_string(&state)?, None),
                CacheEntry::new(keys::INCREMENTAL_DELTA, "0", None),
            ])
            .await?;

        log::debug!("🔄 Incremental counter reconciled: base={} period={}", base, period.date);
        Ok(base)
    }
}
