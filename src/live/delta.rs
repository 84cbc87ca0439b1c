//! Delta strategy - id high-water mark, no write-path hook
//!
//! The first evaluation of a local day runs one baseline query
//! (`COUNT(*)`, `MAX(id)` for today) and stores it. Later evaluations only
//! look at rows above `base_max_id`, folding them in when something new
//! appears. Within a day `base_count` and `base_max_id` never decrease.

use super::{CounterError, Period, PeriodClock, LIVE_DOMAIN};
use crate::cache::{keys, CacheStore};
use crate::source::DataSource;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Baseline stored as JSON under `keys::DELTA_STATE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaState {
    pub base_count: i64,
    pub base_max_id: i64,
    pub initialized_for: NaiveDate,
}

pub struct DeltaCounter {
    source: Arc<dyn DataSource>,
    cache: Arc<dyn CacheStore>,
    clock: PeriodClock,
}

impl DeltaCounter {
    pub fn new(source: Arc<dyn DataSource>, cache: Arc<dyn CacheStore>, clock: PeriodClock) -> Self {
        Self { source, cache, clock }
    }

    pub async fn evaluate(&self) -> Result<i64, CounterError> {
        let period = self.clock.today();

        let state = match self.load_state().await? {
            Some(state) if state.initialized_for == period.date => state,
            _ => return self.initialize(period).await,
        };

        let delta = self
            .source
            .count_after_id(LIVE_DOMAIN, period.range, state.base_max_id)
            .await?;

        match delta.max_id {
            Some(max_id) if delta.count > 0 && max_id > state.base_max_id => {
                let next = DeltaState {
                    base_count: state.base_count + delta.count,
                    base_max_id: max_id,
                    initialized_for: state.initialized_for,
                };
                self.save_state(&next).await?;
                log::debug!(
                    "📈 Delta counter advanced: +{} (max_id {} -> {})",
                    delta.count,
                    state.base_max_id,
                    max_id
                );
                Ok(next.base_count)
            }
            _ => Ok(state.base_count),
        }
    }

    /// Persisted baseline, if present and decodable
    pub async fn load_state(&self) -> Result<Option<DeltaState>, CounterError> {
        let Some(raw) = self.cache.get(keys::DELTA_STATE).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                log::warn!("⚠️  Discarding undecodable delta state: {}", e);
                Ok(None)
            }
        }
    }

    async fn save_state(&self, state: &DeltaState) -> Result<(), CounterError> {
        let raw = serde_json::to_string(state)?;
        self.cache.set(keys::DELTA_STATE, &raw, None).await?;
        Ok(())
    }

    /// Baseline for a new day (or missing state); returns the baseline count
    async fn initialize(&self, period: Period) -> Result<i64, CounterError> {
        let baseline = self.source.count_after_id(LIVE_DOMAIN, period.range, 0).await?;
        let state = DeltaState {
            base_count: baseline.count,
            base_max_id: baseline.max_id.unwrap_or(0),
            initialized_for: period.date,
        };
        self.save_state(&state).await?;

        log::info!(
            "📍 Delta counter initialized for {}: count={} max_id={}",
            period.date,
            state.base_count,
            state.base_max_id
        );
        Ok(state.base_count)
    }
}
