//! Live counter - "visits since local midnight"
//!
//! Three interchangeable strategies, chosen once at startup from
//! `LIVE_COUNTER_STRATEGY`:
//!
//! | strategy      | per-cycle cost            | persisted state                          |
//! |---------------|---------------------------|------------------------------------------|
//! | `direct`      | full `COUNT(*)` for today | none                                     |
//! | `incremental` | one cache read            | `{base, last_reconciled_at}` + delta key |
//! | `delta`       | `COUNT/MAX(id)` above mark | `{base_count, base_max_id, initialized_for}` |
//!
//! State lives in the cache store, so a restarted process resumes where the
//! previous one stopped. Query failures propagate to the caller; nothing here
//! retries.

pub mod delta;
pub mod direct;
pub mod incremental;
pub mod period;

pub use delta::{DeltaCounter, DeltaState};
pub use direct::DirectCounter;
pub use incremental::{IncrementalCounter, IncrementalState};
pub use period::{Period, PeriodClock};

use crate::cache::{CacheError, CacheStore};
use crate::source::{DataSource, Domain, SourceError};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Event family the live metric counts
pub const LIVE_DOMAIN: Domain = Domain::Visits;

#[derive(Debug)]
pub enum CounterError {
    Source(SourceError),
    Cache(CacheError),
    Serialization(serde_json::Error),
}

impl From<SourceError> for CounterError {
    fn from(err: SourceError) -> Self {
        CounterError::Source(err)
    }
}

impl From<CacheError> for CounterError {
    fn from(err: CacheError) -> Self {
        CounterError::Cache(err)
    }
}

impl From<serde_json::Error> for CounterError {
    fn from(err: serde_json::Error) -> Self {
        CounterError::Serialization(err)
    }
}

impl std::fmt::Display for CounterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CounterError::Source(e) => write!(f, "Live count query failed: {}", e),
            CounterError::Cache(e) => write!(f, "Live counter state unavailable: {}", e),
            CounterError::Serialization(e) => write!(f, "Live counter state encoding failed: {}", e),
        }
    }
}

impl std::error::Error for CounterError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveStrategyKind {
    Direct,
    Incremental,
    Delta,
}

impl LiveStrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LiveStrategyKind::Direct => "direct",
            LiveStrategyKind::Incremental => "incremental",
            LiveStrategyKind::Delta => "delta",
        }
    }
}

impl FromStr for LiveStrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(LiveStrategyKind::Direct),
            "incremental" => Ok(LiveStrategyKind::Incremental),
            "delta" => Ok(LiveStrategyKind::Delta),
            other => Err(format!(
                "unknown live counter strategy '{}' (expected direct, incremental or delta)",
                other
            )),
        }
    }
}

/// Live counter with its strategy fixed at construction
pub enum LiveCounter {
    Direct(DirectCounter),
    Incremental(IncrementalCounter),
    Delta(DeltaCounter),
}

impl LiveCounter {
    pub fn build(
        kind: LiveStrategyKind,
        source: Arc<dyn DataSource>,
        cache: Arc<dyn CacheStore>,
        clock: PeriodClock,
        reconcile_interval: Duration,
    ) -> Self {
        match kind {
            LiveStrategyKind::Direct => LiveCounter::Direct(DirectCounter::new(source, clock)),
            LiveStrategyKind::Incremental => LiveCounter::Incremental(IncrementalCounter::new(
                source,
                cache,
                clock,
                reconcile_interval,
            )),
            LiveStrategyKind::Delta => LiveCounter::Delta(DeltaCounter::new(source, cache, clock)),
        }
    }

    pub fn kind(&self) -> LiveStrategyKind {
        match self {
            LiveCounter::Direct(_) => LiveStrategyKind::Direct,
            LiveCounter::Incremental(_) => LiveStrategyKind::Incremental,
            LiveCounter::Delta(_) => LiveStrategyKind::Delta,
        }
    }

    /// Current live value
    pub async fn evaluate(&self) -> Result<i64, CounterError> {
        match self {
            LiveCounter::Direct(counter) => counter.evaluate().await,
            LiveCounter::Incremental(counter) => counter.evaluate().await,
            LiveCounter::Delta(counter) => counter.evaluate().await,
        }
    }

    /// Write-path hook: call once per recorded event
    ///
    /// Only the incremental strategy keeps a running delta; the other two
    /// read the source directly and ignore the hook.
    pub async fn increment(&self, by: i64) -> Result<(), CounterError> {
        match self {
            LiveCounter::Incremental(counter) => counter.increment(by).await,
            LiveCounter::Direct(_) | LiveCounter::Delta(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("direct".parse::<LiveStrategyKind>(), Ok(LiveStrategyKind::Direct));
        assert_eq!(" Incremental ".parse::<LiveStrategyKind>(), Ok(LiveStrategyKind::Incremental));
        assert_eq!("DELTA".parse::<LiveStrategyKind>(), Ok(LiveStrategyKind::Delta));
        assert!("redis".parse::<LiveStrategyKind>().is_err());
    }
}
