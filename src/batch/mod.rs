//! Batch aggregates - everything except the live count
//!
//! A run queries every aggregate for both domains concurrently, then writes
//! all envelopes, the per-domain summaries and `batch:status` in a single
//! `set_many`. One failed query means nothing is written and the previous
//! envelopes stay authoritative until they expire.

pub mod aggregator;
pub mod scheduler;

pub use aggregator::{BatchAggregator, BatchConfig};
pub use scheduler::{parse_schedule, schedule_period, BatchScheduler};

use crate::cache::CacheError;
use crate::source::{BucketCount, Domain, RankEntry, SourceError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Event counts over the rolling week, month-to-date and year-to-date
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalsSnapshot {
    pub week: i64,
    pub month: i64,
    pub year: i64,
}

/// Composite of every aggregate for one domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSummary {
    pub domain: Domain,
    pub totals: TotalsSnapshot,
    /// Last 7 local days
    pub daily: Vec<BucketCount>,
    /// Months of the current year
    pub monthly: Vec<BucketCount>,
    /// Last 5 years
    pub yearly: Vec<BucketCount>,
    /// Ranking per dimension name, last 30 days
    pub top: BTreeMap<String, Vec<RankEntry>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStatus {
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub keys_written: usize,
    pub domains: Vec<Domain>,
}

#[derive(Debug)]
pub enum BatchError {
    Source(SourceError),
    Cache(CacheError),
    Serialization(serde_json::Error),
    /// A query task panicked or was cancelled
    Task(String),
}

impl From<SourceError> for BatchError {
    fn from(err: SourceError) -> Self {
        BatchError::Source(err)
    }
}

impl From<CacheError> for BatchError {
    fn from(err: CacheError) -> Self {
        BatchError::Cache(err)
    }
}

impl From<serde_json::Error> for BatchError {
    fn from(err: serde_json::Error) -> Self {
        BatchError::Serialization(err)
    }
}

impl From<tokio::task::JoinError> for BatchError {
    fn from(err: tokio::task::JoinError) -> Self {
        BatchError::Task(err.to_string())
    }
}

impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchError::Source(e) => write!(f, "Aggregate query failed: {}", e),
            BatchError::Cache(e) => write!(f, "Batch write failed: {}", e),
            BatchError::Serialization(e) => write!(f, "Envelope encoding failed: {}", e),
            BatchError::Task(e) => write!(f, "Aggregate task failed: {}", e),
        }
    }
}

impl std::error::Error for BatchError {}
