//! Data source capability - the relational store behind the caches
//!
//! The core never issues SQL directly; it calls into [`DataSource`]. Every
//! method is a single bounded aggregate query over the append-only event
//! tables (`visits`, `loans`).
//!
//! Implementations:
//! - `sqlite` - `SqliteDataSource` over rusqlite
//! - `memory` - `MemoryDataSource`, an in-process event log

pub mod memory;
pub mod sqlite;

pub use memory::MemoryDataSource;
pub use sqlite::SqliteDataSource;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum SourceError {
    Database(rusqlite::Error),
    /// Dimension does not exist for the requested domain
    UnsupportedDimension { domain: Domain, dimension: Dimension },
    InvalidEvent(String),
    Unavailable(String),
}

impl From<rusqlite::Error> for SourceError {
    fn from(err: rusqlite::Error) -> Self {
        SourceError::Database(err)
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Database(e) => write!(f, "Source database error: {}", e),
            SourceError::UnsupportedDimension { domain, dimension } => write!(
                f,
                "Dimension '{}' is not available for {}",
                dimension.as_str(),
                domain.as_str()
            ),
            SourceError::InvalidEvent(msg) => write!(f, "Invalid event: {}", msg),
            SourceError::Unavailable(msg) => write!(f, "Source unavailable: {}", msg),
        }
    }
}

impl std::error::Error for SourceError {}

/// Event family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Visits,
    Loans,
}

impl Domain {
    pub const ALL: [Domain; 2] = [Domain::Visits, Domain::Loans];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Visits => "visits",
            Domain::Loans => "loans",
        }
    }

    /// Ranking dimensions published for this domain
    pub fn dimensions(&self) -> &'static [Dimension] {
        match self {
            Domain::Visits => &[Dimension::Faculty, Dimension::Visitor],
            Domain::Loans => &[Dimension::Title, Dimension::Category, Dimension::Faculty],
        }
    }

    pub fn supports(&self, dimension: Dimension) -> bool {
        self.dimensions().contains(&dimension)
    }
}

/// Grouping column for top-N rankings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Faculty,
    /// Visitor id (visits) or borrower id (loans)
    Visitor,
    Title,
    Category,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Faculty => "faculty",
            Dimension::Visitor => "visitor",
            Dimension::Title => "title",
            Dimension::Category => "category",
        }
    }
}

/// Calendar bucket size for series queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Day,
    Month,
    Year,
}

impl Bucket {
    /// `strftime` / `chrono` format of the bucket label
    pub fn label_format(&self) -> &'static str {
        match self {
            Bucket::Day => "%Y-%m-%d",
            Bucket::Month => "%Y-%m",
            Bucket::Year => "%Y",
        }
    }
}

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCount {
    pub bucket: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankEntry {
    pub key: String,
    pub count: i64,
}

/// Rows above an id low-water mark: how many, and the highest id seen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdDelta {
    pub count: i64,
    pub max_id: Option<i64>,
}

/// An event to append (visit or loan)
///
/// `actor` is the visitor id for visits and the borrower id for loans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub occurred_at: DateTime<Utc>,
    pub actor: String,
    pub faculty: Option<String>,
    pub title: Option<String>,
    pub category: Option<String>,
}

impl NewEvent {
    pub fn visit(occurred_at: DateTime<Utc>, visitor: &str, faculty: Option<&str>) -> Self {
        Self {
            occurred_at,
            actor: visitor.to_string(),
            faculty: faculty.map(str::to_string),
            title: None,
            category: None,
        }
    }

    pub fn loan(
        occurred_at: DateTime<Utc>,
        borrower: &str,
        faculty: Option<&str>,
        title: &str,
        category: Option<&str>,
    ) -> Self {
        Self {
            occurred_at,
            actor: borrower.to_string(),
            faculty: faculty.map(str::to_string),
            title: Some(title.to_string()),
            category: category.map(str::to_string),
        }
    }

    /// Value of a ranking dimension for this event, if present
    pub fn dimension_value(&self, dimension: Dimension) -> Option<&str> {
        match dimension {
            Dimension::Faculty => self.faculty.as_deref(),
            Dimension::Visitor => Some(self.actor.as_str()),
            Dimension::Title => self.title.as_deref(),
            Dimension::Category => self.category.as_deref(),
        }
    }
}

#[async_trait]
pub trait DataSource: Send + Sync {
    /// `COUNT(*)` of events in `range`
    async fn count_between(&self, domain: Domain, range: TimeRange) -> Result<i64, SourceError>;

    /// Count and `MAX(id)` of events in `range` with `id > after_id`
    ///
    /// `after_id = 0` yields the full baseline for the range.
    async fn count_after_id(
        &self,
        domain: Domain,
        range: TimeRange,
        after_id: i64,
    ) -> Result<IdDelta, SourceError>;

    /// Per-bucket counts in `range`, ascending by bucket; empty buckets omitted
    async fn bucket_counts(
        &self,
        domain: Domain,
        bucket: Bucket,
        range: TimeRange,
    ) -> Result<Vec<BucketCount>, SourceError>;

    /// Top `limit` values of `dimension` in `range`, by count descending
    ///
    /// Ties are broken by key ascending so repeated runs are stable.
    async fn top_n(
        &self,
        domain: Domain,
        dimension: Dimension,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<RankEntry>, SourceError>;
}
