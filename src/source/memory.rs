//! In-process event log implementing `DataSource`
//!
//! Ids are assigned sequentially from 1, mirroring an autoincrement primary
//! key. Bucket labels are computed in the configured local offset so series
//! line up with the SQLite implementation.

use super::{
    Bucket, BucketCount, DataSource, Dimension, Domain, IdDelta, NewEvent, RankEntry, SourceError,
    TimeRange,
};
use async_trait::async_trait;
use chrono::{FixedOffset, Offset, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct StoredEvent {
    id: i64,
    event: NewEvent,
}

#[derive(Debug, Default)]
struct EventLog {
    next_id: i64,
    events: Vec<StoredEvent>,
}

pub struct MemoryDataSource {
    logs: Mutex<HashMap<Domain, EventLog>>,
    offset: FixedOffset,
    queries: AtomicU64,
}

impl MemoryDataSource {
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            logs: Mutex::new(HashMap::new()),
            offset,
            queries: AtomicU64::new(0),
        }
    }

    /// UTC bucketing
    pub fn utc() -> Self {
        Self::new(Utc.fix())
    }

    /// Append an event and return its id
    pub fn record(&self, domain: Domain, event: NewEvent) -> i64 {
        let mut logs = self.logs.lock().unwrap_or_else(|p| p.into_inner());
        let log = logs.entry(domain).or_default();
        log.next_id += 1;
        let id = log.next_id;
        log.events.push(StoredEvent { id, event });
        id
    }

    /// Skip ahead so the next id is `next_id + 1` (simulates id gaps)
    pub fn advance_ids(&self, domain: Domain, next_id: i64) {
        let mut logs = self.logs.lock().unwrap_or_else(|p| p.into_inner());
        let log = logs.entry(domain).or_default();
        log.next_id = log.next_id.max(next_id);
    }

    /// Number of queries answered so far
    pub fn queries_served(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    fn matching<T>(
        &self,
        domain: Domain,
        range: TimeRange,
        f: impl FnOnce(Vec<&StoredEvent>) -> T,
    ) -> T {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let logs = self.logs.lock().unwrap_or_else(|p| p.into_inner());
        let in_range = logs
            .get(&domain)
            .map(|log| {
                log.events
                    .iter()
                    .filter(|e| range.contains(e.event.occurred_at))
                    .collect()
            })
            .unwrap_or_default();
        f(in_range)
    }
}

#[async_trait]
impl DataSource for MemoryDataSource {
    async fn count_between(&self, domain: Domain, range: TimeRange) -> Result<i64, SourceError> {
        Ok(self.matching(domain, range, |events| events.len() as i64))
    }

    async fn count_after_id(
        &self,
        domain: Domain,
        range: TimeRange,
        after_id: i64,
    ) -> Result<IdDelta, SourceError> {
        Ok(self.matching(domain, range, |events| {
            let newer: Vec<i64> = events.iter().map(|e| e.id).filter(|id| *id > after_id).collect();
            IdDelta {
                count: newer.len() as i64,
                max_id: newer.iter().copied().max(),
            }
        }))
    }

    async fn bucket_counts(
        &self,
        domain: Domain,
        bucket: Bucket,
        range: TimeRange,
    ) -> Result<Vec<BucketCount>, SourceError> {
        let offset = self.offset;
        Ok(self.matching(domain, range, |events| {
            let mut counts: BTreeMap<String, i64> = BTreeMap::new();
            for stored in events {
                let label = stored
                    .event
                    .occurred_at
                    .with_timezone(&offset)
                    .format(bucket.label_format())
                    .to_string();
                *counts.entry(label).or_insert(0) += 1;
            }
            counts
                .into_iter()
                .map(|(bucket, count)| BucketCount { bucket, count })
                .collect()
        }))
    }

    async fn top_n(
        &self,
        domain: Domain,
        dimension: Dimension,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<RankEntry>, SourceError> {
        if !domain.supports(dimension) {
            return Err(SourceError::UnsupportedDimension { domain, dimension });
        }

        Ok(self.matching(domain, range, |events| {
            let mut counts: HashMap<String, i64> = HashMap::new();
            for stored in events {
                if let Some(value) = stored.event.dimension_value(dimension) {
                    *counts.entry(value.to_string()).or_insert(0) += 1;
                }
            }
            let mut ranked: Vec<RankEntry> = counts
                .into_iter()
                .map(|(key, count)| RankEntry { key, count })
                .collect();
            ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
            ranked.truncate(limit);
            ranked
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, day, hour, 0, 0).unwrap()
    }

    fn may() -> TimeRange {
        TimeRange::new(at(1, 0), Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_counts_and_ids() {
        let source = MemoryDataSource::utc();
        for day in 1..=3 {
            source.record(Domain::Visits, NewEvent::visit(at(day, 9), "v1", Some("law")));
        }
        source.advance_ids(Domain::Visits, 100);
        let id = source.record(Domain::Visits, NewEvent::visit(at(4, 9), "v2", None));
        assert_eq!(id, 101);

        assert_eq!(source.count_between(Domain::Visits, may()).await.unwrap(), 4);
        assert_eq!(source.count_between(Domain::Loans, may()).await.unwrap(), 0);

        let delta = source.count_after_id(Domain::Visits, may(), 2).await.unwrap();
        assert_eq!(delta, IdDelta { count: 2, max_id: Some(101) });

        let none = source.count_after_id(Domain::Visits, may(), 101).await.unwrap();
        assert_eq!(none, IdDelta { count: 0, max_id: None });
    }

    #[tokio::test]
    async fn test_bucket_counts_respect_offset() {
        // UTC+02:00: 23:00 UTC on the 1st is already the 2nd locally
        let source = MemoryDataSource::new(FixedOffset::east_opt(2 * 3600).unwrap());
        source.record(Domain::Visits, NewEvent::visit(at(1, 10), "a", None));
        source.record(Domain::Visits, NewEvent::visit(at(1, 23), "b", None));

        let series = source.bucket_counts(Domain::Visits, Bucket::Day, may()).await.unwrap();
        assert_eq!(
            series,
            vec![
                BucketCount { bucket: "2026-05-01".to_string(), count: 1 },
                BucketCount { bucket: "2026-05-02".to_string(), count: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn test_top_n_orders_and_truncates() {
        let source = MemoryDataSource::utc();
        for (title, n) in [("Dune", 3), ("Emma", 1), ("Beloved", 3), ("Ulysses", 2)] {
            for _ in 0..n {
                source.record(Domain::Loans, NewEvent::loan(at(2, 12), "b1", None, title, Some("fiction")));
            }
        }

        let top = source.top_n(Domain::Loans, Dimension::Title, may(), 3).await.unwrap();
        let keys: Vec<&str> = top.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["Beloved", "Dune", "Ulysses"]);

        let unsupported = source.top_n(Domain::Visits, Dimension::Title, may(), 3).await;
        assert!(matches!(unsupported, Err(SourceError::UnsupportedDimension { .. })));
    }
}
