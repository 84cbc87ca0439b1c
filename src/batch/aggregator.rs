use super::{BatchError, BatchStatus, DomainSummary, TotalsSnapshot};
use crate::cache::keys::{self, Window};
use crate::cache::{CacheEntry, CacheEnvelope, CacheStore};
use crate::live::PeriodClock;
use crate::source::{Bucket, DataSource, Domain, RankEntry, SourceError, TimeRange};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

const DAILY_SERIES_DAYS: i64 = 7;
const RANKING_DAYS: i64 = 30;
/// Yearly series covers this many years before the current one
const YEARLY_SERIES_YEARS_BACK: i32 = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    /// Envelope TTL, longer than the schedule period
    pub ttl: Duration,
    pub top_n: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(36 * 3600),
            top_n: 10,
        }
    }
}

/// Query ranges for one run, all anchored on the same local day
#[derive(Debug, Clone, Copy)]
struct Windows {
    week: TimeRange,
    month: TimeRange,
    year: TimeRange,
    five_years: TimeRange,
    ranking: TimeRange,
}

impl Windows {
    fn at(clock: &PeriodClock, today: NaiveDate) -> Self {
        Self {
            week: clock.last_days(today, DAILY_SERIES_DAYS),
            month: clock.month_to_date(today),
            year: clock.years_to_date(today, 0),
            five_years: clock.years_to_date(today, YEARLY_SERIES_YEARS_BACK),
            ranking: clock.last_days(today, RANKING_DAYS),
        }
    }
}

pub struct BatchAggregator {
    source: Arc<dyn DataSource>,
    cache: Arc<dyn CacheStore>,
    clock: PeriodClock,
    config: BatchConfig,
}

impl BatchAggregator {
    pub fn new(
        source: Arc<dyn DataSource>,
        cache: Arc<dyn CacheStore>,
        clock: PeriodClock,
        config: BatchConfig,
    ) -> Self {
        Self {
            source,
            cache,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Recompute and publish every batch aggregate
    ///
    /// All queries must succeed before anything is written; the write itself
    /// is one `set_many`.
    pub async fn run(&self) -> Result<BatchStatus, BatchError> {
        let started = Instant::now();
        let today = self.clock.local_date(self.clock.now());
        let windows = Windows::at(&self.clock, today);

        let mut tasks = JoinSet::new();
        for domain in Domain::ALL {
            tasks.spawn(collect_domain(Arc::clone(&self.source), domain, windows, self.config.top_n));
        }

        let mut summaries = Vec::with_capacity(Domain::ALL.len());
        while let Some(joined) = tasks.join_next().await {
            summaries.push(joined??);
        }
        summaries.sort_by_key(|s| Domain::ALL.iter().position(|d| *d == s.domain));

        let generated_at = self.clock.now();
        let mut entries = Vec::new();
        for summary in &summaries {
            self.push_domain_entries(&mut entries, summary, generated_at)?;
        }

        let status = BatchStatus {
            completed_at: generated_at,
            duration_ms: started.elapsed().as_millis() as u64,
            keys_written: entries.len() + 1,
            domains: summaries.iter().map(|s| s.domain).collect(),
        };
        entries.push(self.envelope_entry(keys::BATCH_STATUS.to_string(), &status, generated_at)?);

        if let Err(e) = self.cache.set_many(entries).await {
            log::error!("❌ Batch write failed, previous aggregates remain: {}", e);
            return Err(e.into());
        }

        log::info!("📦 Batch aggregates refreshed");
        for summary in &summaries {
            log::info!(
                "   ├─ {}: week={} month={} year={}",
                summary.domain.as_str(),
                summary.totals.week,
                summary.totals.month,
                summary.totals.year
            );
        }
        log::info!("   └─ {} keys in {}ms", status.keys_written, status.duration_ms);

        Ok(status)
    }

    fn push_domain_entries(
        &self,
        entries: &mut Vec<CacheEntry>,
        summary: &DomainSummary,
        generated_at: DateTime<Utc>,
    ) -> Result<(), BatchError> {
        let domain = summary.domain;
        let series = [
            (Window::Daily, &summary.daily),
            (Window::Monthly, &summary.monthly),
            (Window::Yearly, &summary.yearly),
        ];
        for (window, data) in series {
            entries.push(self.envelope_entry(keys::window(domain, window), data, generated_at)?);
        }

        entries.push(self.envelope_entry(keys::totals(domain), &summary.totals, generated_at)?);

        for &dimension in domain.dimensions() {
            let ranking = summary
                .top
                .get(dimension.as_str())
                .cloned()
                .unwrap_or_default();
            entries.push(self.envelope_entry(keys::top(domain, dimension), &ranking, generated_at)?);
        }

        entries.push(self.envelope_entry(keys::summary(domain), summary, generated_at)?);
        Ok(())
    }

    fn envelope_entry<T: Serialize>(
        &self,
        key: String,
        data: &T,
        generated_at: DateTime<Utc>,
    ) -> Result<CacheEntry, BatchError> {
        let raw = CacheEnvelope::new(data, generated_at, self.config.ttl.as_secs()).encode()?;
        Ok(CacheEntry::new(key, raw, Some(self.config.ttl)))
    }
}

async fn collect_domain(
    source: Arc<dyn DataSource>,
    domain: Domain,
    w: Windows,
    top_n: usize,
) -> Result<DomainSummary, BatchError> {
    let (daily, monthly, yearly, week, month, year, top) = tokio::try_join!(
        source.bucket_counts(domain, Bucket::Day, w.week),
        source.bucket_counts(domain, Bucket::Month, w.year),
        source.bucket_counts(domain, Bucket::Year, w.five_years),
        source.count_between(domain, w.week),
        source.count_between(domain, w.month),
        source.count_between(domain, w.year),
        collect_rankings(Arc::clone(&source), domain, w.ranking, top_n),
    )?;

    Ok(DomainSummary {
        domain,
        totals: TotalsSnapshot { week, month, year },
        daily,
        monthly,
        yearly,
        top,
    })
}

async fn collect_rankings(
    source: Arc<dyn DataSource>,
    domain: Domain,
    range: TimeRange,
    limit: usize,
) -> Result<BTreeMap<String, Vec<RankEntry>>, SourceError> {
    let mut tasks = JoinSet::new();
    for &dimension in domain.dimensions() {
        let source = Arc::clone(&source);
        tasks.spawn(async move {
            source
                .top_n(domain, dimension, range, limit)
                .await
                .map(|ranking| (dimension, ranking))
        });
    }

    let mut top = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        let (dimension, ranking) =
            joined.map_err(|e| SourceError::Unavailable(format!("ranking task failed: {}", e)))??;
        top.insert(dimension.as_str().to_string(), ranking);
    }
    Ok(top)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheError, MemoryCacheStore};
    use crate::source::{BucketCount, Dimension, IdDelta, MemoryDataSource, NewEvent};
    use async_trait::async_trait;
    use chrono::{FixedOffset, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 10, 0, 0).unwrap()
    }

    fn fixed_clock() -> PeriodClock {
        PeriodClock::with_now_fn(FixedOffset::east_opt(0).unwrap(), Arc::new(now))
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn seeded_source() -> MemoryDataSource {
        let source = MemoryDataSource::utc();
        for visitor in ["v1", "v2", "v1"] {
            source.record(Domain::Visits, NewEvent::visit(at(2026, 10, 18), visitor, Some("law")));
        }
        source.record(Domain::Visits, NewEvent::visit(at(2026, 10, 15), "v3", Some("arts")));
        source.record(Domain::Visits, NewEvent::visit(at(2026, 10, 15), "v1", Some("arts")));
        source.record(Domain::Visits, NewEvent::visit(at(2026, 3, 2), "v4", None));
        source.record(Domain::Visits, NewEvent::visit(at(2024, 5, 1), "v5", None));
        source.record(Domain::Visits, NewEvent::visit(at(2020, 1, 1), "v6", None));

        source.record(
            Domain::Loans,
            NewEvent::loan(at(2026, 10, 17), "b1", Some("law"), "Dune", Some("fiction")),
        );
        source.record(
            Domain::Loans,
            NewEvent::loan(at(2026, 10, 16), "b2", Some("law"), "Dune", Some("fiction")),
        );
        source.record(
            Domain::Loans,
            NewEvent::loan(at(2026, 9, 25), "b1", None, "SICP", Some("computing")),
        );
        source
    }

    /// Delegates to a memory source but fails one ranking query
    struct FailingRanking {
        inner: MemoryDataSource,
        domain: Domain,
        dimension: Dimension,
    }

    #[async_trait]
    impl DataSource for FailingRanking {
        async fn count_between(&self, domain: Domain, range: TimeRange) -> Result<i64, SourceError> {
            self.inner.count_between(domain, range).await
        }

        async fn count_after_id(
            &self,
            domain: Domain,
            range: TimeRange,
            after_id: i64,
        ) -> Result<IdDelta, SourceError> {
            self.inner.count_after_id(domain, range, after_id).await
        }

        async fn bucket_counts(
            &self,
            domain: Domain,
            bucket: Bucket,
            range: TimeRange,
        ) -> Result<Vec<BucketCount>, SourceError> {
            self.inner.bucket_counts(domain, bucket, range).await
        }

        async fn top_n(
            &self,
            domain: Domain,
            dimension: Dimension,
            range: TimeRange,
            limit: usize,
        ) -> Result<Vec<RankEntry>, SourceError> {
            if domain == self.domain && dimension == self.dimension {
                return Err(SourceError::Unavailable("statement timeout".to_string()));
            }
            self.inner.top_n(domain, dimension, range, limit).await
        }
    }

    /// Accepts reads, rejects every write
    struct ReadOnlyCache {
        inner: MemoryCacheStore,
    }

    #[async_trait]
    impl CacheStore for ReadOnlyCache {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            self.inner.get(key).await
        }

        async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("read-only".to_string()))
        }

        async fn set_many(&self, _: Vec<CacheEntry>) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("read-only".to_string()))
        }

        async fn incr(&self, _: &str, _: i64) -> Result<i64, CacheError> {
            Err(CacheError::Unavailable("read-only".to_string()))
        }

        async fn del(&self, _: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("read-only".to_string()))
        }

        async fn purge_expired(&self) -> Result<usize, CacheError> {
            Ok(0)
        }

        fn backend_type(&self) -> &'static str {
            "read-only"
        }
    }

    async fn envelope<T: serde::de::DeserializeOwned>(cache: &MemoryCacheStore, key: &str) -> CacheEnvelope<T> {
        let raw = cache.get(key).await.unwrap().expect("key written");
        CacheEnvelope::decode(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_run_writes_every_aggregate() {
        let cache = Arc::new(MemoryCacheStore::new());
        let aggregator = BatchAggregator::new(
            Arc::new(seeded_source()),
            cache.clone(),
            fixed_clock(),
            BatchConfig::default(),
        );

        let status = aggregator.run().await.unwrap();

        // visits: 3 series + totals + 2 rankings + summary
        // loans:  3 series + totals + 3 rankings + summary
        assert_eq!(status.keys_written, 7 + 8 + 1);
        assert_eq!(cache.len(), 16);
        assert_eq!(status.domains, vec![Domain::Visits, Domain::Loans]);

        let totals: CacheEnvelope<TotalsSnapshot> = envelope(&cache, &keys::totals(Domain::Visits)).await;
        assert_eq!(totals.data, TotalsSnapshot { week: 5, month: 5, year: 6 });
        assert_eq!(totals.generated_at, now());
        assert_eq!(totals.ttl_seconds, 36 * 3600);

        let daily: CacheEnvelope<Vec<BucketCount>> =
            envelope(&cache, &keys::window(Domain::Visits, Window::Daily)).await;
        let labels: Vec<(&str, i64)> = daily.data.iter().map(|b| (b.bucket.as_str(), b.count)).collect();
        assert_eq!(labels, vec![("2026-10-15", 2), ("2026-10-18", 3)]);

        let yearly: CacheEnvelope<Vec<BucketCount>> =
            envelope(&cache, &keys::window(Domain::Visits, Window::Yearly)).await;
        let labels: Vec<(&str, i64)> = yearly.data.iter().map(|b| (b.bucket.as_str(), b.count)).collect();
        assert_eq!(labels, vec![("2024", 1), ("2026", 6)]);

        let titles: CacheEnvelope<Vec<RankEntry>> = envelope(&cache, &keys::top(Domain::Loans, Dimension::Title)).await;
        assert_eq!(titles.data[0], RankEntry { key: "Dune".to_string(), count: 2 });

        let summary: CacheEnvelope<DomainSummary> = envelope(&cache, &keys::summary(Domain::Loans)).await;
        assert_eq!(summary.data.totals, TotalsSnapshot { week: 2, month: 2, year: 3 });
        assert_eq!(summary.data.top.len(), 3);

        let stored: CacheEnvelope<BatchStatus> = envelope(&cache, keys::BATCH_STATUS).await;
        assert_eq!(stored.data, status);
    }

    #[tokio::test]
    async fn test_partial_failure_writes_nothing() {
        let cache = Arc::new(MemoryCacheStore::new());
        let previous = CacheEnvelope::new(TotalsSnapshot { week: 1, month: 1, year: 1 }, at(2026, 10, 17), 129600);
        cache
            .set(&keys::totals(Domain::Visits), &previous.encode().unwrap(), None)
            .await
            .unwrap();

        let source = FailingRanking {
            inner: seeded_source(),
            domain: Domain::Loans,
            dimension: Dimension::Category,
        };
        let aggregator = BatchAggregator::new(Arc::new(source), cache.clone(), fixed_clock(), BatchConfig::default());

        let result = aggregator.run().await;
        assert!(matches!(result, Err(BatchError::Source(_))));

        assert_eq!(cache.len(), 1);
        let kept: CacheEnvelope<TotalsSnapshot> = envelope(&cache, &keys::totals(Domain::Visits)).await;
        assert_eq!(kept, previous);
        assert_eq!(cache.get(keys::BATCH_STATUS).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let cache = Arc::new(ReadOnlyCache {
            inner: MemoryCacheStore::new(),
        });
        let aggregator = BatchAggregator::new(Arc::new(seeded_source()), cache.clone(), fixed_clock(), BatchConfig::default());

        assert!(matches!(aggregator.run().await, Err(BatchError::Cache(_))));
        assert!(cache.inner.is_empty());
    }

    #[tokio::test]
    async fn test_empty_source_still_publishes() {
        let cache = Arc::new(MemoryCacheStore::new());
        let aggregator = BatchAggregator::new(
            Arc::new(MemoryDataSource::utc()),
            cache.clone(),
            fixed_clock(),
            BatchConfig { ttl: Duration::from_secs(90_000), top_n: 3 },
        );

        aggregator.run().await.unwrap();

        let totals: CacheEnvelope<TotalsSnapshot> = envelope(&cache, &keys::totals(Domain::Loans)).await;
        assert_eq!(totals.data, TotalsSnapshot { week: 0, month: 0, year: 0 });
        assert_eq!(totals.ttl_seconds, 90_000);
        let ranking: CacheEnvelope<Vec<RankEntry>> = envelope(&cache, &keys::top(Domain::Visits, Dimension::Visitor)).await;
        assert!(ranking.data.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_ttl_does_not_abort_run() {
        let cache = Arc::new(MemoryCacheStore::new());
        let aggregator = BatchAggregator::new(
            Arc::new(seeded_source()),
            cache.clone(),
            fixed_clock(),
            BatchConfig { ttl: Duration::from_secs(u64::MAX), top_n: 3 },
        );

        let handle = tokio::spawn(async move { aggregator.run().await });
        let status = handle.await.expect("batch task panicked").unwrap();

        assert_eq!(status.keys_written, cache.len());
        let totals: CacheEnvelope<TotalsSnapshot> = envelope(&cache, &keys::totals(Domain::Visits)).await;
        assert_eq!(totals.ttl_seconds, u64::MAX);
    }
}
