//! Cron cadence for the batch aggregator
//!
//! Runs once at startup when prewarm is on, then at every occurrence of the
//! cron expression, read in the service's local offset. Each run ends with a
//! cache housekeeping pass that drops expired entries.

use super::{BatchAggregator, BatchStatus};
use crate::cache::CacheStore;
use chrono::{DateTime, FixedOffset, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Parse a 6/7-field cron expression (seconds first)
pub fn parse_schedule(expr: &str) -> Result<Schedule, cron::error::Error> {
    Schedule::from_str(expr.trim())
}

/// Gap between the first two occurrences after `from`
pub fn schedule_period(schedule: &Schedule, from: DateTime<Utc>) -> Option<Duration> {
    let mut upcoming = schedule.after(&from);
    let first = upcoming.next()?;
    let second = upcoming.next()?;
    (second - first).to_std().ok()
}

pub struct BatchScheduler {
    aggregator: Arc<BatchAggregator>,
    cache: Arc<dyn CacheStore>,
    schedule: Schedule,
    /// Offset the cron fields are read in
    offset: FixedOffset,
    prewarm: bool,
    started: AtomicBool,
}

impl BatchScheduler {
    pub fn new(
        aggregator: Arc<BatchAggregator>,
        cache: Arc<dyn CacheStore>,
        schedule: Schedule,
        offset: FixedOffset,
        prewarm: bool,
    ) -> Self {
        Self {
            aggregator,
            cache,
            schedule,
            offset,
            prewarm,
            started: AtomicBool::new(false),
        }
    }

    pub fn next_run(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.offset))
            .next()
            .map(|at| at.with_timezone(&Utc))
    }

    /// Spawn the scheduler task; `None` if it was already started
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("⏰ Batch scheduler already started, ignoring start()");
            return None;
        }

        let this = Arc::clone(self);
        Some(tokio::spawn(async move { this.run().await }))
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    async fn run(&self) {
        log::info!("⏰ Batch scheduler started ({})", self.schedule);

        if self.prewarm {
            self.run_once("prewarm").await;
        }

        loop {
            let now = Utc::now();
            let Some(next) = self.next_run(now) else {
                log::warn!("⚠️  Batch schedule has no upcoming runs, scheduler stopping");
                return;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            log::debug!("⏰ Next batch run at {} (in {}s)", next, wait.as_secs());

            tokio::time::sleep(wait).await;
            self.run_once("scheduled").await;
        }
    }

    /// One aggregator run plus housekeeping; failures are logged only
    pub async fn run_once(&self, trigger: &str) -> Option<BatchStatus> {
        log::info!("📦 Starting {} batch run", trigger);

        let status = match self.aggregator.run().await {
            Ok(status) => Some(status),
            Err(e) => {
                log::error!("❌ {} batch run failed, keeping previous aggregates: {}", trigger, e);
                None
            }
        };

        match self.cache.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => log::debug!("🧹 Purged {} expired cache entries", purged),
            Err(e) => log::warn!("⚠️  Cache housekeeping failed: {}", e),
        }

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchConfig;
    use crate::cache::{keys, MemoryCacheStore};
    use crate::live::PeriodClock;
    use crate::source::MemoryDataSource;
    use chrono::TimeZone;

    fn scheduler(source: Arc<MemoryDataSource>, cache: Arc<MemoryCacheStore>, offset_hours: i32) -> Arc<BatchScheduler> {
        let aggregator = Arc::new(BatchAggregator::new(
            source,
            cache.clone(),
            PeriodClock::utc(),
            BatchConfig::default(),
        ));
        Arc::new(BatchScheduler::new(
            aggregator,
            cache,
            parse_schedule("0 0 2 * * *").unwrap(),
            FixedOffset::east_opt(offset_hours * 3600).unwrap(),
            true,
        ))
    }

    #[test]
    fn test_daily_schedule() {
        let schedule = parse_schedule("0 0 2 * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2026, 10, 18, 3, 0, 0).unwrap();

        assert_eq!(
            schedule.after(&from).next(),
            Some(Utc.with_ymd_and_hms(2026, 10, 19, 2, 0, 0).unwrap())
        );
        assert_eq!(schedule_period(&schedule, from), Some(Duration::from_secs(24 * 3600)));
    }

    #[test]
    fn test_invalid_expression() {
        assert!(parse_schedule("every night").is_err());
    }

    #[test]
    fn test_next_run_follows_local_offset() {
        let source = Arc::new(MemoryDataSource::utc());
        let cache = Arc::new(MemoryCacheStore::new());
        let from = Utc.with_ymd_and_hms(2026, 10, 18, 3, 0, 0).unwrap();

        // 02:00 at +2 is 00:00 UTC
        assert_eq!(
            scheduler(source.clone(), cache.clone(), 2).next_run(from),
            Some(Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).unwrap())
        );
        // 02:00 at -5 is 07:00 UTC, still ahead today
        assert_eq!(
            scheduler(source, cache, -5).next_run(from),
            Some(Utc.with_ymd_and_hms(2026, 10, 18, 7, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_start_runs_prewarm_once() {
        let source = Arc::new(MemoryDataSource::utc());
        let cache = Arc::new(MemoryCacheStore::new());
        let scheduler = scheduler(source.clone(), cache, 0);

        let task = scheduler.start();
        assert!(task.is_some());
        assert!(scheduler.is_started());
        tokio::time::sleep(Duration::from_millis(150)).await;
        let after_first = source.queries_served();
        assert!(after_first > 0);

        assert!(scheduler.start().is_none());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(source.queries_served(), after_first);

        if let Some(task) = task {
            task.abort();
        }
    }

    #[tokio::test]
    async fn test_run_once_publishes_and_purges() {
        let cache = Arc::new(MemoryCacheStore::new());
        cache
            .set("stale", "x", Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let aggregator = Arc::new(BatchAggregator::new(
            Arc::new(MemoryDataSource::utc()),
            cache.clone(),
            PeriodClock::utc(),
            BatchConfig::default(),
        ));
        let scheduler = BatchScheduler::new(
            aggregator,
            cache.clone(),
            parse_schedule("0 0 2 * * *").unwrap(),
            FixedOffset::east_opt(0).unwrap(),
            true,
        );

        let status = scheduler.run_once("manual").await.unwrap();
        assert_eq!(status.keys_written, cache.len());
        assert!(cache.get(keys::BATCH_STATUS).await.unwrap().is_some());
        assert_eq!(cache.get("stale").await.unwrap(), None);
    }
}
