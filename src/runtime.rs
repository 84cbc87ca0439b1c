//! Runtime wiring - builds every component from a `ServiceConfig`
//!
//! ```text
//! DataSource ──► LiveCounter ──► PollLoop ──► CacheStore ◄── BatchAggregator ◄── BatchScheduler
//!                                   │              │
//!                                   ▼              ▼
//!                            EventBroadcaster   ReadGateway
//!                                   │              │
//!                                   └──► LiveStream ◄┘
//! ```

use crate::batch::{parse_schedule, BatchAggregator, BatchScheduler};
use crate::broadcast::{EventBroadcaster, LiveBroadcaster};
use crate::cache::{CacheStore, MemoryCacheStore, SqliteCacheStore};
use crate::config::{ConfigError, ServiceConfig};
use crate::gateway::ReadGateway;
use crate::live::{LiveCounter, PeriodClock, LIVE_DOMAIN};
use crate::poll_loop::PollLoop;
use crate::source::sqlite::run_schema_migrations;
use crate::source::{DataSource, Domain, SqliteDataSource};
use crate::stream::LiveStream;
use rusqlite::Connection;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Backlog per stream subscriber before it starts skipping updates
pub const STREAM_BACKLOG: usize = 64;

/// Connections serving the batch fan-out
pub const BATCH_POOL_SIZE: usize = 4;

pub struct Runtime {
    config: ServiceConfig,
    cache: Arc<dyn CacheStore>,
    broadcaster: Arc<LiveBroadcaster>,
    poll_loop: Arc<PollLoop>,
    gateway: Arc<ReadGateway>,
    scheduler: Arc<BatchScheduler>,
}

impl Runtime {
    /// Wire components over an existing source and cache
    pub fn build(
        config: ServiceConfig,
        source: Arc<dyn DataSource>,
        cache: Arc<dyn CacheStore>,
    ) -> Result<Self, ConfigError> {
        Self::build_with_sources(config, Arc::clone(&source), source, cache)
    }

    /// Wire components with the live path and the batch aggregator on
    /// separate sources, so a long batch never queues live queries
    pub fn build_with_sources(
        config: ServiceConfig,
        live_source: Arc<dyn DataSource>,
        batch_source: Arc<dyn DataSource>,
        cache: Arc<dyn CacheStore>,
    ) -> Result<Self, ConfigError> {
        let source = live_source;
        let clock = PeriodClock::new(config.timezone_offset);
        let broadcaster = EventBroadcaster::new(STREAM_BACKLOG);

        let counter = LiveCounter::build(
            config.strategy,
            Arc::clone(&source),
            Arc::clone(&cache),
            clock.clone(),
            config.reconcile_interval,
        );
        let poll_loop = Arc::new(PollLoop::new(
            config.poll.clone(),
            counter,
            Arc::clone(&cache),
            Arc::clone(&broadcaster),
        ));

        let gateway = Arc::new(ReadGateway::new(
            Arc::clone(&cache),
            Arc::clone(&source),
            clock.clone(),
            config.gateway.clone(),
        ));

        let schedule = parse_schedule(&config.batch_schedule)
            .map_err(|e| ConfigError::InvalidValue(format!("BATCH_SCHEDULE: {}", e)))?;
        let aggregator = Arc::new(BatchAggregator::new(
            batch_source,
            Arc::clone(&cache),
            clock,
            config.batch.clone(),
        ));
        let scheduler = Arc::new(BatchScheduler::new(
            aggregator,
            Arc::clone(&cache),
            schedule,
            config.timezone_offset,
            config.batch_prewarm,
        ));

        Ok(Self {
            config,
            cache,
            broadcaster,
            poll_loop,
            gateway,
            scheduler,
        })
    }

    /// Open the SQLite event store (running schema files) and the configured cache
    pub fn open(config: ServiceConfig) -> Result<Self, Box<dyn std::error::Error>> {
        log::info!("🔧 Initializing event store...");
        let mut conn = Connection::open(&config.db_path)?;
        run_schema_migrations(&mut conn, &config.schema_dir)?;
        drop(conn);

        let live_source: Arc<dyn DataSource> =
            Arc::new(SqliteDataSource::open(&config.db_path, config.timezone_offset)?);
        let batch_source: Arc<dyn DataSource> = Arc::new(SqliteDataSource::open_pooled(
            &config.db_path,
            config.timezone_offset,
            BATCH_POOL_SIZE,
        )?);

        let cache: Arc<dyn CacheStore> = match &config.cache_path {
            Some(path) => Arc::new(SqliteCacheStore::open(path)?),
            None => Arc::new(MemoryCacheStore::new()),
        };
        log::info!("✅ Event store ready, cache backend: {}", cache.backend_type());

        Ok(Self::build_with_sources(config, live_source, batch_source, cache)?)
    }

    /// Start the poll loop and the batch scheduler
    ///
    /// Both starts are guarded; later calls return `None` and spawn nothing.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        self.poll_loop.start();
        self.scheduler.start()
    }

    /// Write-path hook: call after each event is persisted
    pub async fn on_event_recorded(&self, domain: Domain) {
        if domain != LIVE_DOMAIN {
            return;
        }
        if let Err(e) = self.poll_loop.counter().increment(1).await {
            log::warn!("⚠️  Live counter hook failed: {}", e);
        }
    }

    /// A new streaming session for one client
    pub async fn open_stream(&self) -> LiveStream {
        LiveStream::open(&self.gateway, &self.broadcaster, self.config.stream_heartbeat).await
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub fn broadcaster(&self) -> &Arc<LiveBroadcaster> {
        &self.broadcaster
    }

    pub fn poll_loop(&self) -> &Arc<PollLoop> {
        &self.poll_loop
    }

    pub fn gateway(&self) -> &Arc<ReadGateway> {
        &self.gateway
    }

    pub fn scheduler(&self) -> &Arc<BatchScheduler> {
        &self.scheduler
    }
}
