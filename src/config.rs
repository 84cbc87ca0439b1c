//! Service configuration from environment variables
//!
//! | Variable | Default |
//! |---|---|
//! | `LIVE_COUNTER_STRATEGY` | `direct` |
//! | `LIVE_POLL_INTERVAL_MS` | `1000` |
//! | `LIVE_POLL_BUFFER_MS` | `250` |
//! | `LIVE_ADAPTIVE_ENABLED` | `false` |
//! | `LIVE_ADAPTIVE_MULTIPLIER` | `20` |
//! | `LIVE_ADAPTIVE_HARD_FLOOR_MS` | `200` |
//! | `LIVE_ADAPTIVE_SOFT_FLOOR_MS` | `400` |
//! | `LIVE_ADAPTIVE_MIN_SAMPLES` | `3` |
//! | `LIVE_FALLBACK_TTL_SECS` | `5` |
//! | `INCREMENTAL_RECONCILE_INTERVAL_MS` | `60000` |
//! | `BATCH_SCHEDULE` | `0 0 2 * * *` |
//! | `BATCH_TTL_SECS` | `129600` |
//! | `BATCH_PREWARM` | `true` |
//! | `BATCH_TOP_N` | `10` |
//! | `TIMEZONE_OFFSET_MINUTES` | `0` |
//! | `STREAM_HEARTBEAT_SECS` | `15` |
//! | `WARMING_RETRY_AFTER_SECS` | `30` |
//! | `SHELFCOUNT_DB_PATH` | `shelfcount.db` |
//! | `SHELFCOUNT_CACHE_PATH` | unset (in-memory cache) |
//! | `SHELFCOUNT_SCHEMA_DIR` | `sql` |
//!
//! Unparseable numbers fall back to their default with a warning, and any
//! duration above ten years is capped there. An unknown strategy, a bad cron
//! expression or an impossible offset are errors. `BATCH_SCHEDULE` is read
//! in the `TIMEZONE_OFFSET_MINUTES` local time.

use crate::batch::{parse_schedule, schedule_period, BatchConfig};
use crate::gateway::GatewayConfig;
use crate::live::LiveStrategyKind;
use crate::poll_loop::{AdaptiveConfig, PollConfig};
use chrono::{FixedOffset, Utc};
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub strategy: LiveStrategyKind,
    pub poll: PollConfig,
    pub reconcile_interval: Duration,
    pub gateway: GatewayConfig,
    pub batch_schedule: String,
    pub batch: BatchConfig,
    pub batch_prewarm: bool,
    pub timezone_offset: FixedOffset,
    pub stream_heartbeat: Duration,
    pub db_path: String,
    /// `None` keeps the cache in process memory
    pub cache_path: Option<String>,
    pub schema_dir: String,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any variable lookup (environment, map in tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let strategy = match vars.get("LIVE_COUNTER_STRATEGY") {
            Some(raw) => LiveStrategyKind::from_str(&raw).map_err(ConfigError::InvalidValue)?,
            None => LiveStrategyKind::Direct,
        };

        let min_interval = vars.millis("LIVE_POLL_INTERVAL_MS", 1000);
        if min_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "LIVE_POLL_INTERVAL_MS must be greater than 0".to_string(),
            ));
        }

        let mut adaptive = AdaptiveConfig {
            enabled: vars.parse("LIVE_ADAPTIVE_ENABLED", false),
            multiplier: vars.parse("LIVE_ADAPTIVE_MULTIPLIER", 20u32).max(1),
            hard_floor: vars.millis("LIVE_ADAPTIVE_HARD_FLOOR_MS", 200),
            soft_floor: vars.millis("LIVE_ADAPTIVE_SOFT_FLOOR_MS", 400),
            min_samples: vars.parse("LIVE_ADAPTIVE_MIN_SAMPLES", 3u64),
        };
        if adaptive.hard_floor > min_interval {
            log::warn!(
                "⚠️  LIVE_ADAPTIVE_HARD_FLOOR_MS ({}ms) exceeds LIVE_POLL_INTERVAL_MS, using {}ms",
                adaptive.hard_floor.as_millis(),
                min_interval.as_millis()
            );
            adaptive.hard_floor = min_interval;
        }

        let poll = PollConfig {
            min_interval,
            buffer: vars.millis("LIVE_POLL_BUFFER_MS", 250),
            adaptive,
        };

        let gateway = GatewayConfig {
            live_fallback_ttl: vars.secs("LIVE_FALLBACK_TTL_SECS", 5).max(Duration::from_secs(1)),
            retry_after: vars.secs("WARMING_RETRY_AFTER_SECS", 30).max(Duration::from_secs(1)),
        };

        let batch_schedule = vars
            .get("BATCH_SCHEDULE")
            .unwrap_or_else(|| "0 0 2 * * *".to_string());
        let schedule = parse_schedule(&batch_schedule)
            .map_err(|e| ConfigError::InvalidValue(format!("BATCH_SCHEDULE '{}': {}", batch_schedule, e)))?;

        let mut batch = BatchConfig {
            ttl: vars.secs("BATCH_TTL_SECS", 129_600),
            top_n: vars.parse("BATCH_TOP_N", 10usize).max(1),
        };
        if let Some(period) = schedule_period(&schedule, Utc::now()) {
            let floor = min_batch_ttl(period);
            if batch.ttl < floor {
                log::warn!(
                    "⚠️  BATCH_TTL_SECS ({}s) does not outlast the schedule period ({}s), raising to {}s",
                    batch.ttl.as_secs(),
                    period.as_secs(),
                    floor.as_secs()
                );
                batch.ttl = floor;
            }
        }

        let offset_minutes: i32 = vars.parse("TIMEZONE_OFFSET_MINUTES", 0);
        let timezone_offset = FixedOffset::east_opt(offset_minutes.saturating_mul(60)).ok_or_else(|| {
            ConfigError::InvalidValue(format!(
                "TIMEZONE_OFFSET_MINUTES must be within ±1439, got {}",
                offset_minutes
            ))
        })?;

        Ok(Self {
            strategy,
            poll,
            reconcile_interval: vars
                .millis("INCREMENTAL_RECONCILE_INTERVAL_MS", 60_000)
                .max(Duration::from_millis(1)),
            gateway,
            batch_schedule,
            batch,
            batch_prewarm: vars.parse("BATCH_PREWARM", true),
            timezone_offset,
            stream_heartbeat: vars.secs("STREAM_HEARTBEAT_SECS", 15).max(Duration::from_secs(1)),
            db_path: vars
                .get("SHELFCOUNT_DB_PATH")
                .unwrap_or_else(|| "shelfcount.db".to_string()),
            cache_path: vars.get("SHELFCOUNT_CACHE_PATH"),
            schema_dir: vars
                .get("SHELFCOUNT_SCHEMA_DIR")
                .unwrap_or_else(|| "sql".to_string()),
        })
    }
}

/// Longest accepted duration for any setting
pub const MAX_DURATION: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

/// Shortest envelope TTL for a schedule period: the period plus half again
pub fn min_batch_ttl(period: Duration) -> Duration {
    period.saturating_add(period / 2).min(MAX_DURATION)
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty, trimmed value
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn secs(&self, name: &str, default: u64) -> Duration {
        self.capped(name, Duration::from_secs(self.parse(name, default)))
    }

    fn millis(&self, name: &str, default: u64) -> Duration {
        self.capped(name, Duration::from_millis(self.parse(name, default)))
    }

    fn capped(&self, name: &str, value: Duration) -> Duration {
        if value > MAX_DURATION {
            log::warn!(
                "⚠️  {} exceeds {}s, capping",
                name,
                MAX_DURATION.as_secs()
            );
            return MAX_DURATION;
        }
        value
    }

    fn parse<T>(&self, name: &str, default: T) -> T
    where
        T: FromStr + std::fmt::Display,
    {
        match self.get(name) {
            Some(raw) => raw.to_lowercase().parse().unwrap_or_else(|_| {
                log::warn!("⚠️  Invalid {} '{}', defaulting to {}", name, raw, default);
                default
            }),
            None => default,
        }
    }
}
