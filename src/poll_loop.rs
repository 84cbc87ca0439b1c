//! Adaptive poll loop - keeps the live count fresh
//!
//! One task drives the Live Counter forever. Each cycle either runs (when
//! enough time has passed since the last run started) or defers for the
//! remaining wait. After a run the result is cached under
//! `keys::LIVE_COUNT` and published on [`LIVE_TOPIC`], then the loop sleeps
//! for the fixed buffer delay. Failures are logged and the next cycle
//! simply tries again.
//!
//! With adaptive pacing on, the minimum interval follows an exponential
//! moving average of evaluation cost:
//!
//! ```text
//! dynamic   = average_duration * multiplier
//! effective = max(hard_floor, min(configured_min, max(dynamic, soft_floor)))
//! ```

use crate::broadcast::{LiveBroadcaster, LiveUpdate, LIVE_TOPIC};
use crate::cache::{keys, CacheStore};
use crate::live::{LiveCounter, LiveStrategyKind};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Weight kept from the previous average on each sample
const EMA_KEEP: f64 = 0.85;
const EMA_NEW: f64 = 0.15;

/// Lower bound on the live key's cache TTL
pub const MIN_LIVE_TTL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveConfig {
    pub enabled: bool,
    pub multiplier: u32,
    pub hard_floor: Duration,
    pub soft_floor: Duration,
    /// Runs needed before the average is trusted
    pub min_samples: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            multiplier: 20,
            hard_floor: Duration::from_millis(200),
            soft_floor: Duration::from_millis(400),
            min_samples: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    pub min_interval: Duration,
    pub buffer: Duration,
    pub adaptive: AdaptiveConfig,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(1000),
            buffer: Duration::from_millis(250),
            adaptive: AdaptiveConfig::default(),
        }
    }
}

/// Process-local pacing state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopRuntimeState {
    pub last_start: Option<Instant>,
    pub average_duration: Option<Duration>,
    pub run_count: u64,
}

impl LoopRuntimeState {
    /// Fold one evaluation time into the moving average
    pub fn record_sample(&mut self, elapsed: Duration) {
        self.average_duration = Some(match self.average_duration {
            None => elapsed,
            Some(avg) => avg.mul_f64(EMA_KEEP) + elapsed.mul_f64(EMA_NEW),
        });
        self.run_count += 1;
    }
}

/// Minimum spacing between two run starts
pub fn effective_min_interval(config: &PollConfig, state: &LoopRuntimeState) -> Duration {
    let adaptive = &config.adaptive;
    if !adaptive.enabled || state.run_count < adaptive.min_samples {
        return config.min_interval;
    }
    let Some(average) = state.average_duration else {
        return config.min_interval;
    };

    let dynamic = average.saturating_mul(adaptive.multiplier);
    let ceiling = config.min_interval.min(dynamic.max(adaptive.soft_floor));
    ceiling.max(adaptive.hard_floor)
}

/// Cache TTL for a live value produced at `interval` pacing
///
/// Two full cycles (interval + buffer), rounded up to whole seconds, so one
/// missed cycle does not expire the key.
pub fn live_ttl(interval: Duration, buffer: Duration) -> Duration {
    let cycle = interval.saturating_add(buffer).saturating_mul(2);
    let secs = cycle.as_secs().saturating_add(u64::from(cycle.subsec_nanos() > 0));
    Duration::from_secs(secs).max(MIN_LIVE_TTL)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    NotStarted,
    Idle,
    Running,
    Scheduled { wait: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Too soon after the previous start
    Deferred { wait: Duration },
    Published { total: i64, ttl: Duration, interval: Duration },
    Failed,
}

/// Diagnostics snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct LoopStatus {
    pub strategy: LiveStrategyKind,
    pub phase: LoopPhase,
    pub run_count: u64,
    pub average_duration: Option<Duration>,
    pub effective_interval: Duration,
    pub last_total: Option<i64>,
}

struct LoopInner {
    phase: LoopPhase,
    runtime: LoopRuntimeState,
    last_total: Option<i64>,
}

pub struct PollLoop {
    config: PollConfig,
    counter: LiveCounter,
    cache: Arc<dyn CacheStore>,
    broadcaster: Arc<LiveBroadcaster>,
    inner: Mutex<LoopInner>,
}

impl PollLoop {
    pub fn new(
        config: PollConfig,
        counter: LiveCounter,
        cache: Arc<dyn CacheStore>,
        broadcaster: Arc<LiveBroadcaster>,
    ) -> Self {
        Self {
            config,
            counter,
            cache,
            broadcaster,
            inner: Mutex::new(LoopInner {
                phase: LoopPhase::NotStarted,
                runtime: LoopRuntimeState::default(),
                last_total: None,
            }),
        }
    }

    pub fn counter(&self) -> &LiveCounter {
        &self.counter
    }

    /// Spawn the driver task; returns false if it is already running
    pub fn start(self: &Arc<Self>) -> bool {
        {
            let mut inner = self.lock();
            if inner.phase != LoopPhase::NotStarted {
                log::debug!("🔁 Poll loop already started, ignoring start()");
                return false;
            }
            inner.phase = LoopPhase::Idle;
        }

        log::info!("🔁 Starting live poll loop");
        log::info!("   ├─ Strategy: {}", self.counter.kind().as_str());
        log::info!("   ├─ Min interval: {}ms", self.config.min_interval.as_millis());
        log::info!("   ├─ Buffer: {}ms", self.config.buffer.as_millis());
        log::info!(
            "   └─ Adaptive: {}",
            if self.config.adaptive.enabled { "enabled" } else { "disabled" }
        );

        let this = Arc::clone(self);
        tokio::spawn(async move { this.drive().await });
        true
    }

    pub fn status(&self) -> LoopStatus {
        let inner = self.lock();
        LoopStatus {
            strategy: self.counter.kind(),
            phase: inner.phase,
            run_count: inner.runtime.run_count,
            average_duration: inner.runtime.average_duration,
            effective_interval: effective_min_interval(&self.config, &inner.runtime),
            last_total: inner.last_total,
        }
    }

    async fn drive(&self) {
        loop {
            let wait = match self.run_cycle().await {
                CycleOutcome::Deferred { wait } => wait,
                CycleOutcome::Published { .. } | CycleOutcome::Failed => self.config.buffer,
            };
            self.set_phase(LoopPhase::Scheduled { wait });
            tokio::time::sleep(wait).await;
            self.set_phase(LoopPhase::Idle);
        }
    }

    /// One pacing check plus (maybe) one evaluation
    pub async fn run_cycle(&self) -> CycleOutcome {
        let started = Instant::now();
        let interval = {
            let mut inner = self.lock();
            let interval = effective_min_interval(&self.config, &inner.runtime);
            if let Some(last) = inner.runtime.last_start {
                let since = started.duration_since(last);
                if since < interval {
                    return CycleOutcome::Deferred { wait: interval - since };
                }
            }
            inner.runtime.last_start = Some(started);
            if inner.phase != LoopPhase::NotStarted {
                inner.phase = LoopPhase::Running;
            }
            interval
        };

        let result = self.counter.evaluate().await;
        let elapsed = started.elapsed();
        self.lock().runtime.record_sample(elapsed);

        let total = match result {
            Ok(total) => total,
            Err(e) => {
                log::warn!("⚠️  Live count evaluation failed: {}", e);
                return CycleOutcome::Failed;
            }
        };

        let ttl = live_ttl(interval, self.config.buffer);
        if let Err(e) = self.cache.set(keys::LIVE_COUNT, &total.to_string(), Some(ttl)).await {
            log::warn!("⚠️  Failed to cache live count: {}", e);
        }

        let reached = self.broadcaster.publish(
            LIVE_TOPIC,
            LiveUpdate {
                total,
                generated_at: Utc::now(),
            },
        );
        self.lock().last_total = Some(total);

        log::debug!(
            "📡 Live count {} ({}ms, ttl {}s, {} subscribers)",
            total,
            elapsed.as_millis(),
            ttl.as_secs(),
            reached
        );

        CycleOutcome::Published { total, ttl, interval }
    }

    fn set_phase(&self, phase: LoopPhase) {
        self.lock().phase = phase;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoopInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}
