//! shelfcount runtime - live poll loop + batch scheduler
//!
//! Opens the SQLite event store, wires every component and keeps the cache
//! warm until CTRL+C. Request handlers embed the library and read through
//! `Runtime::gateway()` / `Runtime::open_stream()`.
//!
//! Usage:
//!   cargo run --release --bin shelfcount_runtime
//!
//! Environment variables: see `shelfcount::config` (loaded from `.env` too).

use dotenv::dotenv;
use log::{error, info};
use shelfcount::config::ServiceConfig;
use shelfcount::Runtime;
use std::time::Duration;

/// How often the loop status is logged
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 shelfcount runtime");

    let config = ServiceConfig::from_env()?;

    info!("✅ Configuration loaded");
    info!("   ├─ Event store: {}", config.db_path);
    info!(
        "   ├─ Cache: {}",
        config.cache_path.as_deref().unwrap_or("in-memory")
    );
    info!("   ├─ Live strategy: {}", config.strategy.as_str());
    info!("   ├─ Poll interval: {}ms (+{}ms buffer)", config.poll.min_interval.as_millis(), config.poll.buffer.as_millis());
    info!("   ├─ Batch schedule: {} (ttl {}s, prewarm {})", config.batch_schedule, config.batch.ttl.as_secs(), config.batch_prewarm);
    info!("   └─ Timezone offset: {}", config.timezone_offset);

    let runtime = Runtime::open(config)?;
    let scheduler_task = runtime.start();

    let poll_loop = runtime.poll_loop().clone();
    let status_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATUS_LOG_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let status = poll_loop.status();
            info!("📊 Live loop status");
            info!("   ├─ Phase: {:?}", status.phase);
            info!("   ├─ Runs: {}", status.run_count);
            info!(
                "   ├─ Avg duration: {}",
                status
                    .average_duration
                    .map(|d| format!("{:.1}ms", d.as_secs_f64() * 1000.0))
                    .unwrap_or_else(|| "n/a".to_string())
            );
            info!("   ├─ Effective interval: {}ms", status.effective_interval.as_millis());
            info!(
                "   └─ Last total: {}",
                status.last_total.map(|t| t.to_string()).unwrap_or_else(|| "n/a".to_string())
            );
        }
    });

    info!("🔄 Press CTRL+C to shutdown");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    status_task.abort();
    if let Some(task) = scheduler_task {
        task.abort();
    }

    info!("✅ shelfcount runtime stopped");
    Ok(())
}
