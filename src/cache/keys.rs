//! Logical cache key namespace
//!
//! One key per aggregate kind. The live key holds a bare integer string;
//! every other non-state key holds a `CacheEnvelope`.

use crate::source::{Dimension, Domain};

/// Live visit count for the current period (bare integer)
pub const LIVE_COUNT: &str = "live:visits:today";

/// Incremental strategy: JSON `{base, last_reconciled_at, period}`
pub const INCREMENTAL_STATE: &str = "live:incremental:state";

/// Incremental strategy: integer delta, bumped by the write-path hook
pub const INCREMENTAL_DELTA: &str = "live:incremental:delta";

/// Delta strategy: JSON `{base_count, base_max_id, initialized_for}`
pub const DELTA_STATE: &str = "live:delta:state";

/// Outcome of the last successful batch run
pub const BATCH_STATUS: &str = "batch:status";

/// Rolling-window aggregate kinds stored per domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Window {
    Daily,
    Monthly,
    Yearly,
}

impl Window {
    pub const ALL: [Window; 3] = [Window::Daily, Window::Monthly, Window::Yearly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Daily => "daily",
            Window::Monthly => "monthly",
            Window::Yearly => "yearly",
        }
    }
}

pub fn window(domain: Domain, window: Window) -> String {
    format!("{}:{}", domain.as_str(), window.as_str())
}

pub fn totals(domain: Domain) -> String {
    format!("{}:totals", domain.as_str())
}

pub fn top(domain: Domain, dimension: Dimension) -> String {
    format!("{}:top:{}", domain.as_str(), dimension.as_str())
}

pub fn summary(domain: Domain) -> String {
    format!("{}:summary", domain.as_str())
}
