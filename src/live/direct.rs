use super::{CounterError, PeriodClock, LIVE_DOMAIN};
use crate::source::DataSource;
use std::sync::Arc;

/// Full count over today's bounds on every evaluation
pub struct DirectCounter {
    source: Arc<dyn DataSource>,
    clock: PeriodClock,
}

impl DirectCounter {
    pub fn new(source: Arc<dyn DataSource>, clock: PeriodClock) -> Self {
        Self { source, clock }
    }

    pub async fn evaluate(&self) -> Result<i64, CounterError> {
        let period = self.clock.today();
        let count = self.source.count_between(LIVE_DOMAIN, period.range).await?;
        Ok(count)
    }
}
