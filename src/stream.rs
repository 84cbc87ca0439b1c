//! Live stream session - server-sent events for one subscriber
//!
//! Frames, in order:
//!
//! ```text
//! event: init
//! data: {"total":42,"source":"cache"}
//!
//! event: update
//! data: {"total":43,"generated_at":"2026-10-18T09:00:01Z"}
//!
//! : heartbeat
//! ```
//!
//! The session owns both its subscription and its heartbeat timer. Dropping
//! it (client disconnect) releases both immediately.

use crate::broadcast::{LiveBroadcaster, LiveUpdate, Subscription, LIVE_TOPIC};
use crate::gateway::{LiveRead, ReadGateway, ReadOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

pub const HEARTBEAT_COMMENT: &str = "heartbeat";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Event { name: &'static str, data: String },
    Comment(&'static str),
}

impl SseFrame {
    pub fn init(read: &LiveRead) -> Result<Self, serde_json::Error> {
        Ok(SseFrame::Event {
            name: "init",
            data: serde_json::to_string(read)?,
        })
    }

    pub fn update(update: &LiveUpdate) -> Result<Self, serde_json::Error> {
        Ok(SseFrame::Event {
            name: "update",
            data: serde_json::to_string(update)?,
        })
    }

    pub fn heartbeat() -> Self {
        SseFrame::Comment(HEARTBEAT_COMMENT)
    }

    /// Text as written to the response body
    pub fn to_wire(&self) -> String {
        match self {
            SseFrame::Event { name, data } => format!("event: {}\ndata: {}\n\n", name, data),
            SseFrame::Comment(text) => format!(": {}\n\n", text),
        }
    }
}

pub struct LiveStream {
    pending_init: Option<SseFrame>,
    subscription: Subscription<LiveUpdate>,
    heartbeat: Interval,
}

impl LiveStream {
    /// Subscribe, then read the current value for the `init` frame
    ///
    /// Subscribing first means no update published in between is lost. When
    /// no current value can be produced the stream starts with updates.
    pub async fn open(gateway: &ReadGateway, broadcaster: &Arc<LiveBroadcaster>, heartbeat: Duration) -> Self {
        let subscription = broadcaster.subscribe(LIVE_TOPIC);

        let pending_init = match gateway.live_count().await {
            ReadOutcome::Fresh(read) => match SseFrame::init(&read) {
                Ok(frame) => Some(frame),
                Err(e) => {
                    log::warn!("⚠️  Failed to encode init frame: {}", e);
                    None
                }
            },
            ReadOutcome::Warming(_) => {
                log::debug!("🌡️  Live count warming, stream opens without init");
                None
            }
        };

        let period = heartbeat.max(Duration::from_millis(1));
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            pending_init,
            subscription,
            heartbeat,
        }
    }

    /// Next frame to send; `None` ends the stream
    pub async fn next_frame(&mut self) -> Option<SseFrame> {
        if let Some(init) = self.pending_init.take() {
            return Some(init);
        }

        loop {
            tokio::select! {
                update = self.subscription.recv() => {
                    let update = update?;
                    match SseFrame::update(&update) {
                        Ok(frame) => return Some(frame),
                        Err(e) => log::warn!("⚠️  Failed to encode update frame: {}", e),
                    }
                }
                _ = self.heartbeat.tick() => return Some(SseFrame::heartbeat()),
            }
        }
    }
}
