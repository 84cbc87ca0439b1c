//! Event broadcaster - in-process publish/subscribe hub
//!
//! One `tokio::sync::broadcast` channel per topic, created on first
//! subscription and removed when its last [`Subscription`] is dropped, so
//! the hub never holds more than the currently connected subscribers.
//!
//! Publishing never waits: a subscriber that falls more than `capacity`
//! messages behind skips the oldest ones (logged) and carries on from the
//! newest. Order per subscriber follows publish order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;

/// Topic carrying live visit count updates
pub const LIVE_TOPIC: &str = "live:visits";

/// Payload published by the poll loop after every successful cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveUpdate {
    pub total: i64,
    pub generated_at: DateTime<Utc>,
}

pub type LiveBroadcaster = EventBroadcaster<LiveUpdate>;

pub struct EventBroadcaster<T> {
    topics: Mutex<HashMap<String, broadcast::Sender<T>>>,
    capacity: usize,
}

impl<T: Clone + Send + 'static> EventBroadcaster<T> {
    /// `capacity` = per-subscriber backlog before lagging
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        })
    }

    /// Fan `payload` out to every subscriber of `topic`
    ///
    /// Returns how many subscribers it reached (0 when nobody listens).
    pub fn publish(&self, topic: &str, payload: T) -> usize {
        let topics = self.lock();
        match topics.get(topic) {
            Some(sender) => sender.send(payload).unwrap_or(0),
            None => 0,
        }
    }

    pub fn subscribe(self: &Arc<Self>, topic: &str) -> Subscription<T> {
        let mut topics = self.lock();
        let receiver = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        log::debug!("➕ Subscriber joined '{}'", topic);

        Subscription {
            topic: topic.to_string(),
            receiver: Some(receiver),
            hub: Arc::downgrade(self),
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Topics with at least one live subscription
    pub fn topic_count(&self) -> usize {
        self.lock().len()
    }

    fn release(&self, topic: &str) {
        let mut topics = self.lock();
        if let Some(sender) = topics.get(topic) {
            if sender.receiver_count() == 0 {
                topics.remove(topic);
            }
        }
        log::debug!("➖ Subscriber left '{}'", topic);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<T>>> {
        self.topics.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// A registered subscriber; deregisters when dropped
pub struct Subscription<T: Clone + Send + 'static> {
    topic: String,
    receiver: Option<broadcast::Receiver<T>>,
    hub: Weak<EventBroadcaster<T>>,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next payload, or `None` once the hub is gone
    ///
    /// Cancel-safe: dropping the future loses nothing.
    pub async fn recv(&mut self) -> Option<T> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("⚠️  Subscriber on '{}' lagged, skipped {} updates", self.topic, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl<T: Clone + Send + 'static> Drop for Subscription<T> {
    fn drop(&mut self) {
        // Receiver must be gone before the count is checked
        self.receiver.take();
        if let Some(hub) = self.hub.upgrade() {
            hub.release(&self.topic);
        }
    }
}
