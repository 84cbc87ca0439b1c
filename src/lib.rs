//! shelfcount - cached library visit and loan analytics
//!
//! Keeps one live metric (visits since local midnight) fresh with a
//! self-pacing poll loop, refreshes every other aggregate on a cron
//! schedule, and serves both from a cache so request traffic never turns
//! into query load on the event store.

pub mod batch;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod gateway;
pub mod live;
pub mod poll_loop;
pub mod runtime;
pub mod source;
pub mod sqlite_pragma;
pub mod stream;

pub use runtime::Runtime;
