//! # Upstream Feed Ingestors
//!
//! Transport clients that turn an upstream source into a channel of
//! [`FeedEvent`](crate::core::ingest::FeedEvent)s for the ingest coordinator.
//! Reconnection and liveness policy live here, outside the core.
//!
//! ## Contained Modules:
//! - **`ws_feed`**: A resilient WebSocket client for push feeds, with
//!   exponential reconnect backoff and a silent-connection watchdog.
//! - **`http_poll`**: A fixed-interval REST poller for pull feeds, with
//!   transient-error retries from `reqwest-retry`.

#![forbid(unsafe_code)]

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// WebSocket push feed client.
pub mod ws_feed;
/// HTTP pull feed client.
pub mod http_poll;

pub use http_poll::{HttpPollConfig, HttpPollFeed};
pub use ws_feed::{WsFeed, WsFeedConfig};

/// Exponential reconnect delay, doubling from `base` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.max(Duration::from_millis(1));
        Self { base, max: max.max(base), current: base }
    }

    /// Returns the delay to wait now and doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Sleeps for `delay` unless `shutdown` fires first. Returns `true` when cancelled.
pub(crate) async fn sleep_or_cancel(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.cancelled() => true,
    }
}
