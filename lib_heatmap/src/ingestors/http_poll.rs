//! # HTTP Poll Feed Ingestor
//!
//! A self-scheduling client for upstream sources that only offer a REST
//! endpoint. Every `interval` it fetches the endpoint and forwards the body
//! as one [`FeedEvent::Payload`]; the body may be a single message or an
//! array. Transient failures are retried by the middleware. A poll that still
//! fails marks the feed as down, which is reported once as
//! [`FeedEvent::Disconnected`] until the next successful poll.

use std::time::Duration;

use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::core::ingest::FeedEvent;

/// Configuration for one polled feed.
#[derive(Debug, Clone)]
pub struct HttpPollConfig {
    pub name: String,
    pub url: String,
    pub interval: Duration,
    /// Per-request timeout.
    pub timeout: Duration,
    pub max_retries: u32,
}

impl HttpPollConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

pub struct HttpPollFeed {
    config: HttpPollConfig,
    client: ClientWithMiddleware,
}

impl HttpPollFeed {
    /// Fails only if the underlying HTTP client cannot be built (TLS backend
    /// initialisation).
    pub fn new(config: HttpPollConfig) -> reqwest::Result<Self> {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(config.max_retries);
        let inner = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent("HeatMap/1.0")
            .build()?;
        let client = ClientBuilder::new(inner)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self { config, client })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Polls until shutdown or until the receiving side of `events` is gone.
    pub async fn run(self, events: mpsc::Sender<FeedEvent>, shutdown: CancellationToken) {
        let feed = self.config.name.as_str();
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut healthy = true;

        tracing::info!(feed, url = %self.config.url, interval_ms = self.config.interval.as_millis() as u64, "polling started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            // Retries inside a poll can take a while; shutdown does not wait for them.
            let polled = tokio::select! {
                res = self.poll_once() => res,
                _ = shutdown.cancelled() => break,
            };
            let event = match polled {
                Ok(body) => {
                    if !healthy {
                        tracing::info!(feed, "feed recovered");
                    }
                    healthy = true;
                    FeedEvent::Payload(body)
                }
                Err(reason) if healthy => {
                    healthy = false;
                    FeedEvent::Disconnected { reason }
                }
                Err(reason) => {
                    tracing::debug!(feed, %reason, "feed still down");
                    continue;
                }
            };

            let delivered = tokio::select! {
                res = events.send(event) => res.is_ok(),
                _ = shutdown.cancelled() => false,
            };
            if !delivered {
                break;
            }
        }

        tracing::info!(feed, "polling stopped");
    }

    /// One fetch. The error string becomes the disconnect reason.
    async fn poll_once(&self) -> Result<String, String> {
        let response = self
            .client
            .get(self.config.url.as_str())
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("upstream returned {}", status.as_u16()));
        }

        response.text().await.map_err(|e| format!("body read failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_single_disconnect() {
        let mut config = HttpPollConfig::new("poll", "http://127.0.0.1:9/devices");
        config.interval = Duration::from_millis(20);
        config.timeout = Duration::from_millis(200);
        config.max_retries = 0;

        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let feed = HttpPollFeed::new(config).unwrap();
        assert_eq!(feed.name(), "poll");
        let task = tokio::spawn(feed.run(tx, shutdown.clone()));

        match rx.recv().await {
            Some(FeedEvent::Disconnected { reason }) => assert!(reason.starts_with("request failed")),
            other => panic!("unexpected event: {:?}", other),
        }

        // Further failures stay quiet until the feed recovers.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_retrying_poll() {
        let mut config = HttpPollConfig::new("poll", "http://127.0.0.1:9/devices");
        config.max_retries = 5;

        let (tx, _rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(HttpPollFeed::new(config).unwrap().run(tx, shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        assert!(tokio::time::timeout(Duration::from_secs(2), task).await.is_ok());
    }
}
