//! # WebSocket Feed Ingestor
//!
//! Connects to an upstream push feed and forwards every text frame as a
//! [`FeedEvent::Payload`]. A dropped, failed or silent connection is reported
//! as [`FeedEvent::Disconnected`] and retried with exponential backoff until
//! shutdown.

use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::{sleep_or_cancel, Backoff};
use crate::core::ingest::FeedEvent;

/// Configuration for one WebSocket feed.
#[derive(Debug, Clone)]
pub struct WsFeedConfig {
    /// Name used in logs and stats.
    pub name: String,
    pub url: String,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// A connection with no frames (data or heartbeat) for this long is
    /// treated as dead.
    pub silent_failure_timeout: Duration,
}

impl WsFeedConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            silent_failure_timeout: Duration::from_secs(30),
        }
    }
}

type FeedSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a session ended.
enum SessionEnd {
    Dropped(String),
    Shutdown,
    IngestClosed,
}

pub struct WsFeed {
    config: WsFeedConfig,
}

impl WsFeed {
    pub fn new(config: WsFeedConfig) -> Self {
        Self { config }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Primary execution loop with reconnection logic. Returns on shutdown or
    /// once the receiving side of `events` is gone.
    pub async fn run(self, events: mpsc::Sender<FeedEvent>, shutdown: CancellationToken) {
        let feed = self.config.name.as_str();
        let mut backoff = Backoff::new(self.config.reconnect_base, self.config.reconnect_max);

        while !shutdown.is_cancelled() {
            tracing::info!(feed, url = %self.config.url, "connecting");

            let connected = tokio::select! {
                res = connect_async(self.config.url.as_str()) => res,
                _ = shutdown.cancelled() => break,
            };

            let reason = match connected {
                Ok((ws_stream, _)) => {
                    tracing::info!(feed, "connected");
                    backoff.reset();
                    match self.session(ws_stream, &events, &shutdown).await {
                        SessionEnd::Dropped(reason) => reason,
                        SessionEnd::Shutdown | SessionEnd::IngestClosed => break,
                    }
                }
                Err(e) => format!("connect failed: {}", e),
            };

            let delivered = tokio::select! {
                res = events.send(FeedEvent::Disconnected { reason }) => res.is_ok(),
                _ = shutdown.cancelled() => false,
            };
            if !delivered {
                break;
            }

            let delay = backoff.next_delay();
            tracing::info!(feed, delay_ms = delay.as_millis() as u64, "reconnecting after delay");
            if sleep_or_cancel(delay, &shutdown).await {
                break;
            }
        }

        tracing::info!(feed, "feed stopped");
    }

    async fn session(
        &self,
        ws_stream: FeedSocket,
        events: &mpsc::Sender<FeedEvent>,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        let feed = self.config.name.as_str();
        let (mut write, mut read) = ws_stream.split();
        let mut last_activity = Instant::now();
        let mut watchdog = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                msg = read.next() => {
                    let payload = match msg {
                        Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                        Some(Ok(Message::Binary(bin))) => String::from_utf8_lossy(&bin).into_owned(),
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                            // Heartbeats keep a quiet feed alive.
                            last_activity = Instant::now();
                            continue;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return SessionEnd::Dropped(format!("closed by remote: {:?}", frame));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return SessionEnd::Dropped(format!("read error: {}", e)),
                        None => return SessionEnd::Dropped("stream closed by remote host".to_string()),
                    };
                    last_activity = Instant::now();
                    if events.send(FeedEvent::Payload(payload)).await.is_err() {
                        return SessionEnd::IngestClosed;
                    }
                }
                _ = watchdog.tick() => {
                    if last_activity.elapsed() > self.config.silent_failure_timeout {
                        tracing::warn!(
                            feed,
                            timeout_s = self.config.silent_failure_timeout.as_secs(),
                            "inactivity timeout"
                        );
                        return SessionEnd::Dropped("silent connection".to_string());
                    }
                }
                _ = shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }
}
