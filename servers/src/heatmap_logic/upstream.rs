use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use lib_heatmap::core::{channel_stream, FeedEvent, IngestCoordinator};
use lib_heatmap::ingestors::{HttpPollFeed, WsFeed};

use crate::heatmap_logic::config::Settings;

// Payloads buffered between a feed socket and its ingest task.
const FEED_BUFFER: usize = 256;

/// Spawns one transport task and one ingest task per configured feed. The
/// ingest task ends once its transport task has stopped.
pub fn spawn_feeds(
    settings: &Settings,
    ingest: &IngestCoordinator,
    shutdown: &CancellationToken,
) -> Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::new();

    for config in settings.ws_feed_configs() {
        let (tx, rx) = mpsc::channel::<FeedEvent>(FEED_BUFFER);
        let feed = WsFeed::new(config);
        let name = feed.name().to_string();
        tracing::info!(feed = %name, "starting websocket feed");
        handles.push(tokio::spawn(feed.run(tx, shutdown.clone())));
        handles.push(spawn_ingest(ingest.clone(), name, rx));
    }

    for config in settings.poll_feed_configs() {
        let url = config.url.clone();
        let feed = HttpPollFeed::new(config).with_context(|| format!("failed to build HTTP client for {}", url))?;
        let (tx, rx) = mpsc::channel::<FeedEvent>(FEED_BUFFER);
        let name = feed.name().to_string();
        tracing::info!(feed = %name, "starting poll feed");
        handles.push(tokio::spawn(feed.run(tx, shutdown.clone())));
        handles.push(spawn_ingest(ingest.clone(), name, rx));
    }

    if handles.is_empty() {
        tracing::warn!("no upstream feeds configured; the map will stay empty");
    }
    Ok(handles)
}

fn spawn_ingest(ingest: IngestCoordinator, name: String, rx: mpsc::Receiver<FeedEvent>) -> JoinHandle<()> {
    tokio::spawn(async move { ingest.run(&name, channel_stream(rx)).await })
}
