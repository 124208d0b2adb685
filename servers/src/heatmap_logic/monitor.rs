use anyhow::Result;
use chrono::Utc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use lib_heatmap::core::FeedDisconnected;

use crate::heatmap_logic::config::Settings;
use crate::heatmap_logic::state::AppState;

/// Periodic health checks. Returns an error only for a fatal condition: the
/// state table failing its invariant check.
///
/// `disconnects` must be subscribed before the feeds start so that an early
/// connect failure is recorded.
pub async fn run(
    settings: Settings,
    app_state: AppState,
    mut disconnects: broadcast::Receiver<FeedDisconnected>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut check_interval = interval(settings.monitor_interval);
    let feeds_configured = !settings.ws_feeds.is_empty() || !settings.poll_feeds.is_empty();
    let started_at = Utc::now();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("monitor received shutdown signal");
                break;
            }
            event = disconnects.recv() => match event {
                Ok(event) => app_state.record_disconnect(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "monitor lagged behind feed disconnect events");
                }
                Err(RecvError::Closed) => {}
            },
            _ = check_interval.tick() => {
                if let Err(err) = app_state.table.check_invariants() {
                    tracing::error!(error = %err, "state table invariant violated");
                    return Err(err.into());
                }

                if !feeds_configured {
                    continue;
                }
                let last = app_state.table.last_commit_at().unwrap_or(started_at);
                let idle = (Utc::now() - last).to_std().unwrap_or_default();
                if idle > settings.inactivity_threshold {
                    tracing::warn!(
                        idle_s = idle.as_secs(),
                        threshold_s = settings.inactivity_threshold.as_secs(),
                        subscribers = app_state.registry.len(),
                        "no readings applied recently"
                    );
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heatmap_logic::config::Config;
    use lib_heatmap::core::{IngestCoordinator, SnapshotBroadcaster, SubscriptionRegistry};
    use lib_heatmap::models::ContractBook;
    use lib_heatmap::DeviceStateTable;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_records_disconnects_and_stops_cleanly() {
        let settings = Config::default().resolve().unwrap();
        let table = Arc::new(DeviceStateTable::new());
        let registry = Arc::new(SubscriptionRegistry::new());
        let ingest = IngestCoordinator::new(table.clone(), Arc::new(ContractBook::default()));
        let broadcaster = Arc::new(SnapshotBroadcaster::new(table.clone(), registry.clone(), settings.broadcast_config()));
        let state = AppState::new(table, registry, broadcaster, ingest.clone(), Duration::from_secs(1));

        // 1. A disconnect reported before the monitor task runs is not lost
        let disconnects = ingest.on_feed_disconnected();
        ingest.feed_disconnected("ws-0", "connection reset");

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(settings, state.clone(), disconnects, shutdown.clone()));
        for _ in 0..50 {
            if state.feed_disconnects.contains_key("ws-0") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.feed_disconnects.get("ws-0").unwrap().reason, "connection reset");

        // 2. Shutdown ends the task without error
        shutdown.cancel();
        assert!(task.await.unwrap().is_ok());
    }
}
