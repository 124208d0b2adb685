use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use lib_heatmap::core::{
    DeviceStateTable, FeedDisconnected, IngestCoordinator, SnapshotBroadcaster, SubscriptionRegistry,
};

/// Shared handles for the HTTP routes and the background tasks. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub table: Arc<DeviceStateTable>,
    pub registry: Arc<SubscriptionRegistry>,
    pub broadcaster: Arc<SnapshotBroadcaster>,
    pub ingest: IngestCoordinator,
    pub write_timeout: Duration,
    /// Most recent disconnect per feed name, kept by the monitor.
    pub feed_disconnects: Arc<DashMap<String, FeedDisconnected>>,
}

impl AppState {
    pub fn new(
        table: Arc<DeviceStateTable>,
        registry: Arc<SubscriptionRegistry>,
        broadcaster: Arc<SnapshotBroadcaster>,
        ingest: IngestCoordinator,
        write_timeout: Duration,
    ) -> Self {
        Self {
            table,
            registry,
            broadcaster,
            ingest,
            write_timeout,
            feed_disconnects: Arc::new(DashMap::new()),
        }
    }

    pub fn record_disconnect(&self, event: FeedDisconnected) {
        self.feed_disconnects.insert(event.feed.clone(), event);
    }
}
