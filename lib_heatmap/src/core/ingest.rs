//! # Ingest Coordinator
//!
//! The front door of the state table. Consumes raw payloads from any number
//! of upstream feeds, parses them into records, and commits each record to the
//! table with its contract. The coordinator is transport agnostic: a feed is
//! just a stream of [`FeedEvent`]s.
//!
//! Per-device ordering comes from the table's own compare-and-update on the
//! observation timestamp, so feeds never coordinate with each other and
//! unrelated devices never wait on each other. A bad or out-of-order message
//! is counted and dropped; it never ends the stream. Readings that parse but
//! fail validation are counted as malformed, not as rejected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::core::table::{DeviceStateTable, RejectReason, RemoveOutcome, UpsertOutcome};
use crate::errors::HeatmapError;
use crate::models::contract::ContractBook;
use crate::models::reading::{self, FeedRecord};

/// What a feed hands to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Raw payload text: one message or an array of messages.
    Payload(String),
    /// The transport dropped. The feed owns reconnection.
    Disconnected { reason: String },
}

/// Adapts the receiving half of a feed channel into the stream [`IngestCoordinator::run`]
/// consumes. The stream ends once every sender is dropped.
pub fn channel_stream(rx: mpsc::Receiver<FeedEvent>) -> impl Stream<Item = FeedEvent> {
    futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) })
}

/// Notification published on every feed disconnection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedDisconnected {
    pub feed: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl From<FeedDisconnected> for HeatmapError {
    fn from(event: FeedDisconnected) -> Self {
        HeatmapError::FeedDisconnected {
            feed: event.feed,
            reason: event.reason,
        }
    }
}

/// Counts for one payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub applied: u64,
    pub removed: u64,
    pub rejected: u64,
    pub malformed: u64,
}

/// Running totals since start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub applied: u64,
    pub removed: u64,
    pub rejected: u64,
    pub malformed: u64,
    pub feed_disconnects: u64,
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    removed: AtomicU64,
    rejected: AtomicU64,
    malformed: AtomicU64,
    feed_disconnects: AtomicU64,
}

struct Inner {
    table: Arc<DeviceStateTable>,
    contracts: Arc<ContractBook>,
    counters: Counters,
    disconnects: broadcast::Sender<FeedDisconnected>,
}

/// Cheap to clone; every feed task gets its own handle.
#[derive(Clone)]
pub struct IngestCoordinator {
    inner: Arc<Inner>,
}

impl IngestCoordinator {
    pub fn new(table: Arc<DeviceStateTable>, contracts: Arc<ContractBook>) -> Self {
        let (disconnects, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                table,
                contracts,
                counters: Counters::default(),
                disconnects,
            }),
        }
    }

    pub fn table(&self) -> &Arc<DeviceStateTable> {
        &self.inner.table
    }

    /// Consumes `stream` until it ends. Never fails on message content.
    pub async fn run<S>(&self, feed: &str, stream: S)
    where
        S: Stream<Item = FeedEvent>,
    {
        tokio::pin!(stream);
        tracing::info!(feed, "ingest started");

        while let Some(event) = stream.next().await {
            match event {
                FeedEvent::Payload(text) => {
                    self.ingest_payload(feed, &text);
                }
                FeedEvent::Disconnected { reason } => self.feed_disconnected(feed, reason),
            }
        }

        tracing::info!(feed, "ingest stream ended");
    }

    /// Parses and applies one payload.
    pub fn ingest_payload(&self, feed: &str, text: &str) -> IngestReport {
        let mut report = IngestReport::default();

        for parsed in reading::parse_payload(text) {
            let record = match parsed {
                Ok(record) => record,
                Err(reason) => {
                    let err = HeatmapError::MalformedMessage {
                        feed: feed.to_string(),
                        reason,
                    };
                    tracing::warn!(error = %err, "dropping message");
                    report.malformed += 1;
                    continue;
                }
            };

            let removal = matches!(record, FeedRecord::Remove { .. });
            match self.apply(feed, record) {
                Ok(true) if removal => report.removed += 1,
                Ok(true) => report.applied += 1,
                Ok(false) => {}
                Err(err @ HeatmapError::MalformedMessage { .. }) => {
                    tracing::warn!(error = %err, "dropping message");
                    report.malformed += 1;
                }
                Err(err) => {
                    tracing::debug!(feed, error = %err, "dropping update");
                    report.rejected += 1;
                }
            }
        }

        let c = &self.inner.counters;
        c.applied.fetch_add(report.applied, Ordering::Relaxed);
        c.removed.fetch_add(report.removed, Ordering::Relaxed);
        c.rejected.fetch_add(report.rejected, Ordering::Relaxed);
        c.malformed.fetch_add(report.malformed, Ordering::Relaxed);
        report
    }

    /// Commits one record. `Ok(true)` when the table changed, `Ok(false)` for
    /// a removal of an unknown device. A reading failing validation is
    /// `Err(MalformedMessage)`; a stale one is `Err(RejectedUpdate)`.
    pub fn apply(&self, feed: &str, record: FeedRecord) -> Result<bool, HeatmapError> {
        let identifier = record.identifier();
        match record {
            FeedRecord::Reading(reading) => {
                let contract = self.inner.contracts.get(&identifier);
                match self.inner.table.upsert(reading, contract) {
                    UpsertOutcome::Applied { revision } => {
                        tracing::trace!(%identifier, revision, "reading applied");
                        Ok(true)
                    }
                    UpsertOutcome::Rejected(RejectReason::Invalid(reason)) => Err(HeatmapError::MalformedMessage {
                        feed: feed.to_string(),
                        reason: format!("device {}: {}", identifier, reason),
                    }),
                    UpsertOutcome::Rejected(reason) => Err(HeatmapError::RejectedUpdate {
                        identifier,
                        reason: reason.to_string(),
                    }),
                }
            }
            FeedRecord::Remove { observed_at, .. } => {
                match self.inner.table.remove(identifier, observed_at) {
                    RemoveOutcome::Removed { revision } => {
                        tracing::info!(%identifier, revision, "device removed");
                        Ok(true)
                    }
                    RemoveOutcome::NotFound => {
                        tracing::debug!(%identifier, "removal for unknown device ignored");
                        Ok(false)
                    }
                    RemoveOutcome::Rejected(reason) => Err(HeatmapError::RejectedUpdate {
                        identifier,
                        reason: reason.to_string(),
                    }),
                }
            }
        }
    }

    /// Hook for feeds to report a dropped transport.
    pub fn feed_disconnected(&self, feed: &str, reason: impl Into<String>) {
        let event = FeedDisconnected {
            feed: feed.to_string(),
            reason: reason.into(),
            at: Utc::now(),
        };
        self.inner.counters.feed_disconnects.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(feed, reason = %event.reason, "feed disconnected");
        // No listeners is fine.
        let _ = self.inner.disconnects.send(event);
    }

    /// Subscribes to feed disconnection notifications.
    pub fn on_feed_disconnected(&self) -> broadcast::Receiver<FeedDisconnected> {
        self.inner.disconnects.subscribe()
    }

    pub fn stats(&self) -> IngestStats {
        let c = &self.inner.counters;
        IngestStats {
            applied: c.applied.load(Ordering::Relaxed),
            removed: c.removed.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            feed_disconnects: c.feed_disconnects.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::contract::{Bounds, Contract};
    use futures_util::stream;
    use serde_json::json;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn message(id: &Uuid, supply: f64, observed_at: &str) -> serde_json::Value {
        json!({
            "identifier": id.to_string(),
            "name": "Heat point",
            "is_active": true,
            "latitude": 58.0,
            "longitude": 56.2,
            "sensor": { "is_active": true, "supply_temperature": supply, "pressure": 6.0 },
            "observed_at": observed_at
        })
    }

    fn coordinator(contracts: ContractBook) -> IngestCoordinator {
        IngestCoordinator::new(Arc::new(DeviceStateTable::new()), Arc::new(contracts))
    }

    #[test]
    fn test_stale_reading_rejected_and_counted() {
        let id = Uuid::new_v4();
        let mut devices = HashMap::new();
        devices.insert(id, Contract { supply_temperature: Some(Bounds::new(65.0, 75.0)), pressure: None });
        let coord = coordinator(ContractBook::new(devices, None));

        let first = coord.ingest_payload("feed-a", &message(&id, 70.0, "2026-10-16T10:00:00Z").to_string());
        assert_eq!(first.applied, 1);
        let state = coord.table().get(&id).unwrap();
        assert!(state.flags().correct_supply_temperature);

        let late = coord.ingest_payload("feed-b", &message(&id, 60.0, "2026-10-16T09:59:00Z").to_string());
        assert_eq!(late.rejected, 1);
        assert_eq!(coord.table().get(&id).unwrap().reading().sensor.supply_temperature, Some(70.0));
        assert_eq!(coord.stats().rejected, 1);
    }

    #[test]
    fn test_batch_with_removal() {
        let coord = coordinator(ContractBook::default());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let payload = json!([
            message(&a, 70.0, "2026-10-16T10:00:00Z"),
            message(&b, 71.0, "2026-10-16T10:00:00Z"),
            {"type": "remove", "identifier": a.to_string(), "observed_at": "2026-10-16T10:05:00Z"},
            {"type": "remove", "identifier": Uuid::new_v4().to_string(), "observed_at": "2026-10-16T10:05:00Z"}
        ]);
        let report = coord.ingest_payload("feed", &payload.to_string());
        assert_eq!(report, IngestReport { applied: 2, removed: 1, rejected: 0, malformed: 0 });
        assert!(coord.table().get(&a).is_none());
        assert_eq!(coord.table().len(), 1);
    }

    #[test]
    fn test_invalid_readings_counted_as_malformed() {
        let coord = coordinator(ContractBook::default());
        let mut off_map = message(&Uuid::new_v4(), 70.0, "2026-10-16T10:00:00Z");
        off_map["latitude"] = json!(91.0);
        let nil_id = message(&Uuid::nil(), 70.0, "2026-10-16T10:00:00Z");

        let report = coord.ingest_payload("feed", &json!([off_map, nil_id]).to_string());
        assert_eq!(report, IngestReport { applied: 0, removed: 0, rejected: 0, malformed: 2 });
        assert!(coord.table().is_empty());

        let stats = coord.stats();
        assert_eq!(stats.malformed, 2);
        assert_eq!(stats.rejected, 0);
    }

    #[test]
    fn test_apply_maps_table_refusals_to_taxonomy() {
        let coord = coordinator(ContractBook::default());
        let id = Uuid::new_v4();
        let parse = |v: serde_json::Value| reading::parse_value(v).unwrap();

        assert!(coord.apply("feed", parse(message(&id, 70.0, "2026-10-16T10:00:00Z"))).unwrap());
        let stale = coord.apply("feed", parse(message(&id, 70.0, "2026-10-16T09:00:00Z")));
        assert!(matches!(stale, Err(HeatmapError::RejectedUpdate { .. })));

        let mut bad = message(&id, 70.0, "2026-10-16T11:00:00Z");
        bad["longitude"] = json!(-181.0);
        match coord.apply("feed-z", parse(bad)) {
            Err(HeatmapError::MalformedMessage { feed, .. }) => assert_eq!(feed, "feed-z"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_survives_bad_messages_and_reports_disconnects() {
        let coord = coordinator(ContractBook::default());
        let mut disconnects = coord.on_feed_disconnected();
        let id = Uuid::new_v4();

        let events = vec![
            FeedEvent::Payload("garbage".to_string()),
            FeedEvent::Disconnected { reason: "connection reset".to_string() },
            FeedEvent::Payload(message(&id, 70.0, "2026-10-16T10:00:00Z").to_string()),
        ];
        coord.run("feed-x", stream::iter(events)).await;

        let stats = coord.stats();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.feed_disconnects, 1);

        let event = disconnects.recv().await.unwrap();
        assert_eq!(event.feed, "feed-x");
        let err: HeatmapError = event.into();
        assert!(matches!(err, HeatmapError::FeedDisconnected { .. }));
    }

    #[tokio::test]
    async fn test_channel_stream_ends_when_senders_drop() {
        let coord = coordinator(ContractBook::default());
        let (tx, rx) = mpsc::channel(8);
        let id = Uuid::new_v4();
        tx.send(FeedEvent::Payload(message(&id, 70.0, "2026-10-16T10:00:00Z").to_string())).await.unwrap();
        drop(tx);

        coord.run("channel", channel_stream(rx)).await;
        assert_eq!(coord.table().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_feeds_same_device_converge_to_newest() {
        let coord = coordinator(ContractBook::default());
        let id = Uuid::new_v4();
        let feed = move |minutes: Vec<u32>| {
            stream::iter(minutes.into_iter().map(move |m| {
                FeedEvent::Payload(message(&id, 60.0 + m as f64, &format!("2026-10-16T10:{:02}:00Z", m)).to_string())
            }))
        };

        let a = coord.clone();
        let b = coord.clone();
        let even = tokio::spawn(async move { a.run("even", feed((0..30).step_by(2).collect())).await });
        let odd = tokio::spawn(async move { b.run("odd", feed((1..30).step_by(2).rev().collect())).await });
        even.await.unwrap();
        odd.await.unwrap();

        let state = coord.table().get(&id).unwrap();
        assert_eq!(state.reading().sensor.supply_temperature, Some(89.0));
        assert_eq!(state.reading().observed_at.to_rfc3339(), "2026-10-16T10:29:00+00:00");
        let stats = coord.stats();
        assert_eq!(stats.applied + stats.rejected, 30);
    }
}
