//! # Snapshot Broadcaster
//!
//! Fans consistent table snapshots out to every registered subscriber.
//!
//! ## Design
//!
//! 1.  **Zero-copy fan-out**: one `Arc<Snapshot>` is taken per push and the
//!     same pointer is queued for every subscriber. Encoding to the wire format
//!     happens later, on each subscriber's own task.
//! 2.  **Never blocks on a subscriber**: queues are bounded and written with
//!     `try_send`. A full queue means the subscriber's backlog reached the
//!     configured bound, and it is disconnected instead of slowing everyone
//!     else down.
//! 3.  **Cadence**: either push on every table change, or coalesce all
//!     revisions that landed within a fixed interval into one push (default).
//! 4.  **Monotonic delivery**: a [`Subscription`] drops any snapshot older than
//!     the revision current at registration, and any snapshot not newer than
//!     the last one it delivered.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::registry::{
    DeliveryMode, SubscriberChannel, SubscriptionId, SubscriptionRegistry, UnregisterReason,
};
use crate::core::table::{DeviceStateTable, Snapshot};
use crate::errors::HeatmapError;
use crate::models::state::DeviceState;
use crate::models::wire::{DeviceView, SnapshotFrame};

/// When pushes happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushCadence {
    /// Push as soon as the table revision moves.
    OnChange,
    /// Push at most once per interval, only if the revision moved.
    Coalesce(Duration),
}

impl Default for PushCadence {
    fn default() -> Self {
        PushCadence::Coalesce(Duration::from_millis(250))
    }
}

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub cadence: PushCadence,
    /// Frames a subscriber may have queued before it is disconnected.
    pub backlog_limit: usize,
    /// Devices not observed for this long are flagged `stale` in frames.
    pub stale_after: Option<Duration>,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            cadence: PushCadence::default(),
            backlog_limit: 16,
            stale_after: None,
        }
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub revision: u64,
    pub delivered: usize,
    pub backlog_dropped: usize,
    pub closed: usize,
}

/// Running totals exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BroadcastStats {
    pub pushes: u64,
    pub last_pushed_revision: u64,
    pub backlog_disconnects: u64,
}

pub struct SnapshotBroadcaster {
    table: Arc<DeviceStateTable>,
    registry: Arc<SubscriptionRegistry>,
    config: BroadcastConfig,
    last_pushed: AtomicU64,
    pushes: AtomicU64,
    backlog_disconnects: AtomicU64,
}

impl SnapshotBroadcaster {
    pub fn new(
        table: Arc<DeviceStateTable>,
        registry: Arc<SubscriptionRegistry>,
        config: BroadcastConfig,
    ) -> Self {
        Self {
            table,
            registry,
            config,
            last_pushed: AtomicU64::new(0),
            pushes: AtomicU64::new(0),
            backlog_disconnects: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Opens a subscription. The returned handle yields a snapshot at least as
    /// recent as the table revision at the moment of registration first.
    pub fn subscribe(&self, mode: DeliveryMode) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.config.backlog_limit.max(1));
        let cancel = CancellationToken::new();
        let floor = self.table.revision();

        let id = self.registry.register(SubscriberChannel {
            sender,
            mode,
            cancel: cancel.clone(),
            registered_at_revision: floor,
        });
        let initial = Arc::new(self.table.snapshot());

        Subscription {
            id,
            mode,
            receiver,
            cancel,
            registry: Arc::clone(&self.registry),
            pending: Some(initial),
            floor,
            last_revision: None,
            sent: HashMap::new(),
            stale_after: self.config.stale_after,
        }
    }

    /// Pushes if `revision` is newer than the last push. Returns `None` when
    /// there was nothing new to send.
    pub fn on_table_revision_changed(&self, revision: u64) -> Option<PushReport> {
        if revision <= self.last_pushed.load(Ordering::Acquire) {
            return None;
        }
        Some(self.push_snapshot())
    }

    /// Takes a snapshot and queues it for every subscriber.
    pub fn push_snapshot(&self) -> PushReport {
        let snapshot = Arc::new(self.table.snapshot());
        self.last_pushed.fetch_max(snapshot.revision, Ordering::AcqRel);
        self.pushes.fetch_add(1, Ordering::Relaxed);

        let mut report = PushReport {
            revision: snapshot.revision,
            ..PushReport::default()
        };

        for (id, sender) in self.registry.senders() {
            match sender.try_send(Arc::clone(&snapshot)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    let depth = sender.max_capacity();
                    if self.registry.unregister(id, UnregisterReason::BacklogExceeded { depth }) {
                        self.backlog_disconnects.fetch_add(1, Ordering::Relaxed);
                        report.backlog_dropped += 1;
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    if self.registry.unregister(id, UnregisterReason::ClientClosed) {
                        report.closed += 1;
                    }
                }
            }
        }

        tracing::trace!(
            revision = report.revision,
            delivered = report.delivered,
            dropped = report.backlog_dropped,
            "snapshot pushed"
        );
        report
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            pushes: self.pushes.load(Ordering::Relaxed),
            last_pushed_revision: self.last_pushed.load(Ordering::Acquire),
            backlog_disconnects: self.backlog_disconnects.load(Ordering::Relaxed),
        }
    }

    /// The broadcasting loop. Runs until `shutdown` fires, then cancels every
    /// remaining subscription.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(cadence = ?self.config.cadence, backlog_limit = self.config.backlog_limit, "broadcaster started");

        match self.config.cadence {
            PushCadence::OnChange => loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.table.changed() => {
                        self.on_table_revision_changed(self.table.revision());
                    }
                }
            },
            PushCadence::Coalesce(period) => {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            self.on_table_revision_changed(self.table.revision());
                        }
                    }
                }
            }
        }

        let cancelled = self.registry.cancel_all(UnregisterReason::Shutdown);
        tracing::info!(cancelled, "broadcaster stopped");
    }
}

/// Consumer side of one subscription. Owned by the task that writes to the
/// subscriber's transport. Dropping it unregisters the subscription.
pub struct Subscription {
    id: SubscriptionId,
    mode: DeliveryMode,
    receiver: mpsc::Receiver<Arc<Snapshot>>,
    cancel: CancellationToken,
    registry: Arc<SubscriptionRegistry>,
    pending: Option<Arc<Snapshot>>,
    floor: u64,
    last_revision: Option<u64>,
    // identifier -> revision last delivered, incremental mode only
    sent: HashMap<Uuid, u64>,
    stale_after: Option<Duration>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Revision current when the subscription was registered.
    pub fn registered_at_revision(&self) -> u64 {
        self.floor
    }

    pub fn last_revision(&self) -> Option<u64> {
        self.last_revision
    }

    /// Fires when the subscription is unregistered for any reason.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the next frame to deliver. `None` once the subscription has
    /// been cancelled or unregistered.
    pub async fn next_frame(&mut self) -> Option<SnapshotFrame> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            let snapshot = match self.pending.take() {
                Some(snapshot) => snapshot,
                None => tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return None,
                    next = self.receiver.recv() => next?,
                },
            };

            if snapshot.revision < self.floor {
                continue;
            }
            if self.last_revision.is_some_and(|last| snapshot.revision <= last) {
                continue;
            }
            return Some(self.encode(&snapshot));
        }
    }

    /// Reports a failed or timed-out write and unregisters.
    pub fn report_unreachable(&self, reason: impl Into<String>) -> HeatmapError {
        let reason = reason.into();
        self.registry
            .unregister(self.id, UnregisterReason::Unreachable(reason.clone()));
        HeatmapError::SubscriberUnreachable { id: self.id, reason }
    }

    fn encode(&mut self, snapshot: &Snapshot) -> SnapshotFrame {
        let now = Utc::now();
        let stale_after = self.stale_after;
        let view = |s: &Arc<DeviceState>| DeviceView::from_state(s, now, stale_after);

        let frame = match (self.mode, self.last_revision) {
            (DeliveryMode::Incremental, Some(since)) => {
                let devices = snapshot
                    .devices
                    .iter()
                    .filter(|s| self.sent.get(&s.identifier()) != Some(&s.revision()))
                    .map(view)
                    .collect();
                let present: HashSet<Uuid> = snapshot.devices.iter().map(|s| s.identifier()).collect();
                let mut removed: Vec<Uuid> = self
                    .sent
                    .keys()
                    .filter(|id| !present.contains(id))
                    .copied()
                    .collect();
                removed.sort_unstable();
                SnapshotFrame::delta(snapshot.revision, since, now, devices, removed)
            }
            _ => SnapshotFrame::full(snapshot.revision, now, snapshot.devices.iter().map(view).collect()),
        };

        if self.mode == DeliveryMode::Incremental {
            self.sent = snapshot
                .devices
                .iter()
                .map(|s| (s.identifier(), s.revision()))
                .collect();
        }
        self.last_revision = Some(snapshot.revision);
        frame
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unregister(self.id, UnregisterReason::ClientClosed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::reading::{DeviceReading, SensorPayload};
    use crate::models::wire::FrameKind;
    use chrono::{DateTime, Duration as ChronoDuration};

    fn reading(id: Uuid, observed_at: DateTime<Utc>) -> DeviceReading {
        DeviceReading {
            identifier: id,
            name: "node".to_string(),
            is_active: true,
            latitude: 1.0,
            longitude: 2.0,
            sensor: SensorPayload {
                is_active: true,
                supply_temperature: Some(70.0),
                return_temperature: None,
                pressure: None,
            },
            observed_at,
        }
    }

    fn setup(backlog_limit: usize) -> (Arc<DeviceStateTable>, Arc<SnapshotBroadcaster>) {
        let table = Arc::new(DeviceStateTable::new());
        let registry = Arc::new(SubscriptionRegistry::new());
        let config = BroadcastConfig {
            cadence: PushCadence::OnChange,
            backlog_limit,
            stale_after: None,
        };
        let broadcaster = Arc::new(SnapshotBroadcaster::new(Arc::clone(&table), registry, config));
        (table, broadcaster)
    }

    #[tokio::test]
    async fn test_initial_snapshot_then_push() {
        let (table, broadcaster) = setup(4);
        let mut sub = broadcaster.subscribe(DeliveryMode::Full);

        let first = sub.next_frame().await.unwrap();
        assert_eq!(first.revision, 0);
        assert!(first.devices.is_empty());

        let t0 = Utc::now();
        for _ in 0..3 {
            table.upsert(reading(Uuid::new_v4(), t0), None);
        }
        let report = broadcaster.on_table_revision_changed(table.revision()).unwrap();
        assert_eq!(report.delivered, 1);

        let second = sub.next_frame().await.unwrap();
        assert_eq!(second.revision, 3);
        assert_eq!(second.devices.len(), 3);
        assert!(broadcaster.on_table_revision_changed(3).is_none());
    }

    #[tokio::test]
    async fn test_never_delivers_below_registration_revision() {
        let (table, broadcaster) = setup(4);
        let t0 = Utc::now();
        table.upsert(reading(Uuid::new_v4(), t0), None);
        table.upsert(reading(Uuid::new_v4(), t0), None);

        // A snapshot taken before registration, queued late.
        let early = Arc::new(table.snapshot());
        table.upsert(reading(Uuid::new_v4(), t0), None);

        let mut sub = broadcaster.subscribe(DeliveryMode::Full);
        assert_eq!(sub.registered_at_revision(), 3);
        let (_, sender) = broadcaster.registry().senders().pop().unwrap();
        sender.try_send(early).unwrap();
        table.upsert(reading(Uuid::new_v4(), t0), None);
        broadcaster.push_snapshot();

        let revisions = [sub.next_frame().await.unwrap().revision, sub.next_frame().await.unwrap().revision];
        assert_eq!(revisions, [3, 4]);
    }

    #[tokio::test]
    async fn test_slow_subscriber_disconnected_others_unaffected() {
        let (table, broadcaster) = setup(2);
        let mut fast = broadcaster.subscribe(DeliveryMode::Full);
        let slow = broadcaster.subscribe(DeliveryMode::Full);
        let slow_cancel = slow.cancellation();

        let t0 = Utc::now();
        let id = Uuid::new_v4();
        for i in 0..3 {
            table.upsert(reading(id, t0 + ChronoDuration::seconds(i)), None);
            broadcaster.push_snapshot();
            while let Ok(Some(_)) =
                tokio::time::timeout(std::time::Duration::from_millis(5), fast.next_frame()).await
            {}
        }

        assert!(slow_cancel.is_cancelled());
        assert!(!broadcaster.registry().is_active(slow.id()));
        assert!(broadcaster.registry().is_active(fast.id()));
        assert_eq!(broadcaster.stats().backlog_disconnects, 1);
        assert_eq!(fast.last_revision(), Some(3));
    }

    #[tokio::test]
    async fn test_incremental_mode_sends_deltas() {
        let (table, broadcaster) = setup(4);
        let t0 = Utc::now();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        table.upsert(reading(a, t0), None);
        table.upsert(reading(b, t0), None);

        let mut sub = broadcaster.subscribe(DeliveryMode::Incremental);
        let full = sub.next_frame().await.unwrap();
        assert_eq!(full.kind, FrameKind::Snapshot);
        assert_eq!(full.devices.len(), 2);

        table.upsert(reading(a, t0 + ChronoDuration::seconds(1)), None);
        table.remove(b, t0 + ChronoDuration::seconds(1));
        broadcaster.push_snapshot();

        let delta = sub.next_frame().await.unwrap();
        assert_eq!(delta.kind, FrameKind::Delta);
        assert_eq!(delta.since_revision, Some(2));
        assert_eq!(delta.revision, 4);
        assert_eq!(delta.devices.len(), 1);
        assert_eq!(delta.devices[0].identifier, a);
        assert_eq!(delta.removed, Some(vec![b]));
    }

    #[tokio::test]
    async fn test_unregister_ends_subscription_and_drop_is_idempotent() {
        let (_table, broadcaster) = setup(4);
        let mut sub = broadcaster.subscribe(DeliveryMode::Full);
        let id = sub.id();

        let err = sub.report_unreachable("write timed out");
        assert!(matches!(err, HeatmapError::SubscriberUnreachable { .. }));
        assert!(sub.next_frame().await.is_none());
        assert!(!broadcaster.registry().is_active(id));
        drop(sub);
        assert!(broadcaster.registry().is_empty());
    }

    #[tokio::test]
    async fn test_on_change_loop_pushes_and_shuts_down() {
        let (table, broadcaster) = setup(8);
        let mut sub = broadcaster.subscribe(DeliveryMode::Full);
        sub.next_frame().await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&broadcaster).run(shutdown.clone()));

        table.upsert(reading(Uuid::new_v4(), Utc::now()), None);
        let frame = tokio::time::timeout(std::time::Duration::from_secs(2), sub.next_frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.revision, 1);

        shutdown.cancel();
        handle.await.unwrap();
        assert!(sub.next_frame().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesce_merges_revisions() {
        let table = Arc::new(DeviceStateTable::new());
        let registry = Arc::new(SubscriptionRegistry::new());
        let config = BroadcastConfig {
            cadence: PushCadence::Coalesce(std::time::Duration::from_millis(100)),
            ..BroadcastConfig::default()
        };
        let broadcaster = Arc::new(SnapshotBroadcaster::new(Arc::clone(&table), registry, config));
        let mut sub = broadcaster.subscribe(DeliveryMode::Full);
        sub.next_frame().await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&broadcaster).run(shutdown.clone()));

        let t0 = Utc::now();
        for _ in 0..5 {
            table.upsert(reading(Uuid::new_v4(), t0), None);
        }
        let frame = sub.next_frame().await.unwrap();
        assert_eq!(frame.revision, 5);
        assert_eq!(frame.devices.len(), 5);
        assert_eq!(broadcaster.stats().pushes, 1);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
