//! # Device State Table
//!
//! The single shared mutable resource of the service: identifier → latest
//! committed [`DeviceState`].
//!
//! ## Concurrency
//!
//! - **Per-key cells**: states live in a sharded `DashMap` as immutable
//!   `Arc<DeviceState>` values. An upsert is a compare-and-swap on the
//!   observation timestamp performed under that key's shard lock only, so
//!   writers for unrelated devices proceed in parallel.
//! - **Commit gate**: writers hold a shared (read) guard on a `parking_lot`
//!   `RwLock<()>` for the few instructions of a commit; writers never exclude
//!   each other through it. `snapshot()` takes the exclusive side just long
//!   enough to copy the `Arc` pointers, which yields an exact point-in-time
//!   view tagged with the revision it reflects.
//! - **Revision**: every committed mutation takes the next value of a
//!   monotonically increasing counter while inside the gate, and stamps it on
//!   the stored state.
//! - **Tombstones**: a removal of a stored device remembers its time so late
//!   readings cannot resurrect it. At most `tombstone_limit` are kept; the
//!   oldest is forgotten first.
//!
//! Readers never see a reading paired with flags from another ingestion event,
//! because the pair is built once and swapped in as one value.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::errors::{HeatmapError, Result};
use crate::models::contract::Contract;
use crate::models::reading::DeviceReading;
use crate::models::state::DeviceState;

/// Why the table refused a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    /// The stored state is as new or newer. Equal timestamps are refused so
    /// that re-delivery is idempotent.
    Stale {
        stored: DateTime<Utc>,
        offered: DateTime<Utc>,
    },
    /// The device was removed at or after the offered observation time.
    Removed { removed_at: DateTime<Utc> },
    /// The reading failed basic validation.
    Invalid(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Stale { stored, offered } => {
                write!(f, "stale: offered {} is not newer than stored {}", offered, stored)
            }
            RejectReason::Removed { removed_at } => write!(f, "device removed at {}", removed_at),
            RejectReason::Invalid(reason) => write!(f, "invalid: {}", reason),
        }
    }
}

/// Result of [`DeviceStateTable::upsert`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Applied { revision: u64 },
    Rejected(RejectReason),
}

impl UpsertOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpsertOutcome::Applied { .. })
    }
}

/// Result of [`DeviceStateTable::remove`].
#[derive(Debug, Clone, PartialEq)]
pub enum RemoveOutcome {
    Removed { revision: u64 },
    /// Nothing stored. The removal is ignored and leaves no tombstone.
    NotFound,
    Rejected(RejectReason),
}

/// A consistent view of the whole table at one revision, ordered by
/// identifier. Cheap to share: entries are reference counted.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub revision: u64,
    pub devices: Vec<Arc<DeviceState>>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, identifier: &Uuid) -> Option<&Arc<DeviceState>> {
        self.devices
            .binary_search_by_key(identifier, |s| s.identifier())
            .ok()
            .map(|i| &self.devices[i])
    }
}

/// Tombstones kept before the oldest is evicted.
pub const DEFAULT_TOMBSTONE_LIMIT: usize = 10_000;

pub struct DeviceStateTable {
    cells: DashMap<Uuid, Arc<DeviceState>>,
    tombstones: DashMap<Uuid, DateTime<Utc>>,
    tombstone_limit: usize,
    revision: AtomicU64,
    commit_gate: RwLock<()>,
    changed: Notify,
    // Unix millis of the last committed mutation, 0 before the first one.
    last_commit_ms: AtomicI64,
}

impl Default for DeviceStateTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStateTable {
    pub fn new() -> Self {
        Self::with_tombstone_limit(DEFAULT_TOMBSTONE_LIMIT)
    }

    pub fn with_tombstone_limit(tombstone_limit: usize) -> Self {
        Self {
            cells: DashMap::new(),
            tombstones: DashMap::new(),
            tombstone_limit,
            revision: AtomicU64::new(0),
            commit_gate: RwLock::new(()),
            changed: Notify::new(),
            last_commit_ms: AtomicI64::new(0),
        }
    }

    /// Applies `reading` if it is valid and strictly newer than what is stored
    /// for its device. Flags are derived from `contract` as part of the same
    /// commit.
    pub fn upsert(&self, reading: DeviceReading, contract: Option<&Contract>) -> UpsertOutcome {
        if let Err(reason) = reading.validate() {
            return UpsertOutcome::Rejected(RejectReason::Invalid(reason));
        }

        let identifier = reading.identifier;
        let offered = reading.observed_at;

        let revision = {
            let _gate = self.commit_gate.read();
            match self.cells.entry(identifier) {
                Entry::Occupied(mut cell) => {
                    let stored = cell.get().reading().observed_at;
                    if offered <= stored {
                        return UpsertOutcome::Rejected(RejectReason::Stale { stored, offered });
                    }
                    let revision = self.next_revision();
                    cell.insert(Arc::new(DeviceState::derive(reading, contract, revision)));
                    revision
                }
                Entry::Vacant(cell) => {
                    let removed_at = self.tombstones.get(&identifier).map(|t| *t);
                    if let Some(removed_at) = removed_at {
                        if offered <= removed_at {
                            return UpsertOutcome::Rejected(RejectReason::Removed { removed_at });
                        }
                        self.tombstones.remove(&identifier);
                    }
                    let revision = self.next_revision();
                    cell.insert(Arc::new(DeviceState::derive(reading, contract, revision)));
                    revision
                }
            }
        };

        self.committed();
        UpsertOutcome::Applied { revision }
    }

    /// Removes a device if `observed_at` is strictly newer than its stored
    /// reading, and remembers the removal time as a tombstone. Removals for
    /// devices that are not stored change nothing.
    pub fn remove(&self, identifier: Uuid, observed_at: DateTime<Utc>) -> RemoveOutcome {
        let revision = {
            let _gate = self.commit_gate.read();
            match self.cells.entry(identifier) {
                Entry::Occupied(cell) => {
                    let stored = cell.get().reading().observed_at;
                    if observed_at <= stored {
                        return RemoveOutcome::Rejected(RejectReason::Stale {
                            stored,
                            offered: observed_at,
                        });
                    }
                    let revision = self.next_revision();
                    cell.remove();
                    self.raise_tombstone(identifier, observed_at);
                    revision
                }
                Entry::Vacant(_) => return RemoveOutcome::NotFound,
            }
        };

        self.committed();
        RemoveOutcome::Removed { revision }
    }

    pub fn get(&self, identifier: &Uuid) -> Option<Arc<DeviceState>> {
        self.cells.get(identifier).map(|cell| Arc::clone(cell.value()))
    }

    /// Point-in-time copy of the table. Writers are held off only while the
    /// pointers are copied.
    pub fn snapshot(&self) -> Snapshot {
        let (revision, mut devices) = {
            let _gate = self.commit_gate.write();
            let revision = self.revision.load(Ordering::Acquire);
            let devices: Vec<Arc<DeviceState>> =
                self.cells.iter().map(|cell| Arc::clone(cell.value())).collect();
            (revision, devices)
        };
        devices.sort_unstable_by_key(|s| s.identifier());
        Snapshot { revision, devices }
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Removed devices still remembered.
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Time of the last committed mutation.
    pub fn last_commit_at(&self) -> Option<DateTime<Utc>> {
        match self.last_commit_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    /// Resolves after the next committed mutation. Permits are stored, so a
    /// commit that lands between two waits is not lost. Intended for a single
    /// waiter (the broadcaster).
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    /// Verifies the structural invariants of the table. A failure means the
    /// table is corrupt and the process must not keep serving it.
    pub fn check_invariants(&self) -> Result<()> {
        let snapshot = self.snapshot();
        let mut seen = HashSet::with_capacity(snapshot.len());

        for cell in self.cells.iter() {
            if *cell.key() != cell.value().identifier() {
                return Err(HeatmapError::InvariantViolation(format!(
                    "key {} holds state for {}",
                    cell.key(),
                    cell.value().identifier()
                )));
            }
        }
        for state in &snapshot.devices {
            if !seen.insert(state.identifier()) {
                return Err(HeatmapError::InvariantViolation(format!(
                    "device {} appears twice in one snapshot",
                    state.identifier()
                )));
            }
            if state.revision() > snapshot.revision {
                return Err(HeatmapError::InvariantViolation(format!(
                    "device {} stamped with revision {} beyond table revision {}",
                    state.identifier(),
                    state.revision(),
                    snapshot.revision
                )));
            }
        }
        Ok(())
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn raise_tombstone(&self, identifier: Uuid, observed_at: DateTime<Utc>) {
        self.tombstones
            .entry(identifier)
            .and_modify(|t| {
                if observed_at > *t {
                    *t = observed_at;
                }
            })
            .or_insert(observed_at);

        if self.tombstones.len() > self.tombstone_limit {
            let oldest = self
                .tombstones
                .iter()
                .min_by_key(|t| *t.value())
                .map(|t| *t.key());
            if let Some(oldest) = oldest {
                self.tombstones.remove(&oldest);
            }
        }
    }

    fn committed(&self) {
        self.last_commit_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.changed.notify_one();
    }
}
