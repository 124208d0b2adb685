//! # Core Engine Module
//!
//! The heart of the heatmap service: everything between "a reading arrived"
//! and "a map client got a frame".
//!
//! ## Core Components:
//!
//! - **`table`**: The authoritative device state table. Per-device cells with
//!   compare-and-update on observation time, a global revision counter, and
//!   point-in-time snapshots.
//!
//! - **`evaluator`**: Pure contract evaluation producing the correctness flags
//!   stored alongside each reading.
//!
//! - **`ingest`**: The transport-agnostic coordinator that parses feed payloads
//!   and commits them to the table.
//!
//! - **`registry`**: Connected subscribers, their bounded queues and their
//!   cancellation tokens.
//!
//! - **`broadcaster`**: Zero-copy fan-out of snapshots to every registered
//!   subscriber, with backpressure and change coalescing.

#![forbid(unsafe_code)]

/// Per-device state with a global revision and consistent snapshots.
pub mod table;
/// Contract evaluation rules.
pub mod evaluator;
/// Payload parsing and commit path for upstream feeds.
pub mod ingest;
/// Active subscriber bookkeeping.
pub mod registry;
/// Snapshot fan-out to subscribers.
pub mod broadcaster;

// --- Public API Re-exports ---
pub use broadcaster::{BroadcastConfig, BroadcastStats, PushCadence, PushReport, SnapshotBroadcaster, Subscription};
pub use evaluator::evaluate;
pub use ingest::{channel_stream, FeedDisconnected, FeedEvent, IngestCoordinator, IngestReport, IngestStats};
pub use registry::{DeliveryMode, SubscriberInfo, SubscriptionId, SubscriptionRegistry, UnregisterReason};
pub use table::{DeviceStateTable, RejectReason, RemoveOutcome, Snapshot, UpsertOutcome};
