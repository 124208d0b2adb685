//! # lib_heatmap
//!
//! Streaming sensor-state aggregation for the heating-network map. Upstream
//! feeds push device readings in; the core keeps the latest state per device,
//! evaluates it against contracted bounds, and fans consistent snapshots out
//! to every connected map client.
//!
//! The always-on modules (`core`, `models`, `errors`) carry no transport. The
//! feed clients and the log setup sit behind the `ingestors` and `loggers`
//! features so a test harness can depend on the core alone.

#![forbid(unsafe_code)]

pub mod core;
pub mod errors;
pub mod models;

#[cfg(feature = "ingestors")]
pub mod ingestors;

#[cfg(feature = "loggers")]
pub mod loggers;

// --- Public API Re-exports ---
pub use errors::{HeatmapError, Result};
pub use models::{Contract, ContractBook, DeviceReading, DeviceState, SnapshotFrame};
pub use self::core::{
    DeliveryMode, DeviceStateTable, IngestCoordinator, SnapshotBroadcaster, SubscriptionRegistry,
};
