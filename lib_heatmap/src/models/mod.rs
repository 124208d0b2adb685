//! # Data Model
//!
//! Plain values shared by every part of the core: upstream readings, contract
//! bounds, derived state, and the versioned wire format pushed to map clients.

/// Per-device contract bounds and the read-only contract book.
pub mod contract;
/// Device readings and the upstream message parser.
pub mod reading;
/// Derived flags, marker status and the committed device state.
pub mod state;
/// Snapshot frames as serialized for subscribers.
pub mod wire;

pub use contract::{Bounds, Contract, ContractBook, PressureBounds};
pub use reading::{DeviceReading, FeedRecord, SensorPayload};
pub use state::{DerivedFlags, DeviceState, MarkerStatus};
pub use wire::{DeviceView, FrameKind, SnapshotFrame, WIRE_VERSION};
