//! # Logging Module
//!
//! Process-wide `tracing` installation: an `EnvFilter`, a console layer and a
//! daily-rolling JSON file layer, plus housekeeping for old log files.

#![forbid(unsafe_code)]

/// Subscriber installation and log file retention.
pub mod tracing_setup;

pub use tracing_setup::{cleanup_old_logs, init_tracing, LogSettings};
