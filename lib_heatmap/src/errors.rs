//! # Error Taxonomy
//!
//! Every failure the aggregation core can observe falls into one of the
//! variants below. All of them except `InvariantViolation` are recovered
//! locally: the offending message is dropped or the offending subscriber is
//! unregistered, and the rest of the system carries on.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::core::registry::SubscriptionId;

/// Errors raised by the heatmap core.
#[derive(Debug, Error)]
pub enum HeatmapError {
    /// An upstream payload could not be parsed, failed schema validation, or
    /// carried a reading that failed basic validation (nil identifier,
    /// coordinates off the map).
    #[error("malformed message from feed '{feed}': {reason}")]
    MalformedMessage {
        /// The feed the payload arrived on.
        feed: String,
        /// Human-readable description of the violation.
        reason: String,
    },

    /// A valid reading or removal was refused by the state table because it is
    /// not newer than what is stored (stale, duplicate, or predating a removal).
    #[error("update for device {identifier} rejected: {reason}")]
    RejectedUpdate {
        /// Device the reading was addressed to.
        identifier: Uuid,
        /// Why the table refused it.
        reason: String,
    },

    /// An upstream transport went away. Reconnecting is the feed's job.
    #[error("feed '{feed}' disconnected: {reason}")]
    FeedDisconnected {
        /// The feed that dropped.
        feed: String,
        /// Transport-level reason.
        reason: String,
    },

    /// A push to a subscriber failed or timed out.
    #[error("subscriber {id} unreachable: {reason}")]
    SubscriberUnreachable {
        /// The subscription that could not be reached.
        id: SubscriptionId,
        /// Write error or timeout description.
        reason: String,
    },

    /// The contract reference data could not be loaded.
    #[error("failed to load contracts from {path}: {reason}")]
    ContractLoad {
        /// File the contracts were read from.
        path: PathBuf,
        /// Parse or validation failure.
        reason: String,
    },

    /// Internal table corruption. Never expected under correct usage; callers
    /// must treat it as fatal.
    #[error("state table invariant violated: {0}")]
    InvariantViolation(String),
}

impl HeatmapError {
    /// Only invariant violations are unrecoverable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HeatmapError::InvariantViolation(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HeatmapError>;
