//! # Subscription Registry
//!
//! Tracks every connected map client: the sending half of its bounded queue,
//! its delivery mode, and the cancellation token that tears down its socket
//! task. Backlog depth is read straight off the queue, so there is no counter
//! to drift out of sync.
//!
//! Unregistration is idempotent and cancels the subscriber's token, which is
//! how an in-flight push to a dropped subscriber gets abandoned.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::table::Snapshot;

/// Opaque handle for one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// How frames are encoded for a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Every push carries the whole table.
    #[default]
    Full,
    /// One full frame, then per-device upsert/remove records.
    Incremental,
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(DeliveryMode::Full),
            "incremental" | "delta" => Ok(DeliveryMode::Incremental),
            other => Err(format!("unknown delivery mode '{}'", other)),
        }
    }
}

/// Why a subscription ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnregisterReason {
    ClientClosed,
    BacklogExceeded { depth: usize },
    Unreachable(String),
    Shutdown,
}

impl fmt::Display for UnregisterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnregisterReason::ClientClosed => write!(f, "client closed"),
            UnregisterReason::BacklogExceeded { depth } => write!(f, "backlog exceeded ({} queued)", depth),
            UnregisterReason::Unreachable(reason) => write!(f, "unreachable: {}", reason),
            UnregisterReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// What a caller hands over to be registered.
pub struct SubscriberChannel {
    pub sender: mpsc::Sender<Arc<Snapshot>>,
    pub mode: DeliveryMode,
    pub cancel: CancellationToken,
    pub registered_at_revision: u64,
}

struct SubscriberHandle {
    sender: mpsc::Sender<Arc<Snapshot>>,
    mode: DeliveryMode,
    cancel: CancellationToken,
    registered_at_revision: u64,
    connected_at: DateTime<Utc>,
}

/// Diagnostics row for one active subscriber.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberInfo {
    pub id: SubscriptionId,
    pub mode: DeliveryMode,
    pub backlog: usize,
    pub registered_at_revision: u64,
    pub connected_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    subscribers: DashMap<SubscriptionId, SubscriberHandle>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, channel: SubscriberChannel) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.subscribers.insert(
            id,
            SubscriberHandle {
                sender: channel.sender,
                mode: channel.mode,
                cancel: channel.cancel,
                registered_at_revision: channel.registered_at_revision,
                connected_at: Utc::now(),
            },
        );
        tracing::info!(
            subscription = %id,
            mode = ?channel.mode,
            revision = channel.registered_at_revision,
            "subscriber registered"
        );
        id
    }

    /// Removes a subscription and cancels its token. Returns `false` if it was
    /// already gone, which is not an error.
    pub fn unregister(&self, id: SubscriptionId, reason: UnregisterReason) -> bool {
        match self.subscribers.remove(&id) {
            Some((_, handle)) => {
                handle.cancel.cancel();
                match &reason {
                    UnregisterReason::ClientClosed | UnregisterReason::Shutdown => {
                        tracing::info!(subscription = %id, %reason, "subscriber unregistered")
                    }
                    _ => tracing::warn!(subscription = %id, %reason, "subscriber dropped"),
                }
                true
            }
            None => false,
        }
    }

    pub fn list_active(&self) -> BTreeSet<SubscriptionId> {
        self.subscribers.iter().map(|e| *e.key()).collect()
    }

    pub fn is_active(&self, id: SubscriptionId) -> bool {
        self.subscribers.contains_key(&id)
    }

    /// Frames queued and not yet taken by the subscriber's task.
    pub fn backlog(&self, id: SubscriptionId) -> Option<usize> {
        self.subscribers.get(&id).map(|h| queued(&h.sender))
    }

    pub fn mode(&self, id: SubscriptionId) -> Option<DeliveryMode> {
        self.subscribers.get(&id).map(|h| h.mode)
    }

    /// Clones out the senders so the caller can push without holding any
    /// registry lock.
    pub fn senders(&self) -> Vec<(SubscriptionId, mpsc::Sender<Arc<Snapshot>>)> {
        self.subscribers
            .iter()
            .map(|e| (*e.key(), e.value().sender.clone()))
            .collect()
    }

    pub fn info(&self) -> Vec<SubscriberInfo> {
        let mut rows: Vec<SubscriberInfo> = self
            .subscribers
            .iter()
            .map(|e| SubscriberInfo {
                id: *e.key(),
                mode: e.value().mode,
                backlog: queued(&e.value().sender),
                registered_at_revision: e.value().registered_at_revision,
                connected_at: e.value().connected_at,
            })
            .collect();
        rows.sort_by_key(|r| r.id);
        rows
    }

    /// Unregisters everyone. Used at shutdown.
    pub fn cancel_all(&self, reason: UnregisterReason) -> usize {
        self.list_active()
            .into_iter()
            .filter(|id| self.unregister(*id, reason.clone()))
            .count()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

fn queued<T>(sender: &mpsc::Sender<T>) -> usize {
    sender.max_capacity() - sender.capacity()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(capacity: usize) -> (SubscriberChannel, mpsc::Receiver<Arc<Snapshot>>, CancellationToken) {
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        let ch = SubscriberChannel {
            sender: tx,
            mode: DeliveryMode::Full,
            cancel: cancel.clone(),
            registered_at_revision: 0,
        };
        (ch, rx, cancel)
    }

    #[test]
    fn test_register_list_unregister() {
        let registry = SubscriptionRegistry::new();
        let (a, _rx_a, cancel_a) = channel(4);
        let (b, _rx_b, _) = channel(4);
        let id_a = registry.register(a);
        let id_b = registry.register(b);

        assert_ne!(id_a, id_b);
        assert_eq!(registry.list_active(), [id_a, id_b].into_iter().collect());

        assert!(registry.unregister(id_a, UnregisterReason::ClientClosed));
        assert!(cancel_a.is_cancelled());
        assert!(!registry.unregister(id_a, UnregisterReason::ClientClosed));
        assert_eq!(registry.list_active(), [id_b].into_iter().collect());
    }

    #[test]
    fn test_backlog_tracks_queue_depth() {
        let registry = SubscriptionRegistry::new();
        let (ch, mut rx, _) = channel(4);
        let id = registry.register(ch);
        let (_, sender) = registry.senders().pop().unwrap();

        sender.try_send(Arc::new(Snapshot::default())).unwrap();
        sender.try_send(Arc::new(Snapshot::default())).unwrap();
        assert_eq!(registry.backlog(id), Some(2));

        rx.try_recv().unwrap();
        assert_eq!(registry.backlog(id), Some(1));
        assert_eq!(registry.info()[0].backlog, 1);
    }

    #[test]
    fn test_cancel_all() {
        let registry = SubscriptionRegistry::new();
        let tokens: Vec<_> = (0..3)
            .map(|_| {
                let (ch, _rx, cancel) = channel(1);
                registry.register(ch);
                cancel
            })
            .collect();
        assert_eq!(registry.cancel_all(UnregisterReason::Shutdown), 3);
        assert!(registry.is_empty());
        assert!(tokens.iter().all(|t| t.is_cancelled()));
    }

    #[test]
    fn test_delivery_mode_parse() {
        assert_eq!("incremental".parse::<DeliveryMode>().unwrap(), DeliveryMode::Incremental);
        assert_eq!("FULL".parse::<DeliveryMode>().unwrap(), DeliveryMode::Full);
        assert!("diff-o-matic".parse::<DeliveryMode>().is_err());
    }
}
