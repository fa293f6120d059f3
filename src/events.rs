//! Change notifications.
//!
//! The registry emits `RegistryChanged` after every mutation and the cache
//! emits `CacheInvalidated` whenever it drops entries for a reason other than
//! capacity pressure. Listeners are registered explicitly and called
//! synchronously on the mutating thread, after internal locks are released.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerId(Uuid);

impl ListenerId {
    /// Creates a new random listener ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What happened to a target registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Target registered or re-verified.
    Added,
    /// Target deleted.
    Removed,
    /// Target marked inactive.
    Deactivated,
    /// Target marked active again.
    Activated,
}

/// Emitted by the registry after a mutation has been applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryChanged {
    /// Changed association.
    pub association: String,
    /// Changed target kind.
    pub target_kind: String,
    /// What happened.
    pub kind: ChangeKind,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// Why cache entries were dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidationReason {
    /// Explicit `invalidate` call.
    Manual,
    /// Triggered by a `RegistryChanged` event.
    RegistryChange,
    /// Removed by the background or on-demand TTL sweep.
    TtlExpire,
}

/// Emitted by the cache after entries have been removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInvalidated {
    /// Why the entries were removed.
    pub reason: InvalidationReason,
    /// Associations whose entries were removed (sorted, deduplicated).
    pub associations: Vec<String>,
    /// Number of entries removed.
    pub removed: usize,
    /// When they were removed.
    pub at: DateTime<Utc>,
}

/// Consumer of change notifications (cache, UI layer, audit log, ...).
///
/// Both methods default to no-ops so consumers implement only what they need.
/// Implementations must not call back into the emitter's mutation API.
pub trait ChangeListener: Send + Sync {
    /// Called after a registry mutation.
    fn on_registry_changed(&self, _event: &RegistryChanged) {}

    /// Called after cache entries were invalidated.
    fn on_cache_invalidated(&self, _event: &CacheInvalidated) {}
}

/// Either kind of change, as delivered by `ChannelListener`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A registry mutation.
    Registry(RegistryChanged),
    /// A cache invalidation.
    Cache(CacheInvalidated),
}

/// Forwards events onto a bounded channel.
///
/// Sends never block the emitting thread: when the receiver is slow or gone
/// the event is dropped and counted.
#[derive(Debug)]
pub struct ChannelListener {
    tx: Sender<ChangeEvent>,
    dropped: AtomicU64,
}

impl ChannelListener {
    /// Creates a listener and the receiving end of its channel.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, Receiver<ChangeEvent>) {
        let (tx, rx) = bounded(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Number of events dropped because the channel was full or closed.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn forward(&self, event: ChangeEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl ChangeListener for ChannelListener {
    fn on_registry_changed(&self, event: &RegistryChanged) {
        self.forward(ChangeEvent::Registry(event.clone()));
    }

    fn on_cache_invalidated(&self, event: &CacheInvalidated) {
        self.forward(ChangeEvent::Cache(event.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed(kind: ChangeKind) -> RegistryChanged {
        RegistryChanged {
            association: "loggable".to_string(),
            target_kind: "jobs".to_string(),
            kind,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_channel_listener_forwards() {
        let (listener, rx) = ChannelListener::new(4);
        listener.on_registry_changed(&changed(ChangeKind::Added));
        let ev = rx.try_recv().unwrap();
        assert!(matches!(ev, ChangeEvent::Registry(RegistryChanged { kind: ChangeKind::Added, .. })));
        assert_eq!(listener.dropped_events(), 0);
    }

    #[test]
    fn test_channel_listener_drops_when_full() {
        let (listener, rx) = ChannelListener::new(1);
        listener.on_registry_changed(&changed(ChangeKind::Added));
        listener.on_registry_changed(&changed(ChangeKind::Removed));
        assert_eq!(listener.dropped_events(), 1);
        drop(rx);
        listener.on_cache_invalidated(&CacheInvalidated {
            reason: InvalidationReason::Manual,
            associations: vec![],
            removed: 0,
            at: Utc::now(),
        });
        assert_eq!(listener.dropped_events(), 2);
    }

    #[test]
    fn test_invalidation_reason_serde() {
        let json = serde_json::to_string(&InvalidationReason::TtlExpire).unwrap();
        assert_eq!(json, "\"ttl-expire\"");
    }
}
