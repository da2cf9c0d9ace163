//! Change notifications for observers of the sync engine.
//!
//! Two ways to listen:
//! - [`EventHub::subscribe`] registers a callback invoked synchronously, in
//!   subscription order, on the publishing task.
//! - [`EventHub::receiver`] hands out a broadcast receiver for async consumers.
//!
//! Store writes do not publish directly; they mark the hub dirty and the
//! owning operation calls [`EventHub::flush`] once it is finished, so a
//! multi-step write produces one notification.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Coarse kind of change, for observers that only need to know what to refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChangeKind {
    DataChanged,
    SyncStatusChanged,
}

/// Detail carried by a sync status change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StatusChange {
    /// Connectivity flipped
    Connectivity { online: bool },
    PassStarted,
    PassFinished,
    /// Server state replaced a local edit. Published after the local store
    /// already holds the server's version.
    ConflictResolved {
        operation_id: Uuid,
        local_id: String,
        /// `None` when the record no longer exists on the server
        server_version: Option<i64>,
    },
    /// The server rejected an operation; it will not be retried automatically
    OperationRejected {
        operation_id: Uuid,
        local_id: String,
        message: String,
    },
    /// An operation keeps failing transiently; it is still being retried
    RetryThresholdReached {
        operation_id: Uuid,
        local_id: String,
        attempts: u32,
        message: String,
    },
    /// Counts changed (enqueue, completion, ...)
    Counts,
}

/// Event delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SyncEvent {
    DataChanged,
    SyncStatusChanged(StatusChange),
}

impl SyncEvent {
    pub fn kind(&self) -> ChangeKind {
        match self {
            SyncEvent::DataChanged => ChangeKind::DataChanged,
            SyncEvent::SyncStatusChanged(_) => ChangeKind::SyncStatusChanged,
        }
    }
}

/// Handle returned by [`EventHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&SyncEvent) -> anyhow::Result<()> + Send + Sync>;

/// Publish/subscribe registry for data and sync status changes.
pub struct EventHub {
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<SyncEvent>,
    data_dirty: AtomicBool,
    status_dirty: AtomicBool,
}

impl EventHub {
    /// Create a hub whose broadcast channel buffers `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            sender,
            data_dirty: AtomicBool::new(false),
            status_dirty: AtomicBool::new(false),
        }
    }

    /// Register a callback. Errors and panics raised by the callback are
    /// logged and do not affect other subscribers.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        match self.listeners.lock() {
            Ok(mut listeners) => listeners.push((id, Arc::new(callback))),
            Err(poisoned) => poisoned.into_inner().push((id, Arc::new(callback))),
        }
        debug!(subscription = id.0, "subscriber registered");
        id
    }

    /// Remove a callback. Returns false if the handle was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = match self.listeners.lock() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        before != listeners.len()
    }

    /// Drop every callback subscription.
    pub fn clear(&self) {
        match self.listeners.lock() {
            Ok(mut listeners) => listeners.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    /// Number of callback subscriptions.
    pub fn subscriber_count(&self) -> usize {
        match self.listeners.lock() {
            Ok(listeners) => listeners.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// A receiver for async consumers. Slow receivers may observe `Lagged`.
    pub fn receiver(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Deliver an event to every subscriber now.
    pub fn publish(&self, event: SyncEvent) {
        // Snapshot so callbacks may subscribe/unsubscribe without deadlocking.
        let listeners: Vec<(SubscriptionId, Listener)> = match self.listeners.lock() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(subscription = id.0, error = %e, "subscriber returned an error");
                }
                Err(_) => {
                    warn!(subscription = id.0, "subscriber panicked");
                }
            }
        }

        // No receivers is fine.
        let _ = self.sender.send(event);
    }

    /// Record that a change of `kind` happened without notifying yet.
    pub fn mark_dirty(&self, kind: ChangeKind) {
        match kind {
            ChangeKind::DataChanged => self.data_dirty.store(true, Ordering::Release),
            ChangeKind::SyncStatusChanged => self.status_dirty.store(true, Ordering::Release),
        }
    }

    /// Publish one event per kind marked dirty since the last flush.
    pub fn flush(&self) {
        if self.data_dirty.swap(false, Ordering::AcqRel) {
            self.publish(SyncEvent::DataChanged);
        }
        if self.status_dirty.swap(false, Ordering::AcqRel) {
            self.publish(SyncEvent::SyncStatusChanged(StatusChange::Counts));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(hub: &EventHub) -> (SubscriptionId, Arc<Mutex<Vec<SyncEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = hub.subscribe(move |event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });
        (id, seen)
    }

    #[test]
    fn test_delivery_in_subscription_order() {
        let hub = EventHub::new(16);
        let order = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let order = Arc::clone(&order);
            hub.subscribe(move |_| {
                order.lock().unwrap().push(n);
                Ok(())
            });
        }

        hub.publish(SyncEvent::DataChanged);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_failing_subscriber_does_not_block_others() {
        let hub = EventHub::new(16);
        hub.subscribe(|_| anyhow::bail!("boom"));
        hub.subscribe(|_| panic!("subscriber bug"));
        let (_, seen) = recorder(&hub);

        hub.publish(SyncEvent::DataChanged);
        assert_eq!(*seen.lock().unwrap(), vec![SyncEvent::DataChanged]);
    }

    #[test]
    fn test_unsubscribe() {
        let hub = EventHub::new(16);
        let (id, seen) = recorder(&hub);

        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        hub.publish(SyncEvent::DataChanged);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_flush_coalesces_marks() {
        let hub = EventHub::new(16);
        let (_, seen) = recorder(&hub);

        hub.mark_dirty(ChangeKind::DataChanged);
        hub.mark_dirty(ChangeKind::DataChanged);
        hub.mark_dirty(ChangeKind::SyncStatusChanged);
        hub.flush();
        hub.flush();

        let kinds: Vec<ChangeKind> = seen.lock().unwrap().iter().map(SyncEvent::kind).collect();
        assert_eq!(kinds, vec![ChangeKind::DataChanged, ChangeKind::SyncStatusChanged]);
    }

    #[tokio::test]
    async fn test_broadcast_receiver() {
        let hub = EventHub::new(16);
        let mut rx = hub.receiver();

        hub.publish(SyncEvent::SyncStatusChanged(StatusChange::Connectivity { online: true }));
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            SyncEvent::SyncStatusChanged(StatusChange::Connectivity { online: true })
        );
    }
}
