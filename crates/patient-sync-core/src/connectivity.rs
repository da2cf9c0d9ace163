//! Online/offline tracking.
//!
//! The application reports reachability through a [`ConnectivityHandle`]
//! (for instance from a platform network callback). The
//! [`ConnectivityMonitor`] watches the paired [`ConnectivitySignal`] and emits
//! an event on every real transition. No polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::events::{EventHub, StatusChange, SyncEvent};

/// Connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn from_online(online: bool) -> Self {
        if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        }
    }

    pub fn is_online(self) -> bool {
        self == Connectivity::Online
    }
}

/// Create a linked handle/signal pair with the current reachability.
pub fn channel(initially_online: bool) -> (ConnectivityHandle, ConnectivitySignal) {
    let (tx, rx) = watch::channel(initially_online);
    (ConnectivityHandle { tx }, ConnectivitySignal { rx })
}

/// Application side: reports reachability changes.
#[derive(Debug, Clone)]
pub struct ConnectivityHandle {
    tx: watch::Sender<bool>,
}

impl ConnectivityHandle {
    pub fn set_online(&self, online: bool) {
        // Only wake watchers on an actual change.
        self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Engine side: current reachability plus change notifications.
#[derive(Debug, Clone)]
pub struct ConnectivitySignal {
    rx: watch::Receiver<bool>,
}

impl ConnectivitySignal {
    pub fn is_reachable(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Tracks `Online ⇄ Offline` and emits transitions.
pub struct ConnectivityMonitor {
    online: Arc<AtomicBool>,
    transitions: broadcast::Sender<Connectivity>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityMonitor {
    /// Read the initial state from `signal` and start watching it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(signal: ConnectivitySignal, hub: Arc<EventHub>) -> Self {
        let mut rx = signal.rx;
        let initial = *rx.borrow_and_update();
        let online = Arc::new(AtomicBool::new(initial));
        let (transitions, _) = broadcast::channel(16);

        let state = Arc::clone(&online);
        let sender = transitions.clone();
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let now_online = *rx.borrow_and_update();
                let was_online = state.swap(now_online, Ordering::AcqRel);
                if was_online == now_online {
                    continue;
                }
                let connectivity = Connectivity::from_online(now_online);
                info!(?connectivity, "connectivity changed");
                hub.publish(SyncEvent::SyncStatusChanged(StatusChange::Connectivity {
                    online: now_online,
                }));
                let _ = sender.send(connectivity);
            }
            debug!("connectivity signal closed");
        });

        debug!(online = initial, "connectivity monitor started");
        Self {
            online,
            transitions,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn state(&self) -> Connectivity {
        Connectivity::from_online(self.is_online())
    }

    /// Receiver of future transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<Connectivity> {
        self.transitions.subscribe()
    }

    /// Stop watching. No transitions are emitted afterwards.
    pub fn stop(&self) {
        let task = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
            debug!("connectivity monitor stopped");
        }
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
