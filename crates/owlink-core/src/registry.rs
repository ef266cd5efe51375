// ── Bus-master registry ──
//
// Thread-safe directory of live bus masters. Mutations go through one
// mutex; membership is mirrored into a watch channel for snapshot and
// stream consumers. Observers get a replayed "added" event for every
// bus master present at subscribe time before any later event, then
// in-order add/remove delivery from a dedicated dispatch task that
// never holds the registry lock.

use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_core::Stream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::master::BusMaster;

// ── Observer capability ─────────────────────────────────────────────

/// Receives membership changes from a [`BusMasterRegistry`].
#[async_trait]
pub trait RegistryObserver: Send + Sync {
    async fn on_bus_master_changed(&self, master: BusMaster, added: bool);
}

// ── Registry ────────────────────────────────────────────────────────

struct ObserverEntry {
    id: u64,
    tx: mpsc::UnboundedSender<(BusMaster, bool)>,
}

struct RegistryState {
    /// Insertion order is preserved: replay delivers bus masters in the
    /// order they were added.
    masters: Vec<BusMaster>,
    observers: Vec<ObserverEntry>,
    next_observer_id: u64,
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    snapshot: watch::Sender<Arc<Vec<BusMaster>>>,
}

/// Observable directory of live bus masters.
///
/// The registry owns visibility, not lifecycle: a bus master must
/// already report itself started before it may be added, and removing
/// one does not stop it.
#[derive(Clone)]
pub struct BusMasterRegistry {
    inner: Arc<RegistryInner>,
}

impl BusMasterRegistry {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState {
                    masters: Vec::new(),
                    observers: Vec::new(),
                    next_observer_id: 0,
                }),
                snapshot,
            }),
        }
    }

    // ── Membership ───────────────────────────────────────────────

    pub async fn add(&self, master: BusMaster) -> Result<(), RegistryError> {
        if master.name().is_empty() {
            return Err(RegistryError::Unnamed);
        }
        if !master.is_started() {
            return Err(RegistryError::NotStarted {
                name: master.name().to_owned(),
            });
        }

        let mut state = self.inner.state.lock().await;
        if state.masters.iter().any(|m| m.name() == master.name()) {
            return Err(RegistryError::AlreadyRegistered {
                name: master.name().to_owned(),
            });
        }

        state.masters.push(master.clone());
        self.publish(&state);
        for observer in &state.observers {
            let _ = observer.tx.send((master.clone(), true));
        }
        info!(master = master.name(), "bus master registered");
        Ok(())
    }

    pub async fn remove(&self, master: &BusMaster) -> Result<(), RegistryError> {
        let mut state = self.inner.state.lock().await;
        let Some(index) = state.masters.iter().position(|m| m.name() == master.name()) else {
            return Err(RegistryError::NotRegistered {
                name: master.name().to_owned(),
            });
        };

        let removed = state.masters.remove(index);
        self.publish(&state);
        for observer in &state.observers {
            let _ = observer.tx.send((removed.clone(), false));
        }
        info!(master = removed.name(), "bus master deregistered");
        Ok(())
    }

    /// Look up a bus master by name.
    pub async fn get(&self, name: &str) -> Option<BusMaster> {
        self.inner
            .state
            .lock()
            .await
            .masters
            .iter()
            .find(|m| m.name() == name)
            .cloned()
    }

    /// Current membership (cheap `Arc` clone).
    pub fn snapshot(&self) -> Arc<Vec<BusMaster>> {
        self.inner.snapshot.borrow().clone()
    }

    // ── Observation ──────────────────────────────────────────────

    /// Register an observer. An "added" event is replayed for every
    /// currently-registered bus master before this returns, so the
    /// observer never needs a separate initial snapshot call. Later
    /// events arrive in registry order from a dedicated dispatch task.
    pub async fn subscribe(&self, observer: Arc<dyn RegistryObserver>) -> RegistrySubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let (id, replay) = {
            let mut state = self.inner.state.lock().await;
            let id = state.next_observer_id;
            state.next_observer_id += 1;
            state.observers.push(ObserverEntry { id, tx });
            (id, state.masters.clone())
        };

        // Events racing the replay wait in the channel: the dispatch
        // task is not spawned until the replay finishes.
        for master in replay {
            observer.on_bus_master_changed(master, true).await;
        }

        let cancel = CancellationToken::new();
        tokio::spawn(dispatch_task(
            Arc::downgrade(&self.inner),
            id,
            rx,
            observer,
            cancel.clone(),
        ));
        RegistrySubscription { cancel }
    }

    /// Watch-based membership stream, for consumers who prefer snapshot
    /// diffing over the observer capability.
    pub fn stream(&self) -> BusMasterStream {
        BusMasterStream::new(self.inner.snapshot.subscribe())
    }

    fn publish(&self, state: &RegistryState) {
        let masters = state.masters.clone();
        self.inner
            .snapshot
            .send_modify(|snap| *snap = Arc::new(masters));
    }
}

impl Default for BusMasterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── Subscription handle ─────────────────────────────────────────────

/// Handle to an active observer registration. Cancelling (or dropping)
/// stops further delivery; an event already dispatched to the observer
/// is not recalled.
pub struct RegistrySubscription {
    cancel: CancellationToken,
}

impl RegistrySubscription {
    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RegistrySubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn dispatch_task(
    registry: Weak<RegistryInner>,
    id: u64,
    mut rx: mpsc::UnboundedReceiver<(BusMaster, bool)>,
    observer: Arc<dyn RegistryObserver>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = rx.recv() => {
                let Some((master, added)) = event else { break };
                observer.on_bus_master_changed(master, added).await;
            }
        }
    }

    if let Some(inner) = registry.upgrade() {
        inner.state.lock().await.observers.retain(|entry| entry.id != id);
        debug!(observer = id, "registry observer detached");
    }
}

// ── Membership stream ───────────────────────────────────────────────

/// A subscription to registry membership snapshots.
pub struct BusMasterStream {
    current: Arc<Vec<BusMaster>>,
    receiver: watch::Receiver<Arc<Vec<BusMaster>>>,
}

impl BusMasterStream {
    fn new(receiver: watch::Receiver<Arc<Vec<BusMaster>>>) -> Self {
        let current = receiver.borrow().clone();
        Self { current, receiver }
    }

    /// The snapshot captured at creation time.
    pub fn current(&self) -> &Arc<Vec<BusMaster>> {
        &self.current
    }

    /// The latest snapshot (may have changed since creation).
    pub fn latest(&self) -> Arc<Vec<BusMaster>> {
        self.receiver.borrow().clone()
    }

    /// Wait for the next membership change. Returns `None` once the
    /// registry has been dropped.
    pub async fn changed(&mut self) -> Option<Arc<Vec<BusMaster>>> {
        self.receiver.changed().await.ok()?;
        let snap = self.receiver.borrow_and_update().clone();
        self.current = snap.clone();
        Some(snap)
    }

    /// Convert into a `Stream` for use with `StreamExt` combinators.
    pub fn into_stream(self) -> BusMasterWatchStream {
        BusMasterWatchStream {
            inner: WatchStream::new(self.receiver),
        }
    }
}

/// `Stream` adapter backed by the registry's `watch` channel.
pub struct BusMasterWatchStream {
    inner: WatchStream<Arc<Vec<BusMaster>>>,
}

impl Stream for BusMasterWatchStream {
    type Item = Arc<Vec<BusMaster>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
