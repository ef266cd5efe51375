// ── Cross-bus-master device discovery ──
//
// A DeviceLocator watches the registry, keeps a periodic search running
// on every known bus master, and invokes the caller's handler exactly
// once per observation of a still-outstanding target address -- even for
// bus masters that appear after the wait began.
//
// Exactly-once discipline: an observed address is *claimed* (removed
// from the outstanding set) under the lock, the handler runs with the
// lock released, and a `false` return re-inserts it. The handler may
// therefore call back into this engine without deadlocking.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use owlink_bus::{DeviceAddress, SearchData, SearchKind};

use crate::config::LocatorConfig;
use crate::error::{LocatorError, ScheduleError};
use crate::master::BusMaster;
use crate::notify::SearchSubscriber;
use crate::registry::{BusMasterRegistry, RegistryObserver, RegistrySubscription};

// ── Handler capability ──────────────────────────────────────────────

/// Invoked once per observation of an outstanding address.
///
/// Return `true` to retire the address now; `false` keeps it
/// outstanding for future search results.
#[async_trait]
pub trait DeviceFoundHandler: Send + Sync {
    async fn device_found(&self, master: BusMaster, address: DeviceAddress, kind: SearchKind)
        -> bool;
}

// ── Locator ─────────────────────────────────────────────────────────

struct LocatorState {
    outstanding: HashSet<DeviceAddress>,
    /// Bus masters we hold an active notify-search subscription on.
    buses: Vec<BusMaster>,
    registry_sub: Option<RegistrySubscription>,
    /// A subscribe() is in progress; its completion owns the decision
    /// to store or immediately tear down the subscription.
    arming: bool,
    /// Claimed addresses whose handler call has not finished yet; they
    /// may be re-inserted, so teardown waits for them.
    claims_in_progress: usize,
}

struct LocatorInner {
    registry: BusMasterRegistry,
    handler: Arc<dyn DeviceFoundHandler>,
    kind: SearchKind,
    poll_period: Duration,
    subscriber: Arc<dyn SearchSubscriber>,
    observer: Arc<dyn RegistryObserver>,
    state: Mutex<LocatorState>,
}

/// Cross-bus-master device discovery engine.
///
/// Dormant until `add_addresses` arms it; fully retired again once the
/// last outstanding address is found or cancelled, after which a fresh
/// `add_addresses` call re-arms it. Retire or cancel every address
/// before dropping the last handle, or the per-bus search
/// subscriptions keep polling.
#[derive(Clone)]
pub struct DeviceLocator {
    inner: Arc<LocatorInner>,
}

impl DeviceLocator {
    pub fn new(
        registry: BusMasterRegistry,
        handler: Arc<dyn DeviceFoundHandler>,
        kind: SearchKind,
        config: &LocatorConfig,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<LocatorInner>| LocatorInner {
            registry,
            handler,
            kind,
            poll_period: config.poll_period,
            subscriber: Arc::new(LocatorSubscriber {
                inner: weak.clone(),
            }),
            observer: Arc::new(LocatorObserver {
                inner: weak.clone(),
            }),
            state: Mutex::new(LocatorState {
                outstanding: HashSet::new(),
                buses: Vec::new(),
                registry_sub: None,
                arming: false,
                claims_in_progress: 0,
            }),
        });
        Self { inner }
    }

    /// Begin tracking `addresses`. Rejects requests containing duplicate
    /// or already-tracked addresses before mutating anything.
    pub async fn add_addresses(&self, addresses: &[DeviceAddress]) -> Result<(), LocatorError> {
        if addresses.is_empty() {
            return Ok(());
        }
        let mut seen = HashSet::new();
        for addr in addresses {
            if !seen.insert(*addr) {
                return Err(LocatorError::DuplicateAddress(*addr));
            }
        }

        let must_arm = {
            let mut state = self.inner.state.lock().await;
            for addr in addresses {
                if state.outstanding.contains(addr) {
                    return Err(LocatorError::AlreadyTracked(*addr));
                }
            }
            state.outstanding.extend(addresses.iter().copied());

            if state.registry_sub.is_none() && !state.arming {
                state.arming = true;
                true
            } else {
                false
            }
        };

        if must_arm {
            self.arm().await;
        }
        Ok(())
    }

    /// Stop tracking one address. Fails with `NotTracked` if it is not
    /// outstanding (never found, already found, or already cancelled).
    pub async fn cancel_address(&self, address: &DeviceAddress) -> Result<(), LocatorError> {
        {
            let mut state = self.inner.state.lock().await;
            if !state.outstanding.remove(address) {
                return Err(LocatorError::NotTracked(*address));
            }
        }
        self.teardown_if_idle().await;
        Ok(())
    }

    /// Addresses still being searched for.
    pub async fn outstanding(&self) -> Vec<DeviceAddress> {
        self.inner
            .state
            .lock()
            .await
            .outstanding
            .iter()
            .copied()
            .collect()
    }

    // ── Arming / teardown ────────────────────────────────────────

    /// Subscribe to the registry; the replay schedules a search on every
    /// bus master already present.
    async fn arm(&self) {
        let sub = self
            .inner
            .registry
            .subscribe(Arc::clone(&self.inner.observer))
            .await;

        let keep = {
            let mut state = self.inner.state.lock().await;
            state.arming = false;
            if state.outstanding.is_empty() && state.claims_in_progress == 0 {
                // Everything was found or cancelled while the replay ran.
                false
            } else {
                state.registry_sub = Some(sub);
                true
            }
        };

        if !keep {
            self.teardown_now(None).await;
        }
    }

    async fn teardown_if_idle(&self) {
        let sub = {
            let mut state = self.inner.state.lock().await;
            if !state.outstanding.is_empty()
                || state.claims_in_progress > 0
                || state.arming
            {
                return;
            }
            if state.registry_sub.is_none() && state.buses.is_empty() {
                return;
            }
            state.registry_sub.take()
        };
        self.teardown_now(sub).await;
    }

    async fn teardown_now(&self, sub: Option<RegistrySubscription>) {
        if let Some(sub) = sub {
            sub.unsubscribe();
        }
        let buses = std::mem::take(&mut self.inner.state.lock().await.buses);
        for bus in buses {
            let _ = bus
                .cancel_scheduled_notify_search(&self.inner.subscriber, self.inner.kind)
                .await;
        }
        debug!(kind = %self.inner.kind, "locator retired");
    }

    // ── Registry events ──────────────────────────────────────────

    async fn bus_added(&self, master: BusMaster) {
        {
            let mut state = self.inner.state.lock().await;
            if state.outstanding.is_empty() && state.claims_in_progress == 0 {
                return;
            }
            if state.buses.iter().any(|b| b.name() == master.name()) {
                return;
            }
            state.buses.push(master.clone());
        }

        match master
            .schedule_notify_search(&self.inner.subscriber, self.inner.kind, self.inner.poll_period)
            .await
        {
            Ok(()) => {
                debug!(master = master.name(), kind = %self.inner.kind, "locator watching bus master");
            }
            Err(ScheduleError::AlreadyScheduled) => {
                debug!(master = master.name(), "locator already watching bus master");
            }
            Err(err) => {
                warn!(master = master.name(), error = %err, "locator could not watch bus master");
                let mut state = self.inner.state.lock().await;
                state.buses.retain(|b| b.name() != master.name());
            }
        }
    }

    async fn bus_removed(&self, master: &BusMaster) {
        let watching = {
            let mut state = self.inner.state.lock().await;
            let before = state.buses.len();
            state.buses.retain(|b| b.name() != master.name());
            state.buses.len() != before
        };
        if watching {
            let _ = master
                .cancel_scheduled_notify_search(&self.inner.subscriber, self.inner.kind)
                .await;
            debug!(master = master.name(), "locator released removed bus master");
        }
    }

    // ── Search results ───────────────────────────────────────────

    async fn search_result(&self, master: BusMaster, data: Arc<SearchData>) {
        let claimed: Vec<DeviceAddress> = {
            let mut state = self.inner.state.lock().await;
            let claimed: Vec<DeviceAddress> = data
                .devices
                .iter()
                .filter(|addr| state.outstanding.remove(*addr))
                .copied()
                .collect();
            state.claims_in_progress += claimed.len();
            claimed
        };

        for address in claimed {
            let retire = self
                .inner
                .handler
                .device_found(master.clone(), address, self.inner.kind)
                .await;

            let mut state = self.inner.state.lock().await;
            state.claims_in_progress -= 1;
            if retire {
                debug!(master = master.name(), %address, "device found and retired");
            } else {
                state.outstanding.insert(address);
            }
        }

        self.teardown_if_idle().await;
    }
}

// ── Capability adapters ─────────────────────────────────────────────
//
// Weak back-references: dropping every DeviceLocator handle must not be
// kept alive by the registry or a notifier still holding its adapters.

struct LocatorObserver {
    inner: Weak<LocatorInner>,
}

#[async_trait]
impl RegistryObserver for LocatorObserver {
    async fn on_bus_master_changed(&self, master: BusMaster, added: bool) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let locator = DeviceLocator { inner };
        if added {
            locator.bus_added(master).await;
        } else {
            locator.bus_removed(&master).await;
        }
    }
}

struct LocatorSubscriber {
    inner: Weak<LocatorInner>,
}

#[async_trait]
impl SearchSubscriber for LocatorSubscriber {
    async fn on_search_result(&self, master: BusMaster, _kind: SearchKind, data: Arc<SearchData>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        DeviceLocator { inner }.search_result(master, data).await;
    }
}

// ── Blocking-wait convenience ───────────────────────────────────────

struct WaitHandler {
    tx: Mutex<Option<oneshot::Sender<BusMaster>>>,
}

#[async_trait]
impl DeviceFoundHandler for WaitHandler {
    async fn device_found(
        &self,
        master: BusMaster,
        _address: DeviceAddress,
        _kind: SearchKind,
    ) -> bool {
        if let Some(tx) = self.tx.lock().await.take() {
            let _ = tx.send(master);
        }
        true
    }
}

/// Wait until `address` surfaces on any registered bus master, up to
/// `timeout`. Built on [`DeviceLocator`] plus a oneshot channel; the
/// timeout is cooperative.
pub async fn wait_for_device(
    registry: &BusMasterRegistry,
    address: DeviceAddress,
    kind: SearchKind,
    config: &LocatorConfig,
    timeout: Duration,
) -> Result<BusMaster, LocatorError> {
    let (tx, rx) = oneshot::channel();
    let handler = Arc::new(WaitHandler {
        tx: Mutex::new(Some(tx)),
    });
    let locator = DeviceLocator::new(registry.clone(), handler, kind, config);
    locator.add_addresses(&[address]).await?;

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(master)) => Ok(master),
        Ok(Err(_)) | Err(_) => {
            // Best-effort cleanup; the address may have been retired in
            // the race window, which is fine.
            let _ = locator.cancel_address(&address).await;
            Err(LocatorError::Timeout { waited: timeout })
        }
    }
}
