// ── Debounced search notification ──
//
// One SearchNotifier exists per (bus master, search kind). It coalesces
// every subscriber's requested minimum period into a single polling
// schedule: the pusher task always runs at min(all periods), and every
// structurally-new result fans out to all subscribers exactly once.
//
// Locking discipline: one mutex per notifier guards the subscription
// map, the cached result, and the pusher handle. Subscriber callbacks
// are never invoked with that lock held -- deliveries run on their own
// spawned task, so a subscriber is free to call back into the
// scheduling surface.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use owlink_bus::{SearchData, SearchKind};

use crate::command::SearchStatus;
use crate::error::ScheduleError;
use crate::master::BusMaster;

// ── Subscriber capability ───────────────────────────────────────────

/// Receives periodic search results from a bus master.
///
/// Implementations may call back into the scheduling surface (update,
/// cancel) from inside `on_search_result`.
#[async_trait]
pub trait SearchSubscriber: Send + Sync {
    async fn on_search_result(&self, master: BusMaster, kind: SearchKind, data: Arc<SearchData>);
}

/// Subscriber identity: one active subscription per subscriber instance
/// per (bus master, search kind).
fn subscriber_key(subscriber: &Arc<dyn SearchSubscriber>) -> usize {
    Arc::as_ptr(subscriber).cast::<()>().addr()
}

/// Fingerprint of a search result: a digest over the sorted address
/// list, so transport enumeration order cannot defeat the
/// unchanged-result gate.
fn fingerprint(data: &SearchData) -> u64 {
    let mut addrs: Vec<&[u8; 8]> = data.devices.iter().map(owlink_bus::DeviceAddress::as_bytes).collect();
    addrs.sort_unstable();

    let mut hasher = DefaultHasher::new();
    for addr in addrs {
        hasher.write(addr);
    }
    hasher.finish()
}

// ── Notifier state ──────────────────────────────────────────────────

struct Subscription {
    subscriber: Arc<dyn SearchSubscriber>,
    min_period: Duration,
}

struct CachedSearch {
    data: Arc<SearchData>,
    fingerprint: u64,
    stored_at: Instant,
}

/// The periodic timer driving one notifier. Each re-arm cancels the
/// previous task's token before spawning a replacement, so stale timers
/// never accumulate.
struct Pusher {
    period: Option<Duration>,
    last_push: Option<Instant>,
    cancel: Option<CancellationToken>,
}

impl Pusher {
    const fn idle() -> Self {
        Self {
            period: None,
            last_push: None,
            cancel: None,
        }
    }
}

enum AdjustOutcome {
    /// Target equals the current period; nothing to do.
    Unchanged,
    /// Re-armed at a new period; `immediate` when the first push fires now.
    Rearmed { immediate: bool },
    /// No subscribers remain; the timer was released.
    Stopped,
}

struct NotifierState {
    subscriptions: HashMap<usize, Subscription>,
    cached: Option<CachedSearch>,
    pusher: Pusher,
}

/// Per-(bus master, search kind) scheduler: debounces subscriber
/// periods into one polling cadence and fans fingerprint-distinct
/// results out to every subscriber.
pub(crate) struct SearchNotifier {
    kind: SearchKind,
    state: Mutex<NotifierState>,
    /// At most one search in flight per notifier; ticks that would
    /// overlap are skipped, not queued.
    in_flight: Arc<AtomicBool>,
}

impl SearchNotifier {
    pub(crate) fn new(kind: SearchKind) -> Self {
        Self {
            kind,
            state: Mutex::new(NotifierState {
                subscriptions: HashMap::new(),
                cached: None,
                pusher: Pusher::idle(),
            }),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    // ── Scheduling surface ───────────────────────────────────────

    pub(crate) async fn schedule_for(
        &self,
        master: &BusMaster,
        subscriber: &Arc<dyn SearchSubscriber>,
        min_period: Duration,
    ) -> Result<(), ScheduleError> {
        if min_period.is_zero() {
            return Err(ScheduleError::InvalidPeriod);
        }
        if !master.is_started() {
            return Err(ScheduleError::BusNotStarted);
        }

        let key = subscriber_key(subscriber);
        let mut state = self.state.lock().await;

        if state.subscriptions.contains_key(&key) {
            return Err(ScheduleError::AlreadyScheduled);
        }
        state.subscriptions.insert(
            key,
            Subscription {
                subscriber: Arc::clone(subscriber),
                min_period,
            },
        );

        let effective = effective_period(&state.subscriptions);
        let outcome = self.adjust_pusher(&mut state, master, effective);
        debug!(
            master = master.name(),
            kind = %self.kind,
            period_ms = min_period.as_millis(),
            "scheduled notify search"
        );

        // Late joiner: polling already warmed up and the cache is still
        // within this subscriber's freshness window -- deliver it now,
        // asynchronously, instead of making them wait a full tick.
        if !matches!(outcome, AdjustOutcome::Rearmed { immediate: true }) {
            if let Some(cached) = &state.cached {
                if cached.stored_at.elapsed() <= min_period {
                    let subscriber = Arc::clone(subscriber);
                    let data = Arc::clone(&cached.data);
                    let master = master.clone();
                    let kind = self.kind;
                    tokio::spawn(async move {
                        subscriber.on_search_result(master, kind, data).await;
                    });
                }
            }
        }

        Ok(())
    }

    pub(crate) async fn update_for(
        &self,
        master: &BusMaster,
        subscriber: &Arc<dyn SearchSubscriber>,
        min_period: Duration,
    ) -> Result<(), ScheduleError> {
        if min_period.is_zero() {
            return Err(ScheduleError::InvalidPeriod);
        }

        let key = subscriber_key(subscriber);
        let mut state = self.state.lock().await;

        let subscription = state
            .subscriptions
            .get_mut(&key)
            .ok_or(ScheduleError::NotScheduled)?;
        if subscription.min_period == min_period {
            return Err(ScheduleError::PeriodUnchanged);
        }
        subscription.min_period = min_period;

        let effective = effective_period(&state.subscriptions);
        self.adjust_pusher(&mut state, master, effective);
        debug!(
            master = master.name(),
            kind = %self.kind,
            period_ms = min_period.as_millis(),
            "updated notify search"
        );
        Ok(())
    }

    pub(crate) async fn cancel_for(
        &self,
        master: &BusMaster,
        subscriber: &Arc<dyn SearchSubscriber>,
    ) -> Result<(), ScheduleError> {
        let key = subscriber_key(subscriber);
        let mut state = self.state.lock().await;

        if state.subscriptions.remove(&key).is_none() {
            return Err(ScheduleError::NotScheduled);
        }

        let effective = effective_period(&state.subscriptions);
        self.adjust_pusher(&mut state, master, effective);
        debug!(master = master.name(), kind = %self.kind, "cancelled notify search");
        Ok(())
    }

    /// Bulk cancel, for when the owning bus master stops.
    pub(crate) async fn cancel_all(&self, master: &BusMaster) {
        let mut state = self.state.lock().await;
        let dropped = state.subscriptions.len();
        state.subscriptions.clear();
        self.adjust_pusher(&mut state, master, None);
        if dropped > 0 {
            debug!(
                master = master.name(),
                kind = %self.kind,
                dropped,
                "cancelled all notify-search subscriptions"
            );
        }
    }

    pub(crate) async fn is_subscribed(&self, key: usize) -> bool {
        self.state.lock().await.subscriptions.contains_key(&key)
    }

    // ── Result intake ────────────────────────────────────────────

    /// Called after every successful search command against the owning
    /// master. Replaces the cache and, when the fingerprint changed,
    /// fans the result out on a fresh task.
    pub(crate) async fn on_search_completed(&self, master: &BusMaster, data: Arc<SearchData>) {
        let print = fingerprint(&data);
        let mut state = self.state.lock().await;

        let changed = state
            .cached
            .as_ref()
            .is_none_or(|cached| cached.fingerprint != print);
        state.cached = Some(CachedSearch {
            data: Arc::clone(&data),
            fingerprint: print,
            stored_at: Instant::now(),
        });

        if !changed {
            debug!(
                master = master.name(),
                kind = %self.kind,
                "search result unchanged, skipping delivery"
            );
            return;
        }

        let recipients: Vec<(usize, Arc<dyn SearchSubscriber>)> = state
            .subscriptions
            .iter()
            .map(|(key, sub)| (*key, Arc::clone(&sub.subscriber)))
            .collect();
        drop(state);

        if recipients.is_empty() {
            return;
        }

        // Deliveries run on their own task, never on the caller's: the
        // caller may be the pusher tick or a subscriber-driven command,
        // and subscriber code may re-enter the scheduling surface.
        let master = master.clone();
        let kind = self.kind;
        tokio::spawn(async move {
            for (key, subscriber) in recipients {
                // A subscriber that cancelled between dispatch and
                // delivery is dropped here rather than notified late.
                if !master.notifier(kind).is_subscribed(key).await {
                    debug!(master = master.name(), kind = %kind, "skipping stale subscriber");
                    continue;
                }
                subscriber
                    .on_search_result(master.clone(), kind, Arc::clone(&data))
                    .await;
            }
        });
    }

    // ── Pusher management ────────────────────────────────────────

    fn adjust_pusher(
        &self,
        state: &mut NotifierState,
        master: &BusMaster,
        target: Option<Duration>,
    ) -> AdjustOutcome {
        if state.pusher.period == target {
            return AdjustOutcome::Unchanged;
        }

        // Cancel the previous timer before installing a replacement.
        if let Some(cancel) = state.pusher.cancel.take() {
            cancel.cancel();
        }
        state.pusher.period = target;

        let Some(period) = target else {
            debug!(master = master.name(), kind = %self.kind, "pusher stopped");
            return AdjustOutcome::Stopped;
        };

        let initial_delay = state
            .pusher
            .last_push
            .map_or(Duration::ZERO, |last| period.saturating_sub(last.elapsed()));

        let cancel = CancellationToken::new();
        state.pusher.cancel = Some(cancel.clone());
        tokio::spawn(pusher_task(
            master.clone(),
            self.kind,
            Arc::clone(&self.in_flight),
            cancel,
            initial_delay,
            period,
        ));

        AdjustOutcome::Rearmed {
            immediate: initial_delay.is_zero(),
        }
    }

    async fn note_push_started(&self) {
        self.state.lock().await.pusher.last_push = Some(Instant::now());
    }
}

fn effective_period(subscriptions: &HashMap<usize, Subscription>) -> Option<Duration> {
    subscriptions.values().map(|sub| sub.min_period).min()
}

// ── Pusher task ─────────────────────────────────────────────────────

/// Clears the in-flight marker even when a push fails or panics.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn pusher_task(
    master: BusMaster,
    kind: SearchKind,
    in_flight: Arc<AtomicBool>,
    cancel: CancellationToken,
    initial_delay: Duration,
    period: Duration,
) {
    if !initial_delay.is_zero() {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(initial_delay) => {}
        }
    }

    loop {
        push_once(&master, kind, &in_flight).await;
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(period) => {}
        }
    }
}

/// Execute one search against the bus master, unless one is already in
/// flight. Failures are logged and retried on the next tick only.
async fn push_once(master: &BusMaster, kind: SearchKind, in_flight: &Arc<AtomicBool>) {
    if in_flight.swap(true, Ordering::AcqRel) {
        debug!(master = master.name(), kind = %kind, "push already in flight, skipping tick");
        return;
    }
    let _guard = InFlightGuard(Arc::clone(in_flight));

    master.notifier(kind).note_push_started().await;

    let mut cmd = master.search_cmd(kind);
    match cmd.execute().await {
        SearchStatus::Success(data) => {
            debug!(
                master = master.name(),
                kind = %kind,
                devices = data.devices.len(),
                "search push completed"
            );
        }
        status => {
            warn!(master = master.name(), kind = %kind, ?status, "search push failed");
        }
    }
}
