// ── Bus master ──
//
// A cheaply-cloneable handle over one transport. Mints the single-use
// command objects and exposes the notify-search scheduling surface,
// delegating to the two notifiers it owns (general search, alarm
// search). The registry holds clones of this handle; it never controls
// the transport's lifecycle, only its visibility.

use std::sync::Arc;

use owlink_bus::{BusTransport, DeviceAddress, FamilyCode, SearchData, SearchKind, SearchQuery};

use crate::command::{
    ConvertTCommand, ReadPowerSupplyCommand, ReadScratchpadCommand, SearchCommand, StartCommand,
    StopCommand, StopStatus,
};
use crate::error::ScheduleError;
use crate::notify::{SearchNotifier, SearchSubscriber};

/// Handle to one 1-Wire bus master.
#[derive(Clone)]
pub struct BusMaster {
    inner: Arc<MasterInner>,
}

struct MasterInner {
    transport: Arc<dyn BusTransport>,
    general: SearchNotifier,
    alarm: SearchNotifier,
}

impl BusMaster {
    pub fn new(transport: Arc<dyn BusTransport>) -> Self {
        Self {
            inner: Arc::new(MasterInner {
                transport,
                general: SearchNotifier::new(SearchKind::General),
                alarm: SearchNotifier::new(SearchKind::Alarm),
            }),
        }
    }

    /// Stable, process-unique transport name.
    pub fn name(&self) -> &str {
        self.inner.transport.name()
    }

    pub fn is_started(&self) -> bool {
        self.inner.transport.is_started()
    }

    pub(crate) fn transport(&self) -> &Arc<dyn BusTransport> {
        &self.inner.transport
    }

    pub(crate) fn notifier(&self, kind: SearchKind) -> &SearchNotifier {
        match kind {
            SearchKind::General => &self.inner.general,
            SearchKind::Alarm => &self.inner.alarm,
        }
    }

    // ── Command minting ──────────────────────────────────────────

    pub fn start_cmd(&self) -> StartCommand {
        StartCommand::new(self.clone())
    }

    pub fn stop_cmd(&self) -> StopCommand {
        StopCommand::new(self.clone())
    }

    pub fn search_cmd(&self, kind: SearchKind) -> SearchCommand {
        SearchCommand::new(self.clone(), SearchQuery::new(kind))
    }

    pub fn search_by_family_cmd(&self, family: FamilyCode) -> SearchCommand {
        SearchCommand::new(self.clone(), SearchQuery::by_family(family))
    }

    pub fn convert_t_cmd(&self) -> ConvertTCommand {
        ConvertTCommand::new(self.clone())
    }

    pub fn read_power_supply_cmd(&self, address: DeviceAddress) -> ReadPowerSupplyCommand {
        ReadPowerSupplyCommand::new(self.clone(), address)
    }

    pub fn read_scratchpad_cmd(&self, address: DeviceAddress, len: usize) -> ReadScratchpadCommand {
        ReadScratchpadCommand::new(self.clone(), address, len)
    }

    // ── Notify-search scheduling surface ─────────────────────────

    /// Register `subscriber` for periodic search pushes at least every
    /// `min_period`. One active subscription per subscriber per kind.
    pub async fn schedule_notify_search(
        &self,
        subscriber: &Arc<dyn SearchSubscriber>,
        kind: SearchKind,
        min_period: std::time::Duration,
    ) -> Result<(), ScheduleError> {
        self.notifier(kind)
            .schedule_for(self, subscriber, min_period)
            .await
    }

    /// Change an existing subscription's minimum period.
    pub async fn update_scheduled_notify_search(
        &self,
        subscriber: &Arc<dyn SearchSubscriber>,
        kind: SearchKind,
        min_period: std::time::Duration,
    ) -> Result<(), ScheduleError> {
        self.notifier(kind)
            .update_for(self, subscriber, min_period)
            .await
    }

    /// Remove a subscription. Once this returns, no further pushes are
    /// queued for the subscriber; a delivery already dispatched may
    /// still land.
    pub async fn cancel_scheduled_notify_search(
        &self,
        subscriber: &Arc<dyn SearchSubscriber>,
        kind: SearchKind,
    ) -> Result<(), ScheduleError> {
        self.notifier(kind).cancel_for(self, subscriber).await
    }

    pub(crate) async fn cancel_all_notify_search(&self) {
        self.inner.general.cancel_all(self).await;
        self.inner.alarm.cancel_all(self).await;
    }

    /// Feed a completed unfiltered search into the matching notifier.
    pub(crate) async fn on_search_completed(&self, kind: SearchKind, data: Arc<SearchData>) {
        self.notifier(kind).on_search_completed(self, data).await;
    }

    // ── Lifecycle convenience ────────────────────────────────────

    /// Stop the transport, cancelling all notify-search subscriptions
    /// first. Equivalent to minting and executing a [`StopCommand`].
    pub async fn stop(&self) -> StopStatus {
        let mut cmd = self.stop_cmd();
        cmd.execute().await.clone()
    }
}

impl std::fmt::Debug for BusMaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusMaster")
            .field("name", &self.name())
            .field("started", &self.is_started())
            .finish()
    }
}
