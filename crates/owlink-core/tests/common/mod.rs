// Shared test doubles: a scriptable in-memory BusTransport plus
// recording subscriber/observer implementations.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use owlink_bus::{
    BusTransport, DeviceAddress, FamilyCode, PowerSupply, ScratchpadData, SearchData, SearchKind,
    SearchQuery, TransportError,
};
use owlink_core::{BusMaster, RegistryObserver, SearchSubscriber};

// ── Address helpers ─────────────────────────────────────────────────

pub fn therm_addr(serial: u8) -> DeviceAddress {
    DeviceAddress::from_parts(FamilyCode::DS18B20, [serial, 0, 0, 0, 0, 0])
}

// ── MockTransport ───────────────────────────────────────────────────

/// Scriptable transport: searches return the scripted result queue
/// first, then whatever `set_devices` last installed. Every operation
/// counts invocations; optional per-operation delays simulate slow
/// hardware under the paused test clock.
pub struct MockTransport {
    name: String,
    started: AtomicBool,

    devices: Mutex<Vec<DeviceAddress>>,
    search_script: Mutex<VecDeque<Result<Vec<DeviceAddress>, TransportError>>>,
    scratchpads: Mutex<HashMap<DeviceAddress, Vec<u8>>>,
    scratchpad_script: Mutex<VecDeque<Result<Vec<u8>, TransportError>>>,
    power: Mutex<PowerSupply>,

    pub search_delay: Mutex<Duration>,
    pub convert_delay: Mutex<Duration>,

    pub search_count: AtomicUsize,
    pub alarm_search_count: AtomicUsize,
    pub convert_count: AtomicUsize,
    pub scratchpad_count: AtomicUsize,
    pub power_count: AtomicUsize,
}

impl MockTransport {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            started: AtomicBool::new(false),
            devices: Mutex::new(Vec::new()),
            search_script: Mutex::new(VecDeque::new()),
            scratchpads: Mutex::new(HashMap::new()),
            scratchpad_script: Mutex::new(VecDeque::new()),
            power: Mutex::new(PowerSupply::External),
            search_delay: Mutex::new(Duration::ZERO),
            convert_delay: Mutex::new(Duration::ZERO),
            search_count: AtomicUsize::new(0),
            alarm_search_count: AtomicUsize::new(0),
            convert_count: AtomicUsize::new(0),
            scratchpad_count: AtomicUsize::new(0),
            power_count: AtomicUsize::new(0),
        })
    }

    /// A transport that already reports itself started.
    pub fn started(name: &str) -> Arc<Self> {
        let transport = Self::new(name);
        transport.started.store(true, Ordering::SeqCst);
        transport
    }

    pub fn set_devices(&self, devices: Vec<DeviceAddress>) {
        *self.devices.lock().unwrap() = devices;
    }

    /// Queue one-shot search outcomes served before `set_devices` data.
    pub fn script_searches(&self, outcomes: Vec<Result<Vec<DeviceAddress>, TransportError>>) {
        self.search_script.lock().unwrap().extend(outcomes);
    }

    pub fn set_scratchpad(&self, addr: DeviceAddress, bytes: Vec<u8>) {
        self.scratchpads.lock().unwrap().insert(addr, bytes);
    }

    /// Queue one-shot scratchpad outcomes served before the per-device map.
    pub fn script_scratchpads(&self, outcomes: Vec<Result<Vec<u8>, TransportError>>) {
        self.scratchpad_script.lock().unwrap().extend(outcomes);
    }

    pub fn set_power(&self, power: PowerSupply) {
        *self.power.lock().unwrap() = power;
    }

    pub fn searches(&self) -> usize {
        self.search_count.load(Ordering::SeqCst)
    }

    fn check_started(&self) -> Result<(), TransportError> {
        if self.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotStarted)
        }
    }
}

#[async_trait]
impl BusTransport for MockTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn start(&self) -> Result<(), TransportError> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.check_started()?;
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn search(&self, query: SearchQuery) -> Result<SearchData, TransportError> {
        self.check_started()?;
        match query.kind {
            SearchKind::General => self.search_count.fetch_add(1, Ordering::SeqCst),
            SearchKind::Alarm => self.alarm_search_count.fetch_add(1, Ordering::SeqCst),
        };

        let delay = *self.search_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.search_script.lock().unwrap().pop_front();
        let mut devices = match scripted {
            Some(outcome) => outcome?,
            None => self.devices.lock().unwrap().clone(),
        };
        if let Some(family) = query.family {
            devices.retain(|d| d.family() == family);
        }

        Ok(SearchData {
            devices,
            completed_at: now(),
        })
    }

    async fn convert_t(&self) -> Result<DateTime<Utc>, TransportError> {
        self.check_started()?;
        self.convert_count.fetch_add(1, Ordering::SeqCst);

        let delay = *self.convert_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(now())
    }

    async fn read_power_supply(
        &self,
        _addr: &DeviceAddress,
    ) -> Result<PowerSupply, TransportError> {
        self.check_started()?;
        self.power_count.fetch_add(1, Ordering::SeqCst);
        Ok(*self.power.lock().unwrap())
    }

    async fn read_scratchpad(
        &self,
        addr: &DeviceAddress,
        len: usize,
    ) -> Result<ScratchpadData, TransportError> {
        self.check_started()?;
        self.scratchpad_count.fetch_add(1, Ordering::SeqCst);

        let scripted = self.scratchpad_script.lock().unwrap().pop_front();
        let bytes = match scripted {
            Some(outcome) => outcome?,
            None => self
                .scratchpads
                .lock()
                .unwrap()
                .get(addr)
                .cloned()
                .ok_or(TransportError::DeviceNotFound(*addr))?,
        };

        Ok(ScratchpadData {
            bytes: bytes.into_iter().take(len).collect(),
            completed_at: now(),
        })
    }
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// A started BusMaster over a fresh mock transport.
pub fn started_master(name: &str) -> (Arc<MockTransport>, BusMaster) {
    let transport = MockTransport::started(name);
    let master = BusMaster::new(transport.clone());
    (transport, master)
}

// ── Recording subscriber ────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SearchEvent {
    pub master: String,
    pub kind: SearchKind,
    pub devices: Vec<DeviceAddress>,
}

/// Records every delivered search result and wakes waiters.
pub struct RecordingSubscriber {
    pub events: Mutex<Vec<SearchEvent>>,
    pub notify: Notify,
}

impl RecordingSubscriber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// Wait until at least `count` events have been recorded.
    pub async fn wait_for_events(&self, count: usize) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.event_count() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl SearchSubscriber for RecordingSubscriber {
    async fn on_search_result(&self, master: BusMaster, kind: SearchKind, data: Arc<SearchData>) {
        self.events.lock().unwrap().push(SearchEvent {
            master: master.name().to_owned(),
            kind,
            devices: data.devices.clone(),
        });
        self.notify.notify_waiters();
    }
}

// ── Recording registry observer ─────────────────────────────────────

/// Records every membership event and wakes waiters.
pub struct RecordingObserver {
    pub events: Mutex<Vec<(String, bool)>>,
    pub notify: Notify,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    pub fn snapshot(&self) -> Vec<(String, bool)> {
        self.events.lock().unwrap().clone()
    }

    pub async fn wait_for_events(&self, count: usize) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.events.lock().unwrap().len() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl RegistryObserver for RecordingObserver {
    async fn on_bus_master_changed(&self, master: BusMaster, added: bool) {
        self.events
            .lock()
            .unwrap()
            .push((master.name().to_owned(), added));
        self.notify.notify_waiters();
    }
}
