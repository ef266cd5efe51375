// ── Bus transport capability ──
//
// The interface a transport implements to act as a 1-Wire bus master.
// Concrete transports (the local serial adapter, the remote HTTP proxy)
// live outside this workspace; the engine in owlink-core drives them
// exclusively through this trait. Completion times are stamped with the
// transport's own clock and are only meaningful relative to it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::{DeviceAddress, FamilyCode};

// ── Search ──────────────────────────────────────────────────────────

/// Which population a bus search enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchKind {
    /// Every device present on the bus.
    General,
    /// Only devices currently flagging an alarm condition.
    Alarm,
}

impl SearchKind {
    pub fn is_alarm(self) -> bool {
        matches!(self, Self::Alarm)
    }
}

impl std::fmt::Display for SearchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::General => write!(f, "general"),
            Self::Alarm => write!(f, "alarm"),
        }
    }
}

/// Parameters of one search operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchQuery {
    pub kind: SearchKind,
    /// Restrict enumeration to a single family code, if set.
    pub family: Option<FamilyCode>,
}

impl SearchQuery {
    pub fn new(kind: SearchKind) -> Self {
        Self { kind, family: None }
    }

    pub fn by_family(family: FamilyCode) -> Self {
        Self {
            kind: SearchKind::General,
            family: Some(family),
        }
    }
}

/// Result of a completed search: the enumerated addresses plus the
/// transport-clock completion time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchData {
    pub devices: Vec<DeviceAddress>,
    pub completed_at: DateTime<Utc>,
}

// ── Device reads ────────────────────────────────────────────────────

/// Raw scratchpad bytes read from one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchpadData {
    pub bytes: Vec<u8>,
    pub completed_at: DateTime<Utc>,
}

/// How a device is powered, per the Read Power Supply command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerSupply {
    /// Externally powered; the bus can be used during conversion.
    External,
    /// Parasite powered; conversion requires a strong pullup hold.
    Parasitic,
}

// ── Errors ──────────────────────────────────────────────────────────

/// Transport-level failures.
///
/// Deliberately narrow so callers can match exhaustively. `Clone` because
/// single-flight reads hand the same outcome to every concurrent waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("bus master is not started")]
    NotStarted,

    #[error("device {0} did not respond")]
    DeviceNotFound(DeviceAddress),

    #[error("communication error: {reason}")]
    Communication { reason: String },
}

// ── Capability trait ────────────────────────────────────────────────

/// A transport capable of issuing 1-Wire operations.
///
/// Implementations must be safe to call from many tasks at once; the
/// engine never serializes calls on the caller's behalf beyond the
/// scheduling guarantees documented in owlink-core.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Stable, process-unique, non-empty name.
    fn name(&self) -> &str;

    /// Whether the transport has been started and not yet stopped.
    fn is_started(&self) -> bool;

    /// Bring the bus up. Idempotence is transport-defined.
    async fn start(&self) -> Result<(), TransportError>;

    /// Take the bus down.
    async fn stop(&self) -> Result<(), TransportError>;

    /// Enumerate device addresses currently visible on the bus.
    async fn search(&self, query: SearchQuery) -> Result<SearchData, TransportError>;

    /// Broadcast a temperature conversion and return once it completes.
    /// The transport owns conversion timing, including any strong-pullup
    /// hold required for parasite-powered devices.
    async fn convert_t(&self) -> Result<DateTime<Utc>, TransportError>;

    /// Ask one device how it is powered.
    async fn read_power_supply(
        &self,
        addr: &DeviceAddress,
    ) -> Result<PowerSupply, TransportError>;

    /// Read `len` scratchpad bytes from one device.
    async fn read_scratchpad(
        &self,
        addr: &DeviceAddress,
        len: usize,
    ) -> Result<ScratchpadData, TransportError>;
}
