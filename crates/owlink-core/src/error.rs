// ── Engine error types ──
//
// One closed enum per concern, so callers can match exhaustively.
// Precondition violations (duplicate subscriber, unknown bus master,
// invalid period) are always typed Err values, never panics; the only
// panics in this crate come from violating the single-use command
// contract, which is a programmer error rather than a runtime condition.

use std::time::Duration;

use thiserror::Error;

use owlink_bus::{DeviceAddress, TransportError};

// ── Scheduling ──────────────────────────────────────────────────────

/// Failures of the notify-search scheduling surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("bus master is not started")]
    BusNotStarted,

    #[error("subscriber is already scheduled for this search kind")]
    AlreadyScheduled,

    #[error("subscriber is not scheduled for this search kind")]
    NotScheduled,

    #[error("minimum period must be greater than zero")]
    InvalidPeriod,

    #[error("minimum period is unchanged")]
    PeriodUnchanged,
}

// ── Registry ────────────────────────────────────────────────────────

/// Failures mutating the bus-master registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("bus master has an empty name")]
    Unnamed,

    #[error("bus master {name:?} is not started")]
    NotStarted { name: String },

    #[error("bus master {name:?} is already registered")]
    AlreadyRegistered { name: String },

    #[error("bus master {name:?} is not registered")]
    NotRegistered { name: String },
}

// ── Device discovery ────────────────────────────────────────────────

/// Failures of the cross-bus-master device locator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocatorError {
    #[error("address {0} appears more than once in the request")]
    DuplicateAddress(DeviceAddress),

    #[error("address {0} is already being tracked")]
    AlreadyTracked(DeviceAddress),

    #[error("address {0} is not being tracked")]
    NotTracked(DeviceAddress),

    #[error("device did not appear within {waited:?}")]
    Timeout { waited: Duration },
}

// ── Driver ──────────────────────────────────────────────────────────

/// Failures reading a DS18B20.
///
/// `Clone` because every waiter of a single-flight read receives the
/// same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("device {address} has family code {family}, not a supported thermometer")]
    WrongFamily {
        address: DeviceAddress,
        family: owlink_bus::FamilyCode,
    },

    #[error("bus master is not started")]
    BusNotStarted,

    #[error("device {0} did not respond")]
    DeviceNotFound(DeviceAddress),

    #[error("communication error: {reason}")]
    Communication { reason: String },

    #[error("scratchpad CRC mismatch: expected {expected:#04x}, found {found:#04x}")]
    CrcMismatch { expected: u8, found: u8 },

    #[error("scratchpad too short: {len} bytes")]
    ShortScratchpad { len: usize },

    #[error("read did not complete within {waited:?}")]
    Timeout { waited: Duration },
}

impl From<TransportError> for DriverError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotStarted => Self::BusNotStarted,
            TransportError::DeviceNotFound(addr) => Self::DeviceNotFound(addr),
            TransportError::Communication { reason } => Self::Communication { reason },
        }
    }
}
