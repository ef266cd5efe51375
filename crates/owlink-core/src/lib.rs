// owlink-core: Command scheduling and search-notification engine for
// 1-Wire bus masters.
//
// The engine turns one-shot bus operations into single-use commands,
// coalesces subscribers' periodic search requests into one debounced
// polling schedule per bus master, keeps an observable registry of live
// bus masters, and lets callers wait for a device address to surface
// across a changing set of bus masters.

pub mod command;
pub mod config;
pub mod driver;
pub mod error;
pub mod locator;
pub mod master;
pub mod notify;
pub mod registry;

// ── Primary re-exports ──────────────────────────────────────────────
pub use command::{
    ConvertStatus, ConvertTCommand, ReadPowerSupplyCommand, ReadPowerSupplyStatus,
    ReadScratchpadCommand, ReadScratchpadStatus, SearchCommand, SearchStatus, StartCommand,
    StartStatus, StopCommand, StopStatus,
};
pub use config::{DriverConfig, LocatorConfig};
pub use driver::{AlarmThresholds, Ds18b20, TemperatureReading};
pub use error::{DriverError, LocatorError, RegistryError, ScheduleError};
pub use locator::{wait_for_device, DeviceFoundHandler, DeviceLocator};
pub use master::BusMaster;
pub use notify::SearchSubscriber;
pub use registry::{
    BusMasterRegistry, BusMasterStream, BusMasterWatchStream, RegistryObserver,
    RegistrySubscription,
};

// Re-export the transport contract so engine consumers need only one
// dependency.
pub use owlink_bus as bus;
