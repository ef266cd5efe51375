// ── Engine tuning configuration ──
//
// These types carry the timing knobs callers hand to the engine.
// They never touch disk -- any file-based configuration tier constructs
// them and passes them in.

use std::time::Duration;

/// Tuning for a [`Ds18b20`](crate::driver::Ds18b20) driver instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// How long a caller joining an in-flight read waits before giving up.
    pub read_timeout: Duration,
    /// Scratchpad re-reads attempted after a CRC mismatch.
    pub scratchpad_retries: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            scratchpad_retries: 2,
        }
    }
}

/// Tuning for a [`DeviceLocator`](crate::locator::DeviceLocator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorConfig {
    /// Minimum search period the locator requests on every bus master.
    pub poll_period: Duration,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            poll_period: Duration::from_secs(10),
        }
    }
}
