// ── Device drivers ──
//
// Drivers consume a BusMaster; they never talk to a transport directly.

mod ds18b20;

pub use ds18b20::{AlarmThresholds, Ds18b20, TemperatureReading, SCRATCHPAD_LEN};
