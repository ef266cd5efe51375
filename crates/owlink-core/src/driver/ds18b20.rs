// ── DS18B20 temperature sensor ──
//
// Blocking-read driver over a BusMaster. Reads are single-flight: while
// a Convert-T + read-scratchpad cycle is in progress, concurrent
// callers enqueue a oneshot waiter and receive a clone of the leader's
// outcome instead of starting a second physical cycle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use owlink_bus::{crc8, DeviceAddress, FamilyCode, PowerSupply};

use crate::command::{ConvertStatus, ReadPowerSupplyStatus, ReadScratchpadStatus};
use crate::config::DriverConfig;
use crate::error::DriverError;
use crate::master::BusMaster;

/// DS18B20 scratchpad size: temperature, TH/TL, configuration,
/// reserved bytes, CRC.
pub const SCRATCHPAD_LEN: usize = 9;

const POISONED: &str = "flight mutex poisoned";

/// One decoded temperature reading.
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureReading {
    pub celsius: f64,
    /// Conversion resolution in bits (9-12), from the configuration
    /// register.
    pub resolution_bits: u8,
    /// Completion time by the issuing bus master's clock.
    pub taken_at: DateTime<Utc>,
}

/// Alarm trigger thresholds from scratchpad bytes 2-3, in whole
/// degrees Celsius.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmThresholds {
    pub high: i8,
    pub low: i8,
}

// ── Single-flight state ─────────────────────────────────────────────

enum Flight {
    Idle,
    InFlight(Vec<oneshot::Sender<Result<TemperatureReading, DriverError>>>),
}

/// Restores `Idle` if the leader's future is dropped mid-cycle, so a
/// cancelled leader never wedges later reads. Pending waiters are
/// dropped with it and observe a closed channel.
struct FlightReset<'a> {
    flight: &'a std::sync::Mutex<Flight>,
    armed: bool,
}

impl Drop for FlightReset<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Ok(mut flight) = self.flight.lock() {
                *flight = Flight::Idle;
            }
        }
    }
}

// ── Driver ──────────────────────────────────────────────────────────

struct DriverInner {
    master: BusMaster,
    address: DeviceAddress,
    config: DriverConfig,
    /// Resolved once, then cached; the probe itself is idempotent.
    power: Mutex<Option<PowerSupply>>,
    /// Guards only the leader/follower decision; never held across an
    /// await.
    flight: std::sync::Mutex<Flight>,
}

/// Driver for one DS18B20 on one bus master.
#[derive(Clone)]
pub struct Ds18b20 {
    inner: Arc<DriverInner>,
}

impl std::fmt::Debug for Ds18b20 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ds18b20")
            .field("address", &self.inner.address)
            .finish()
    }
}

impl Ds18b20 {
    /// Bind a driver to a device. Fails unless the address carries a
    /// supported thermometer family code.
    pub fn new(
        master: BusMaster,
        address: DeviceAddress,
        config: DriverConfig,
    ) -> Result<Self, DriverError> {
        let family = address.family();
        if !matches!(family, FamilyCode::DS18B20 | FamilyCode::DS1822) {
            return Err(DriverError::WrongFamily { address, family });
        }
        Ok(Self {
            inner: Arc::new(DriverInner {
                master,
                address,
                config,
                power: Mutex::new(None),
                flight: std::sync::Mutex::new(Flight::Idle),
            }),
        })
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.inner.address
    }

    pub fn master(&self) -> &BusMaster {
        &self.inner.master
    }

    /// How the device is powered. Probed once, then served from cache.
    pub async fn power_supply(&self) -> Result<PowerSupply, DriverError> {
        let mut cached = self.inner.power.lock().await;
        if let Some(power) = *cached {
            return Ok(power);
        }

        let mut cmd = self.inner.master.read_power_supply_cmd(self.inner.address);
        match cmd.execute().await {
            ReadPowerSupplyStatus::Success(power) => {
                *cached = Some(*power);
                Ok(*power)
            }
            ReadPowerSupplyStatus::BusNotStarted => Err(DriverError::BusNotStarted),
            ReadPowerSupplyStatus::DeviceNotFound => {
                Err(DriverError::DeviceNotFound(self.inner.address))
            }
            ReadPowerSupplyStatus::CommunicationError { reason } => {
                Err(DriverError::Communication {
                    reason: reason.clone(),
                })
            }
        }
    }

    /// Run one Convert-T + read-scratchpad cycle, or join the cycle
    /// already in flight. Every concurrent caller receives the same
    /// outcome; exactly one physical cycle runs per burst.
    pub async fn read_temperature(&self) -> Result<TemperatureReading, DriverError> {
        let follower_rx = {
            let mut flight = self.inner.flight.lock().expect(POISONED);
            match &mut *flight {
                Flight::Idle => {
                    *flight = Flight::InFlight(Vec::new());
                    None
                }
                Flight::InFlight(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
            }
        };

        if let Some(rx) = follower_rx {
            return match tokio::time::timeout(self.inner.config.read_timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(DriverError::Communication {
                    reason: "in-flight read abandoned".to_owned(),
                }),
                Err(_) => Err(DriverError::Timeout {
                    waited: self.inner.config.read_timeout,
                }),
            };
        }

        let mut reset = FlightReset {
            flight: &self.inner.flight,
            armed: true,
        };
        let result = self.perform_cycle().await;

        let waiters = {
            let mut flight = self.inner.flight.lock().expect(POISONED);
            match std::mem::replace(&mut *flight, Flight::Idle) {
                Flight::InFlight(waiters) => waiters,
                Flight::Idle => Vec::new(),
            }
        };
        reset.armed = false;

        for tx in waiters {
            let _ = tx.send(result.clone());
        }
        result
    }

    /// Read the alarm trigger thresholds (TH/TL). Not single-flight:
    /// thresholds change only on write, so callers read them rarely.
    pub async fn read_alarm_thresholds(&self) -> Result<AlarmThresholds, DriverError> {
        let bytes = self.read_scratchpad_checked().await?;
        Ok(AlarmThresholds {
            high: i8::from_le_bytes([bytes[2]]),
            low: i8::from_le_bytes([bytes[3]]),
        })
    }

    // ── Read cycle ───────────────────────────────────────────────

    async fn perform_cycle(&self) -> Result<TemperatureReading, DriverError> {
        match self.power_supply().await {
            Ok(power) => {
                debug!(address = %self.inner.address, ?power, "starting conversion");
            }
            // The transport owns strong-pullup timing either way; a
            // failed probe is not worth failing the read over.
            Err(err) => warn!(address = %self.inner.address, error = %err, "power probe failed"),
        }

        let mut convert = self.inner.master.convert_t_cmd();
        match convert.execute().await {
            ConvertStatus::Success { .. } => {}
            ConvertStatus::BusNotStarted => return Err(DriverError::BusNotStarted),
            ConvertStatus::CommunicationError { reason } => {
                return Err(DriverError::Communication {
                    reason: reason.clone(),
                });
            }
        }

        let mut last_crc_err = None;
        for attempt in 0..=self.inner.config.scratchpad_retries {
            match self.read_scratchpad_raw().await {
                Ok((bytes, taken_at)) => match decode_scratchpad(&bytes, taken_at) {
                    Ok(reading) => return Ok(reading),
                    Err(err @ DriverError::CrcMismatch { .. }) => {
                        warn!(address = %self.inner.address, attempt, error = %err, "scratchpad CRC failed");
                        last_crc_err = Some(err);
                    }
                    Err(err) => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
        Err(last_crc_err.expect("retry loop exits only after a CRC failure"))
    }

    async fn read_scratchpad_raw(&self) -> Result<(Vec<u8>, DateTime<Utc>), DriverError> {
        let mut cmd = self
            .inner
            .master
            .read_scratchpad_cmd(self.inner.address, SCRATCHPAD_LEN);
        match cmd.execute().await {
            ReadScratchpadStatus::Success(data) => Ok((data.bytes.clone(), data.completed_at)),
            ReadScratchpadStatus::BusNotStarted => Err(DriverError::BusNotStarted),
            ReadScratchpadStatus::DeviceNotFound => {
                Err(DriverError::DeviceNotFound(self.inner.address))
            }
            ReadScratchpadStatus::CommunicationError { reason } => {
                Err(DriverError::Communication {
                    reason: reason.clone(),
                })
            }
        }
    }

    async fn read_scratchpad_checked(&self) -> Result<Vec<u8>, DriverError> {
        let (bytes, _) = self.read_scratchpad_raw().await?;
        verify_scratchpad(&bytes)?;
        Ok(bytes)
    }
}

// ── Scratchpad decoding ─────────────────────────────────────────────

fn verify_scratchpad(bytes: &[u8]) -> Result<(), DriverError> {
    if bytes.len() < SCRATCHPAD_LEN {
        return Err(DriverError::ShortScratchpad { len: bytes.len() });
    }
    let expected = crc8(&bytes[..SCRATCHPAD_LEN - 1]);
    if expected != bytes[SCRATCHPAD_LEN - 1] {
        return Err(DriverError::CrcMismatch {
            expected,
            found: bytes[SCRATCHPAD_LEN - 1],
        });
    }
    Ok(())
}

fn decode_scratchpad(bytes: &[u8], taken_at: DateTime<Utc>) -> Result<TemperatureReading, DriverError> {
    verify_scratchpad(bytes)?;

    let resolution_bits = 9 + ((bytes[4] >> 5) & 0b11);
    // Low bits below the configured resolution are undefined.
    let undefined = 12 - u32::from(resolution_bits);
    let raw = i16::from_le_bytes([bytes[0], bytes[1]]);
    let masked = raw & (!0i16 << undefined);

    Ok(TemperatureReading {
        celsius: f64::from(masked) / 16.0,
        resolution_bits,
        taken_at,
    })
}
