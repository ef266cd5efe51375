// ── Device addressing ──
//
// DeviceAddress and FamilyCode form the identity layer of every bus
// operation. A 1-Wire ROM id is 8 bytes on the wire: family code, 48-bit
// serial, and a Dallas CRC8 over the first seven bytes. Addresses are
// validated on construction so the rest of the stack never sees a
// corrupt id.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Dallas/Maxim CRC8 (polynomial x^8 + x^5 + x^4 + 1, reflected).
///
/// Used both for the last byte of a ROM id and for the trailing byte of a
/// DS18B20 scratchpad.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0x8C } else { crc >> 1 };
        }
    }
    crc
}

// ── FamilyCode ──────────────────────────────────────────────────────

/// First byte of a ROM id, identifying the device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FamilyCode(pub u8);

impl FamilyCode {
    /// DS18S20 high-precision digital thermometer.
    pub const DS18S20: Self = Self(0x10);
    /// DS18B20 programmable-resolution digital thermometer.
    pub const DS18B20: Self = Self(0x28);
    /// DS1822 econo digital thermometer.
    pub const DS1822: Self = Self(0x22);
}

impl fmt::Display for FamilyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}", self.0)
    }
}

// ── DeviceAddress ───────────────────────────────────────────────────

/// Validated 64-bit 1-Wire ROM id.
///
/// Stored in wire order: `[family, serial[6], crc]`. Construction verifies
/// the CRC, so every `DeviceAddress` in circulation names a device that at
/// least framed correctly on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress([u8; 8]);

/// Failures constructing a [`DeviceAddress`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address must be 16 hex digits, got {0} significant characters")]
    InvalidLength(usize),

    #[error("address contains a non-hex character: {0:?}")]
    InvalidHex(char),

    #[error("ROM CRC mismatch: expected {expected:#04x}, found {found:#04x}")]
    CrcMismatch { expected: u8, found: u8 },
}

impl DeviceAddress {
    /// Build an address from raw wire bytes, verifying the trailing CRC.
    pub fn from_bytes(bytes: [u8; 8]) -> Result<Self, AddressError> {
        let expected = crc8(&bytes[..7]);
        if expected != bytes[7] {
            return Err(AddressError::CrcMismatch {
                expected,
                found: bytes[7],
            });
        }
        Ok(Self(bytes))
    }

    /// Build an address from a family code and serial, computing the CRC.
    pub fn from_parts(family: FamilyCode, serial: [u8; 6]) -> Self {
        let mut bytes = [0u8; 8];
        bytes[0] = family.0;
        bytes[1..7].copy_from_slice(&serial);
        bytes[7] = crc8(&bytes[..7]);
        Self(bytes)
    }

    pub fn family(&self) -> FamilyCode {
        FamilyCode(self.0[0])
    }

    pub fn serial(&self) -> &[u8] {
        &self.0[1..7]
    }

    pub fn crc(&self) -> u8 {
        self.0[7]
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    /// Uppercase hex in wire order, e.g. `28FF641C6A8400B7`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl FromStr for DeviceAddress {
    type Err = AddressError;

    /// Parse from hex, tolerating `.`/`:`/`-` separators in any position
    /// (`28.FF641C6A8400.B7`, `28-FF-...`, or bare hex).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut nibbles = Vec::with_capacity(16);
        for c in s.chars() {
            if matches!(c, '.' | ':' | '-') {
                continue;
            }
            let nibble = c.to_digit(16).ok_or(AddressError::InvalidHex(c))?;
            nibbles.push(u8::try_from(nibble).unwrap_or_default());
        }

        if nibbles.len() != 16 {
            return Err(AddressError::InvalidLength(nibbles.len()));
        }

        let mut bytes = [0u8; 8];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = (nibbles[i * 2] << 4) | nibbles[i * 2 + 1];
        }
        Self::from_bytes(bytes)
    }
}

// Serialized as the display string, so REST/proxy tiers exchange addresses
// in the same form humans read in logs.
impl Serialize for DeviceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}
