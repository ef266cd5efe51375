// owlink-bus: Transport capability and wire value types for 1-Wire bus masters.
//
// This crate defines the boundary a transport (serial adapter, remote HTTP
// proxy) must implement to act as a 1-Wire bus master. The scheduling engine
// that drives transports lives in owlink-core.

pub mod address;
pub mod transport;

// ── Primary re-exports ──────────────────────────────────────────────
pub use address::{crc8, AddressError, DeviceAddress, FamilyCode};
pub use transport::{
    BusTransport, PowerSupply, ScratchpadData, SearchData, SearchKind, SearchQuery,
    TransportError,
};
