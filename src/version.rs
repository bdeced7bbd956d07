//! Firmware version and device identity
//!
//! Single source of truth for the version triple, the build id, and the
//! capability bits advertised through the device-info endpoint.

use crate::wire::PROTO_VERSION;

/// Breaking protocol or hardware changes.
pub const FW_MAJOR: u8 = 0;
/// Backwards-compatible features.
pub const FW_MINOR: u8 = 3;
/// Fixes.
pub const FW_PATCH: u8 = 10;

/// Build id, 0xYYMMDDNN.
pub const FW_BUILD_ID: u32 = 0x2607_3001;

/// Version string for logs.
pub const FW_VERSION: &str = "0.3.10";

/// Device capability bits advertised in the device-info record.
pub mod caps {
    /// Lease-based session management.
    pub const SESSION_LEASE: u32 = 1 << 0;
    /// Persistent event log.
    pub const EVENT_LOG: u32 = 1 << 1;
    /// Bulk transfers.
    pub const BULK: u32 = 1 << 2;
    /// Raw industrial-bus register access.
    pub const BUS_TOOLS: u32 = 1 << 3;
    /// PID parameter and auto-tune commands.
    pub const PID_TUNING: u32 = 1 << 4;
    /// Over-the-air firmware update.
    pub const OTA_UPDATE: u32 = 1 << 5;
}

/// Capabilities this firmware implements.
pub const CAP_BITS: u32 = caps::SESSION_LEASE | caps::BUS_TOOLS | caps::PID_TUNING;

/// The fixed 12-byte device-info record served by the transport.
#[must_use]
pub fn device_info() -> [u8; 12] {
    let mut out = [0u8; 12];
    out[0] = PROTO_VERSION;
    out[1] = FW_MAJOR;
    out[2] = FW_MINOR;
    out[3] = FW_PATCH;
    out[4..8].copy_from_slice(&FW_BUILD_ID.to_le_bytes());
    out[8..12].copy_from_slice(&CAP_BITS.to_le_bytes());
    out
}
