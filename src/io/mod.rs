// src/io/mod.rs
//
// Device I/O for the bridge: the serial line on one side, the CAN interface
// on the other, and the slcan codec between them.

pub mod error;
pub mod interface;
pub mod memory;
pub mod serial;
pub mod slcan;
pub mod socketcan;

pub use error::{DecodeError, IfaceError, IoError, ProtocolError};
pub use interface::{CanHandle, CanInterface};

use std::time::{SystemTime, UNIX_EPOCH};

/// Get current time in microseconds since UNIX epoch
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
