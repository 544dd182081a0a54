// src/io/socketcan/mod.rs
//
// SocketCAN driver for Linux native CAN interfaces (can0, vcan0, ...).
//
// Link setup is done for the caller on demand:
//   ip link set can0 type can bitrate 500000 && ip link set can0 up
// so the daemon needs CAP_NET_ADMIN or a configured privilege helper.

#[cfg(target_os = "linux")]
pub mod codec;
mod interface;
#[cfg(target_os = "linux")]
pub mod link;

pub use interface::{SocketCanHandle, SocketCanInterface};
