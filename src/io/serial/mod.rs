// src/io/serial/mod.rs
//
// Serial side of the bridge: the tty, its line settings, and the
// line-oriented channel the slcan peer talks through.

pub mod channel;
pub mod port;
pub(crate) mod utils;

pub use channel::{LineBuffer, SerialChannel, SerialReader, SerialWriter, SLCAN_MTU};
pub use port::{describe_port, list_serial_ports, open_port, resolve_device_path, SerialPortInfo};
pub use utils::{FlowControl, Parity};
