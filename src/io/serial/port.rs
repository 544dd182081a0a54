// src/io/serial/port.rs
//
// Opening the tty and enumerating ports.

use std::path::Path;

use serde::Serialize;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::utils::{data_bits, stop_bits};
use crate::io::error::IoError;
use crate::settings::SerialSettings;

/// Serial port information returned by port enumeration
#[derive(Clone, Debug, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

/// Resolve a tty argument against the device directory.
///
/// Bare names (`ttyUSB0`) are joined onto `prefix`; anything containing a
/// path separator is taken as-is.
pub fn resolve_device_path(tty: &str, prefix: &str) -> String {
    if tty.contains('/') || prefix.is_empty() {
        return tty.to_string();
    }
    Path::new(prefix).join(tty).to_string_lossy().into_owned()
}

/// Open the serial port described by `settings` for async I/O.
pub fn open_port(settings: &SerialSettings) -> Result<SerialStream, IoError> {
    let path = resolve_device_path(&settings.device, &settings.device_prefix);
    let device = format!("serial({})", path);

    if settings.baud_rate == 0 {
        return Err(IoError::configuration("baud rate must be non-zero"));
    }
    let data = data_bits(settings.data_bits).ok_or_else(|| {
        IoError::configuration(format!("unsupported data bits {}", settings.data_bits))
    })?;
    let stop = stop_bits(settings.stop_bits).ok_or_else(|| {
        IoError::configuration(format!("unsupported stop bits {}", settings.stop_bits))
    })?;

    let stream = tokio_serial::new(&path, settings.baud_rate)
        .data_bits(data)
        .stop_bits(stop)
        .parity(settings.parity.into())
        .flow_control(settings.flow_control.into())
        .open_native_async()
        .map_err(|e| IoError::connection(&device, e.to_string()))?;

    tlog!(
        "[serial] Opened {} at {} baud ({}{}{}, flow {:?})",
        path,
        settings.baud_rate,
        settings.data_bits,
        settings.parity.letter(),
        settings.stop_bits,
        settings.flow_control
    );

    Ok(stream)
}

/// Enumerate ttys an slcan adapter could sit behind.
///
/// macOS lists each device twice; only the `/dev/cu.*` callout node is kept.
pub fn list_serial_ports() -> Result<Vec<SerialPortInfo>, IoError> {
    let ports = serialport::available_ports()
        .map_err(|e| IoError::configuration(format!("Failed to enumerate ports: {}", e)))?;

    Ok(ports
        .into_iter()
        .filter(|port| !(cfg!(target_os = "macos") && port.port_name.starts_with("/dev/tty.")))
        .map(|port| port_info(port.port_name, port.port_type))
        .collect())
}

fn port_info(port_name: String, kind: serialport::SerialPortType) -> SerialPortInfo {
    let mut info = SerialPortInfo {
        port_name,
        port_type: String::new(),
        manufacturer: None,
        product: None,
        serial_number: None,
        vid: None,
        pid: None,
    };
    info.port_type = match kind {
        serialport::SerialPortType::UsbPort(usb) => {
            info.vid = Some(usb.vid);
            info.pid = Some(usb.pid);
            info.manufacturer = usb.manufacturer;
            info.product = usb.product;
            info.serial_number = usb.serial_number;
            "USB"
        }
        serialport::SerialPortType::PciPort => "PCI",
        serialport::SerialPortType::BluetoothPort => "Bluetooth",
        serialport::SerialPortType::Unknown => "Unknown",
    }
    .to_string();
    info
}

/// One line per port, as printed by `--list-ports`.
pub fn describe_port(info: &SerialPortInfo) -> String {
    let mut line = format!("{}  {}", info.port_name, info.port_type);
    if let (Some(vid), Some(pid)) = (info.vid, info.pid) {
        line.push_str(&format!("  {:04x}:{:04x}", vid, pid));
    }
    let label: Vec<&str> = [&info.manufacturer, &info.product, &info.serial_number]
        .iter()
        .filter_map(|s| s.as_deref())
        .collect();
    if !label.is_empty() {
        line.push_str("  ");
        line.push_str(&label.join(" "));
    }
    line
}
