// src/settings.rs
//
// Daemon settings, read from a TOML file and overridden by the command line.
//
//   [serial]   device, baud rate, framing, flow control
//   [can]      interface, default bitrate, controller mode, link handling
//   [device]   identity reported by the V and N commands
//   [logging]  optional log file directory
//
// Every field has a default, so an empty or missing file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::frame::{Bitrate, InterfaceMode};
use crate::io::error::IoError;
use crate::io::serial::{FlowControl, Parity};

const CONFIG_DIR_NAME: &str = "slcand";
const CONFIG_FILE_NAME: &str = "slcand.toml";

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct DaemonSettings {
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default)]
    pub can: CanSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SerialSettings {
    /// tty name or path; bare names are resolved against `device_prefix`
    #[serde(default)]
    pub device: String,
    #[serde(default = "default_device_prefix")]
    pub device_prefix: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default)]
    pub flow_control: FlowControl,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CanSettings {
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Bitrate applied on open when the peer never sends `S`.
    /// Accepts an `S` digit, bits per second, or `500k` style strings.
    #[serde(default, with = "bitrate_opt")]
    pub bitrate: Option<Bitrate>,
    #[serde(default)]
    pub mode: InterfaceMode,
    /// Open the channel at startup without waiting for `O`
    #[serde(default)]
    pub auto_open: bool,
    /// Create the interface as vcan when it does not exist
    #[serde(default)]
    pub create_virtual: bool,
    /// Program prepended to `ip` for link changes, e.g. "sudo"
    #[serde(default)]
    pub link_helper: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DeviceSettings {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_serial_number")]
    pub serial_number: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct LoggingSettings {
    /// Directory for timestamped log files. Stderr only when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_device_prefix() -> String {
    "/dev".to_string()
}
fn default_baud_rate() -> u32 {
    115_200
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_interface() -> String {
    "can0".to_string()
}
fn default_version() -> String {
    "1013".to_string()
}
fn default_serial_number() -> String {
    "SLCD".to_string()
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            device: String::new(),
            device_prefix: default_device_prefix(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::default(),
            flow_control: FlowControl::default(),
        }
    }
}

impl Default for CanSettings {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            bitrate: None,
            mode: InterfaceMode::default(),
            auto_open: false,
            create_virtual: false,
            link_helper: None,
        }
    }
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            version: default_version(),
            serial_number: default_serial_number(),
        }
    }
}

/// `bitrate = 500000`, `bitrate = "500k"` and `bitrate = "6"` are all accepted.
mod bitrate_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::frame::Bitrate;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Option<Bitrate>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bitrate) => s.serialize_u32(u32::from(*bitrate)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Bitrate>, D::Error> {
        let parsed = match Raw::deserialize(d)? {
            Raw::Number(bps) => Bitrate::try_from(bps),
            Raw::Text(text) => text.parse::<Bitrate>(),
        };
        parsed.map(Some).map_err(serde::de::Error::custom)
    }
}

impl DaemonSettings {
    /// Default settings file location: `<config_dir>/slcand/slcand.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load settings.
    ///
    /// An explicit path must exist. Without one, the default location is
    /// used if present and built-in defaults otherwise.
    pub fn load(explicit: Option<&Path>) -> Result<Self, IoError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, IoError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            IoError::configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
            .map_err(|e| IoError::configuration(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("Failed to parse settings: {}", e))
    }

    /// Reject values that would make the daemon misbehave on the wire.
    pub fn validate(&self) -> Result<(), IoError> {
        if self.serial.device.is_empty() {
            return Err(IoError::configuration("no serial device given"));
        }
        if self.can.interface.is_empty() {
            return Err(IoError::configuration("no CAN interface given"));
        }
        if self.serial.baud_rate == 0 {
            return Err(IoError::configuration("baud rate must be non-zero"));
        }
        if !(5..=8).contains(&self.serial.data_bits) {
            return Err(IoError::configuration(format!(
                "data bits must be 5-8, got {}",
                self.serial.data_bits
            )));
        }
        if !(1..=2).contains(&self.serial.stop_bits) {
            return Err(IoError::configuration(format!(
                "stop bits must be 1 or 2, got {}",
                self.serial.stop_bits
            )));
        }
        check_reply_text("device.version", &self.device.version)?;
        check_reply_text("device.serial_number", &self.device.serial_number)?;
        Ok(())
    }
}

/// Reply payloads must be printable ASCII so they cannot forge an ack.
fn check_reply_text(field: &str, value: &str) -> Result<(), IoError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(IoError::configuration(format!(
            "{} must be non-empty printable ASCII, got {:?}",
            field, value
        )));
    }
    Ok(())
}
