// src/io/serial/utils.rs
//
// UART framing and flow control settings, and how they map onto the
// serialport types tokio-serial opens the tty with.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serialport::{DataBits, StopBits};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl Parity {
    /// Letter used in `8N1` style framing descriptions.
    pub fn letter(self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

/// UART flow control.
///
/// The CLI spells these `none`, `hw` and `sw`; the config file accepts the
/// long names as well.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    #[serde(alias = "hw")]
    Hardware,
    #[serde(alias = "sw")]
    Software,
}

impl FromStr for FlowControl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(FlowControl::None),
            "hw" | "hardware" | "rtscts" => Ok(FlowControl::Hardware),
            "sw" | "software" | "xonxoff" => Ok(FlowControl::Software),
            other => Err(format!(
                "unknown flow control '{}' (expected none, hw or sw)",
                other
            )),
        }
    }
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
            FlowControl::Software => serialport::FlowControl::Software,
        }
    }
}

/// Character size, `None` outside 5-8.
pub fn data_bits(bits: u8) -> Option<DataBits> {
    match bits {
        5 => Some(DataBits::Five),
        6 => Some(DataBits::Six),
        7 => Some(DataBits::Seven),
        8 => Some(DataBits::Eight),
        _ => None,
    }
}

/// Stop bits, `None` unless 1 or 2.
pub fn stop_bits(bits: u8) -> Option<StopBits> {
    match bits {
        1 => Some(StopBits::One),
        2 => Some(StopBits::Two),
        _ => None,
    }
}
