// src/cli.rs
//
// Command line: `slcand [OPTIONS] <TTY> <CANIF>`.
// Every option overrides the matching settings file value.

use clap::Parser;
use std::path::PathBuf;

use crate::frame::{Bitrate, InterfaceMode};
use crate::io::serial::FlowControl;
use crate::settings::DaemonSettings;

#[derive(Parser, Debug)]
#[command(name = "slcand", version)]
#[command(about = "Bridge an slcan serial line to a SocketCAN network interface")]
pub struct Args {
    /// Serial device: a name under the device prefix (ttyUSB0) or a path
    #[arg(required_unless_present = "list_ports")]
    pub tty: Option<String>,

    /// CAN network interface, e.g. can0
    #[arg(required_unless_present = "list_ports")]
    pub canif: Option<String>,

    /// Bitrate used on open until the peer sends S: digit 0-8, bits/s, or 500k/1M
    #[arg(short = 's', long)]
    pub bitrate: Option<Bitrate>,

    /// Serial baud rate
    #[arg(short = 'S', long)]
    pub baud: Option<u32>,

    /// UART flow control: none, hw or sw
    #[arg(short = 't', long = "flow-control")]
    pub flow_control: Option<FlowControl>,

    /// Open the interface listen-only
    #[arg(short = 'l', long, conflicts_with = "loopback")]
    pub listen_only: bool,

    /// Open the interface in controller loopback mode
    #[arg(long)]
    pub loopback: bool,

    /// Directory bare tty names are resolved against
    #[arg(short = 'p', long = "prefix")]
    pub device_prefix: Option<String>,

    /// Open the channel at startup instead of waiting for O
    #[arg(short = 'o', long = "open")]
    pub auto_open: bool,

    /// Create the interface as vcan if it does not exist
    #[arg(long)]
    pub create_virtual: bool,

    /// Settings file (default: <config dir>/slcand/slcand.toml)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Also write logs to timestamped files in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// List serial ports and exit
    #[arg(long)]
    pub list_ports: bool,

    /// Print the port list as JSON
    #[arg(long, requires = "list_ports")]
    pub json: bool,
}

impl Args {
    /// Overlay command line values onto loaded settings.
    pub fn apply(&self, settings: &mut DaemonSettings) {
        if let Some(tty) = &self.tty {
            settings.serial.device = tty.clone();
        }
        if let Some(canif) = &self.canif {
            settings.can.interface = canif.clone();
        }
        if let Some(bitrate) = self.bitrate {
            settings.can.bitrate = Some(bitrate);
        }
        if let Some(baud) = self.baud {
            settings.serial.baud_rate = baud;
        }
        if let Some(flow_control) = self.flow_control {
            settings.serial.flow_control = flow_control;
        }
        if self.listen_only {
            settings.can.mode = InterfaceMode::ListenOnly;
        } else if self.loopback {
            settings.can.mode = InterfaceMode::Loopback;
        }
        if let Some(prefix) = &self.device_prefix {
            settings.serial.device_prefix = prefix.clone();
        }
        if self.auto_open {
            settings.can.auto_open = true;
        }
        if self.create_virtual {
            settings.can.create_virtual = true;
        }
        if let Some(dir) = &self.log_dir {
            settings.logging.log_dir = Some(dir.clone());
        }
    }
}
