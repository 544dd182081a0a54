// src/daemon.rs
//
// Startup and supervision: settings in, bridge running, exit status out.

use thiserror::Error;

use crate::bridge::{self, Bridge, BridgeConfig, BridgeError, CommandError, ShutdownHandle};
use crate::io::error::{IfaceError, IoError};
use crate::io::interface::{CanHandle, CanInterface};
use crate::io::serial::{describe_port, list_serial_ports, open_port, SerialChannel};
use crate::io::socketcan::SocketCanInterface;
use crate::settings::DaemonSettings;

/// Errors that stop the daemon with a non-zero exit status.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error("cannot use CAN interface: {0}")]
    Interface(#[from] IfaceError),
    #[error("cannot open channel at startup: {0}")]
    Open(#[from] CommandError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl BridgeConfig {
    pub fn from_settings(settings: &DaemonSettings) -> Self {
        BridgeConfig {
            interface: settings.can.interface.clone(),
            default_bitrate: settings.can.bitrate,
            mode: settings.can.mode,
            version: settings.device.version.clone(),
            serial_number: settings.device.serial_number.clone(),
        }
    }
}

/// Build the bridge and settle the interface before any serial traffic.
///
/// With auto-open the channel is opened as if `O` had arrived; otherwise
/// the interface is probed so a missing or forbidden interface is reported
/// immediately.
pub fn prepare_bridge<I: CanInterface>(
    interface: I,
    settings: &DaemonSettings,
) -> Result<Bridge<I>, DaemonError> {
    let config = BridgeConfig::from_settings(settings);

    if settings.can.auto_open {
        let mut bridge = Bridge::new(interface, config);
        bridge.open(settings.can.mode)?;
        tlog!("[slcand] Channel opened at startup ({:?})", bridge.state());
        return Ok(bridge);
    }

    if !settings.can.create_virtual {
        match interface.attach(&config.interface) {
            Ok(handle) => handle.detach(),
            Err(e) if e.is_fatal_on_attach() => return Err(e.into()),
            Err(e) => tlog!("[slcand] Probe of {} failed: {}", config.interface, e),
        }
    }

    Ok(Bridge::new(interface, config))
}

/// Open the tty, settle the interface and bridge until shutdown or failure.
pub async fn serve(settings: DaemonSettings) -> Result<(), DaemonError> {
    let interface = SocketCanInterface::new(
        settings.can.create_virtual,
        settings.can.link_helper.clone(),
    );
    let bridge = prepare_bridge(interface, &settings)?;

    let stream = open_port(&settings.serial)?;
    let (reader, writer) = SerialChannel::new(stream).split();

    let shutdown = ShutdownHandle::new();
    spawn_signal_listener(shutdown.clone());

    tlog!(
        "[slcand] Bridging {} <-> {}",
        settings.serial.device,
        bridge.interface_name()
    );
    bridge::run(bridge, reader, writer, shutdown).await?;
    Ok(())
}

fn spawn_signal_listener(shutdown: ShutdownHandle) {
    tokio::spawn(async move {
        let signal = wait_for_signal().await;
        tlog!("[slcand] {} received, shutting down", signal);
        shutdown.trigger();
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut term, mut hup) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(term), Ok(hup)) => (term, hup),
        _ => {
            tlog!("[slcand] Could not install SIGTERM/SIGHUP handlers");
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = term.recv() => "SIGTERM",
        _ = hup.recv() => "SIGHUP",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "Ctrl-C"
}

/// `--list-ports`: one port per line, or a JSON array.
pub fn print_ports(json: bool) -> Result<(), DaemonError> {
    let ports = list_serial_ports()?;
    if json {
        let text = serde_json::to_string_pretty(&ports)
            .map_err(|e| IoError::configuration(format!("Failed to encode port list: {}", e)))?;
        println!("{}", text);
    } else if ports.is_empty() {
        println!("No serial ports found");
    } else {
        for port in &ports {
            println!("{}", describe_port(port));
        }
    }
    Ok(())
}
