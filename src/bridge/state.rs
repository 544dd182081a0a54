// src/bridge/state.rs
//
// Channel state machine driven by decoded slcan commands.
//
// Only the command task mutates a `Bridge`. The handle of an active channel
// is published on a watch channel for the forwarding task; it is withdrawn
// before the interface is brought down so no frame from a closing channel is
// forwarded after the close is acknowledged.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;

use crate::frame::{Bitrate, CanFrame, Command, InterfaceMode};
use crate::io::error::IfaceError;
use crate::io::interface::{CanHandle, CanInterface};
use crate::io::slcan::SlcanCodec;

/// `F` status bit: a transmit found the interface queue full
pub const STATUS_TX_FULL: u8 = 0x02;
/// `F` status bit: a transmit failed for another reason
pub const STATUS_TX_ERROR: u8 = 0x80;

/// Answer written to the serial peer for one command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// `\r`
    Ack,
    /// `\a`
    Nack,
    /// Informational line, written with its terminator
    Line(Vec<u8>),
}

/// Why a well-formed command was refused. Answered with `\a`.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("channel is not open")]
    NotOpen,
    #[error("channel is already open")]
    AlreadyOpen,
    #[error("channel is open in listen-only mode")]
    ListenOnly,
    #[error(transparent)]
    Iface(#[from] IfaceError),
}

/// Externally visible channel state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Configuring,
    Active,
}

/// Settings the bridge needs at runtime.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// CAN interface name, e.g. `can0`
    pub interface: String,
    /// Pending bitrate before any `S` command
    pub default_bitrate: Option<Bitrate>,
    /// Controller mode used by `O`. `L` always opens listen-only.
    pub mode: InterfaceMode,
    pub version: String,
    pub serial_number: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            interface: "can0".to_string(),
            default_bitrate: None,
            mode: InterfaceMode::Normal,
            version: "1013".to_string(),
            serial_number: "SLCD".to_string(),
        }
    }
}

/// What the forwarding task needs to know about the active channel.
pub struct ActiveLink<H> {
    pub handle: Arc<H>,
    pub timestamps: bool,
}

impl<H> Clone for ActiveLink<H> {
    fn clone(&self) -> Self {
        ActiveLink {
            handle: Arc::clone(&self.handle),
            timestamps: self.timestamps,
        }
    }
}

enum Channel<H> {
    Idle,
    Configuring(Arc<H>),
    Active(Arc<H>),
}

pub struct Bridge<I: CanInterface> {
    interface: I,
    config: BridgeConfig,
    channel: Channel<I::Handle>,
    pending_bitrate: Option<Bitrate>,
    open_mode: InterfaceMode,
    timestamps: bool,
    status: u8,
    published: watch::Sender<Option<ActiveLink<I::Handle>>>,
}

impl<I: CanInterface> Bridge<I> {
    pub fn new(interface: I, config: BridgeConfig) -> Self {
        let (published, _) = watch::channel(None);
        Bridge {
            interface,
            pending_bitrate: config.default_bitrate,
            open_mode: config.mode,
            config,
            channel: Channel::Idle,
            timestamps: false,
            status: 0,
            published,
        }
    }

    pub fn state(&self) -> BridgeState {
        match self.channel {
            Channel::Idle => BridgeState::Idle,
            Channel::Configuring(_) => BridgeState::Configuring,
            Channel::Active(_) => BridgeState::Active,
        }
    }

    pub fn pending_bitrate(&self) -> Option<Bitrate> {
        self.pending_bitrate
    }

    pub fn interface_name(&self) -> &str {
        &self.config.interface
    }

    /// Follow the active channel from another task.
    pub fn subscribe(&self) -> watch::Receiver<Option<ActiveLink<I::Handle>>> {
        self.published.subscribe()
    }

    /// Decode and execute one command line.
    pub fn handle_line(&mut self, line: &[u8]) -> Reply {
        match SlcanCodec::decode(line) {
            Ok(command) => self.handle(command),
            Err(e) => {
                tlog!(
                    "[bridge] Rejected line {:?}: {}",
                    String::from_utf8_lossy(line),
                    e
                );
                Reply::Nack
            }
        }
    }

    /// Execute one command and produce the reply for the serial peer.
    pub fn handle(&mut self, command: Command) -> Reply {
        match self.execute(command) {
            Ok(reply) => reply,
            Err(e) => {
                tlog!("[bridge] {:?} failed: {}", command, e);
                Reply::Nack
            }
        }
    }

    fn execute(&mut self, command: Command) -> Result<Reply, CommandError> {
        match command {
            Command::OpenChannel => self.open(self.config.mode).map(|_| Reply::Ack),
            Command::OpenListenOnly => self.open(InterfaceMode::ListenOnly).map(|_| Reply::Ack),
            Command::CloseChannel => self.close().map(|_| Reply::Ack),
            Command::SetBitrate(bitrate) => self.set_bitrate(bitrate).map(|_| Reply::Ack),
            Command::Transmit(frame)
            | Command::TransmitExtended(frame)
            | Command::TransmitRemote(frame) => self.transmit(&frame).map(|_| Reply::Ack),
            Command::ReadStatus => {
                let flags = std::mem::take(&mut self.status);
                Ok(Reply::Line(SlcanCodec::status_reply(flags)))
            }
            Command::ReadVersion => Ok(Reply::Line(SlcanCodec::version_reply(
                &self.config.version,
            ))),
            Command::ReadSerial => Ok(Reply::Line(SlcanCodec::serial_reply(
                &self.config.serial_number,
            ))),
            Command::SetTimestamps(enabled) => {
                if !matches!(self.channel, Channel::Idle) {
                    return Err(CommandError::AlreadyOpen);
                }
                self.timestamps = enabled;
                Ok(Reply::Ack)
            }
        }
    }

    /// Attach and configure the interface. With a pending bitrate the
    /// channel goes straight to Active.
    pub fn open(&mut self, mode: InterfaceMode) -> Result<(), CommandError> {
        if !matches!(self.channel, Channel::Idle) {
            return Err(CommandError::AlreadyOpen);
        }

        let handle = self.interface.attach(&self.config.interface)?;
        if handle.is_up() {
            tlog!(
                "[bridge] {} is already up, bringing it down to configure",
                handle.name()
            );
            if let Err(e) = handle.down() {
                handle.detach();
                return Err(e.into());
            }
        }
        if let Err(e) = handle.set_mode(mode) {
            handle.detach();
            return Err(e.into());
        }

        tlog!("[bridge] Opened {} ({:?})", handle.name(), mode);
        self.open_mode = mode;
        self.channel = Channel::Configuring(handle);

        let Some(bitrate) = self.pending_bitrate else {
            return Ok(());
        };
        if let Err(e) = self.activate(bitrate) {
            self.abandon_open();
            return Err(e);
        }
        Ok(())
    }

    /// Undo a half-finished open so a refused `O` leaves the channel Idle.
    fn abandon_open(&mut self) {
        if let Channel::Configuring(handle) = std::mem::replace(&mut self.channel, Channel::Idle) {
            if handle.is_up() {
                let _ = handle.down();
            }
            handle.detach();
            tlog!("[bridge] Open of {} abandoned", handle.name());
        }
    }

    /// Withdraw the active handle, bring the interface down and detach.
    /// The channel is Idle afterwards even if bringing the link down failed.
    pub fn close(&mut self) -> Result<(), CommandError> {
        let (handle, was_active) = match std::mem::replace(&mut self.channel, Channel::Idle) {
            Channel::Idle => return Err(CommandError::NotOpen),
            Channel::Configuring(handle) => (handle, false),
            Channel::Active(handle) => (handle, true),
        };

        let mut result = Ok(());
        if was_active {
            self.published.send_replace(None);
            result = handle.down().map_err(CommandError::from);
        }
        handle.detach();
        tlog!("[bridge] Closed {}", handle.name());
        result
    }

    /// Close the channel if one is open; used on shutdown.
    pub fn close_if_open(&mut self) {
        if matches!(self.channel, Channel::Idle) {
            return;
        }
        if let Err(e) = self.close() {
            tlog!("[bridge] Error closing channel: {}", e);
        }
    }

    fn set_bitrate(&mut self, bitrate: Bitrate) -> Result<(), CommandError> {
        match self.channel {
            Channel::Idle => {
                tlog!("[bridge] Bitrate {} pending until open", bitrate);
                self.pending_bitrate = Some(bitrate);
                Ok(())
            }
            Channel::Configuring(_) => self.activate(bitrate),
            Channel::Active(_) => Err(IfaceError::BusyWhileUp.into()),
        }
    }

    /// Configuring → Active. On failure the channel stays Configuring.
    fn activate(&mut self, bitrate: Bitrate) -> Result<(), CommandError> {
        let handle = match &self.channel {
            Channel::Configuring(handle) => Arc::clone(handle),
            Channel::Idle => return Err(CommandError::NotOpen),
            Channel::Active(_) => return Err(IfaceError::BusyWhileUp.into()),
        };

        handle.set_bitrate(bitrate)?;
        handle.up()?;
        self.pending_bitrate = Some(bitrate);

        tlog!("[bridge] {} up at {}", handle.name(), bitrate);
        self.published.send_replace(Some(ActiveLink {
            handle: Arc::clone(&handle),
            timestamps: self.timestamps,
        }));
        self.channel = Channel::Active(handle);
        Ok(())
    }

    fn transmit(&mut self, frame: &CanFrame) -> Result<(), CommandError> {
        if let Channel::Configuring(_) = self.channel {
            let bitrate = self
                .pending_bitrate
                .ok_or(IfaceError::NoBitrateConfigured)?;
            self.activate(bitrate)?;
        }

        let handle = match &self.channel {
            Channel::Active(handle) => Arc::clone(handle),
            _ => return Err(CommandError::NotOpen),
        };
        if !self.open_mode.can_transmit() {
            return Err(CommandError::ListenOnly);
        }

        if let Err(e) = handle.send_frame(frame) {
            self.status |= match e {
                IfaceError::TxBufferFull => STATUS_TX_FULL,
                _ => STATUS_TX_ERROR,
            };
            return Err(e.into());
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::memory::{MemoryBus, MemoryInterface};

    fn setup(config: BridgeConfig) -> (Bridge<MemoryInterface>, Arc<MemoryBus>) {
        let iface = MemoryInterface::new();
        let bus = iface.add_bus(&config.interface);
        (Bridge::new(iface, config), bus)
    }

    fn bridge() -> (Bridge<MemoryInterface>, Arc<MemoryBus>) {
        setup(BridgeConfig::default())
    }

    fn full_frame_line() -> &'static [u8] {
        b"t12380011223344556677"
    }

    #[test]
    fn test_close_while_idle_is_refused() {
        let (mut bridge, _bus) = bridge();
        assert_eq!(bridge.handle_line(b"C"), Reply::Nack);
        assert_eq!(bridge.state(), BridgeState::Idle);
    }

    #[test]
    fn test_open_bitrate_transmit() {
        let (mut bridge, bus) = bridge();
        assert_eq!(bridge.handle_line(b"O"), Reply::Ack);
        assert_eq!(bridge.state(), BridgeState::Configuring);
        assert!(!bus.is_up());

        assert_eq!(bridge.handle_line(b"S6"), Reply::Ack);
        assert_eq!(bridge.state(), BridgeState::Active);
        assert!(bus.is_up());
        assert_eq!(bus.bitrate(), Some(Bitrate::Rate500K));

        assert_eq!(bridge.handle_line(full_frame_line()), Reply::Ack);
        let sent = bus.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id(), 0x123);
        assert_eq!(
            sent[0].payload(),
            &[0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]
        );
    }

    #[test]
    fn test_bitrate_before_open_is_pending() {
        let (mut bridge, bus) = bridge();
        assert_eq!(bridge.handle_line(b"S4"), Reply::Ack);
        assert_eq!(bridge.pending_bitrate(), Some(Bitrate::Rate125K));
        assert_eq!(bridge.state(), BridgeState::Idle);

        assert_eq!(bridge.handle_line(b"O"), Reply::Ack);
        assert_eq!(bridge.state(), BridgeState::Active);
        assert_eq!(bus.bitrate(), Some(Bitrate::Rate125K));
    }

    #[test]
    fn test_default_bitrate_opens_active() {
        let (mut bridge, bus) = setup(BridgeConfig {
            default_bitrate: Some(Bitrate::Rate250K),
            ..BridgeConfig::default()
        });
        assert_eq!(bridge.handle_line(b"O"), Reply::Ack);
        assert_eq!(bridge.state(), BridgeState::Active);
        assert_eq!(bus.bitrate(), Some(Bitrate::Rate250K));
    }

    #[test]
    fn test_bitrate_change_while_active_refused() {
        let (mut bridge, bus) = bridge();
        bridge.handle_line(b"O");
        bridge.handle_line(b"S6");
        assert_eq!(bridge.handle_line(b"S3"), Reply::Nack);
        assert_eq!(bus.bitrate(), Some(Bitrate::Rate500K));
        assert_eq!(bridge.state(), BridgeState::Active);
    }

    #[test]
    fn test_open_twice_refused() {
        let (mut bridge, bus) = bridge();
        assert_eq!(bridge.handle_line(b"O"), Reply::Ack);
        assert_eq!(bridge.handle_line(b"O"), Reply::Nack);
        assert_eq!(bridge.handle_line(b"L"), Reply::Nack);
        assert_eq!(bus.attached(), 1);
    }

    #[test]
    fn test_open_missing_interface_stays_idle() {
        let mut bridge = Bridge::new(
            MemoryInterface::new(),
            BridgeConfig {
                interface: "can9".into(),
                ..BridgeConfig::default()
            },
        );
        assert_eq!(bridge.handle_line(b"O"), Reply::Nack);
        assert_eq!(bridge.state(), BridgeState::Idle);
    }

    #[test]
    fn test_open_restricted_interface_stays_idle() {
        let (mut bridge, bus) = bridge();
        bus.set_restricted(true);
        assert_eq!(bridge.handle_line(b"O"), Reply::Nack);
        assert_eq!(bridge.state(), BridgeState::Idle);
    }

    #[test]
    fn test_malformed_frame_sends_nothing() {
        let (mut bridge, bus) = bridge();
        bridge.handle_line(b"O");
        bridge.handle_line(b"S6");
        assert_eq!(bridge.handle_line(b"t1230011223344556677"), Reply::Nack);
        assert!(bus.sent().is_empty());
        assert_eq!(bridge.state(), BridgeState::Active);
    }

    #[test]
    fn test_invalid_bitrate_digit() {
        let (mut bridge, _bus) = bridge();
        assert_eq!(bridge.handle_line(b"S9"), Reply::Nack);
        assert_eq!(bridge.pending_bitrate(), None);
    }

    #[test]
    fn test_transmit_while_idle_refused() {
        let (mut bridge, bus) = bridge();
        assert_eq!(bridge.handle_line(b"t1230"), Reply::Nack);
        assert!(bus.sent().is_empty());
    }

    #[test]
    fn test_transmit_in_configuring_activates() {
        let (mut bridge, bus) = bridge_configuring();
        bridge.pending_bitrate = Some(Bitrate::Rate1M);

        assert_eq!(bridge.handle_line(b"t1230"), Reply::Ack);
        assert_eq!(bridge.state(), BridgeState::Active);
        assert_eq!(bus.bitrate(), Some(Bitrate::Rate1M));
        assert_eq!(bus.sent().len(), 1);
    }

    fn bridge_configuring() -> (Bridge<MemoryInterface>, Arc<MemoryBus>) {
        let (mut bridge, bus) = bridge();
        assert_eq!(bridge.handle_line(b"O"), Reply::Ack);
        (bridge, bus)
    }

    #[test]
    fn test_transmit_in_configuring_without_bitrate() {
        let (mut bridge, bus) = bridge_configuring();
        assert_eq!(bridge.handle_line(b"t1230"), Reply::Nack);
        assert_eq!(bridge.state(), BridgeState::Configuring);
        assert!(bus.sent().is_empty());
    }

    #[test]
    fn test_close_returns_to_idle_and_keeps_bitrate() {
        let (mut bridge, bus) = bridge();
        bridge.handle_line(b"O");
        bridge.handle_line(b"S5");
        let rx = bridge.subscribe();
        assert!(rx.borrow().is_some());

        assert_eq!(bridge.handle_line(b"C"), Reply::Ack);
        assert_eq!(bridge.state(), BridgeState::Idle);
        assert!(!bus.is_up());
        assert_eq!(bus.attached(), 0);
        assert!(rx.borrow().is_none());

        // Reopen uses the last bitrate
        assert_eq!(bridge.handle_line(b"O"), Reply::Ack);
        assert_eq!(bridge.state(), BridgeState::Active);
        assert_eq!(bus.bitrate(), Some(Bitrate::Rate250K));
    }

    #[test]
    fn test_close_from_configuring() {
        let (mut bridge, bus) = bridge_configuring();
        assert_eq!(bridge.handle_line(b"C"), Reply::Ack);
        assert_eq!(bridge.state(), BridgeState::Idle);
        assert_eq!(bus.attached(), 0);
    }

    #[test]
    fn test_listen_only_rejects_transmit() {
        let (mut bridge, bus) = bridge();
        bridge.handle_line(b"S6");
        assert_eq!(bridge.handle_line(b"L"), Reply::Ack);
        assert_eq!(bus.mode(), InterfaceMode::ListenOnly);
        assert_eq!(bridge.state(), BridgeState::Active);
        assert_eq!(bridge.handle_line(b"t1230"), Reply::Nack);
        assert!(bus.sent().is_empty());

        // A later O restores the configured mode
        bridge.handle_line(b"C");
        bridge.handle_line(b"O");
        assert_eq!(bus.mode(), InterfaceMode::Normal);
        assert_eq!(bridge.handle_line(b"t1230"), Reply::Ack);
    }

    #[test]
    fn test_status_flags_set_and_cleared() {
        let (mut bridge, bus) = bridge();
        bus.set_tx_capacity(Some(1));
        bridge.handle_line(b"S6");
        bridge.handle_line(b"O");

        assert_eq!(bridge.handle_line(b"F"), Reply::Line(b"F00".to_vec()));
        assert_eq!(bridge.handle_line(b"t1230"), Reply::Ack);
        assert_eq!(bridge.handle_line(b"t1230"), Reply::Nack);
        assert_eq!(bridge.handle_line(b"F"), Reply::Line(b"F02".to_vec()));
        assert_eq!(bridge.handle_line(b"F"), Reply::Line(b"F00".to_vec()));

        // Link dropped underneath us
        bus.drain_sent();
        bus.set_link(false);
        assert_eq!(bridge.handle_line(b"t1230"), Reply::Nack);
        assert_eq!(bridge.handle_line(b"F"), Reply::Line(b"F80".to_vec()));
    }

    #[test]
    fn test_version_and_serial() {
        let (mut bridge, _bus) = setup(BridgeConfig {
            version: "2001".into(),
            serial_number: "A123".into(),
            ..BridgeConfig::default()
        });
        assert_eq!(bridge.handle_line(b"V"), Reply::Line(b"V2001".to_vec()));
        assert_eq!(bridge.handle_line(b"N"), Reply::Line(b"NA123".to_vec()));
        assert_eq!(bridge.state(), BridgeState::Idle);
    }

    #[test]
    fn test_timestamps_only_while_closed() {
        let (mut bridge, _bus) = bridge();
        assert_eq!(bridge.handle_line(b"Z1"), Reply::Ack);
        bridge.handle_line(b"S6");
        bridge.handle_line(b"O");
        assert!(bridge.subscribe().borrow().as_ref().unwrap().timestamps);
        assert_eq!(bridge.handle_line(b"Z0"), Reply::Nack);
    }

    #[test]
    fn test_open_brings_running_interface_down() {
        let (mut bridge, bus) = bridge();
        bus.set_link(true);
        assert_eq!(bridge.handle_line(b"L"), Reply::Ack);
        assert_eq!(bridge.state(), BridgeState::Configuring);
        assert!(!bus.is_up());
        assert_eq!(bus.mode(), InterfaceMode::ListenOnly);
    }

    #[test]
    fn test_failed_activation_on_open_stays_idle() {
        let (mut bridge, bus) = setup(BridgeConfig {
            default_bitrate: Some(Bitrate::Rate800K),
            ..BridgeConfig::default()
        });
        bus.fail_link(Some("Invalid argument"));
        let rx = bridge.subscribe();

        assert_eq!(bridge.handle_line(b"O"), Reply::Nack);
        assert_eq!(bridge.state(), BridgeState::Idle);
        assert_eq!(bus.attached(), 0);
        assert!(!bus.is_up());
        assert!(rx.borrow().is_none());

        // a retry is a fresh open, not AlreadyOpen
        assert_eq!(bridge.handle_line(b"O"), Reply::Nack);
        assert_eq!(bridge.state(), BridgeState::Idle);

        bus.fail_link(None);
        assert_eq!(bridge.handle_line(b"O"), Reply::Ack);
        assert_eq!(bridge.state(), BridgeState::Active);
        assert_eq!(bus.bitrate(), Some(Bitrate::Rate800K));
    }

    #[test]
    fn test_failed_bitrate_while_configuring() {
        let (mut bridge, bus) = bridge_configuring();
        let rx = bridge.subscribe();
        bus.fail_link(Some("Operation not supported"));

        assert_eq!(bridge.handle_line(b"S6"), Reply::Nack);
        assert_eq!(bridge.state(), BridgeState::Configuring);
        assert_eq!(bridge.pending_bitrate(), None);
        assert_eq!(bus.attached(), 1);
        assert!(!bus.is_up());
        assert!(rx.borrow().is_none());

        bus.fail_link(None);
        assert_eq!(bridge.handle_line(b"S6"), Reply::Ack);
        assert_eq!(bridge.state(), BridgeState::Active);
        assert!(rx.borrow().is_some());
    }

    #[test]
    fn test_failed_lazy_activation_stays_configuring() {
        let (mut bridge, bus) = bridge_configuring();
        bridge.pending_bitrate = Some(Bitrate::Rate1M);
        bus.fail_link(Some("Invalid argument"));

        assert_eq!(bridge.handle_line(b"t1230"), Reply::Nack);
        assert_eq!(bridge.state(), BridgeState::Configuring);
        assert!(bus.sent().is_empty());
    }

    #[test]
    fn test_close_if_open() {
        let (mut bridge, bus) = bridge();
        bridge.close_if_open();
        bridge.handle_line(b"S6");
        bridge.handle_line(b"O");
        bridge.close_if_open();
        assert_eq!(bridge.state(), BridgeState::Idle);
        assert!(!bus.is_up());
    }
}
