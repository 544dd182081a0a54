// src/io/interface.rs
//
// Seam between the bridge and a CAN network interface.
//
// `CanInterface` attaches to a named interface and yields a shared handle.
// The handle carries the lifecycle (configure while down, bring up, bring
// down, detach) and the frame path. Two implementations exist: SocketCAN on
// Linux and an in-memory bus used by tests.

use std::sync::Arc;

use async_trait::async_trait;

use crate::frame::{Bitrate, CanFrame, InterfaceMode};
use crate::io::error::IfaceError;

/// Factory for interface handles.
pub trait CanInterface: Send + Sync {
    type Handle: CanHandle;

    /// Attach to `name`.
    ///
    /// Fails with `NotFound` if no such interface exists and
    /// `PermissionDenied` if the process may not use it.
    fn attach(&self, name: &str) -> Result<Arc<Self::Handle>, IfaceError>;
}

/// An attached interface.
///
/// All methods take `&self` so the command task and the forwarding task can
/// share one handle through an `Arc`.
#[async_trait]
pub trait CanHandle: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Configure the bus bitrate. Only valid while the interface is down.
    fn set_bitrate(&self, bitrate: Bitrate) -> Result<(), IfaceError>;

    /// Configure the controller mode. Only valid while the interface is down.
    fn set_mode(&self, mode: InterfaceMode) -> Result<(), IfaceError>;

    /// Bring the interface up. Requires a configured bitrate.
    fn up(&self) -> Result<(), IfaceError>;

    fn down(&self) -> Result<(), IfaceError>;

    fn is_up(&self) -> bool;

    /// Wait for the next frame from the bus.
    ///
    /// Returns `None` once the handle is detached or the interface is gone.
    async fn recv_frame(&self) -> Option<CanFrame>;

    /// Queue `frame` for transmission without blocking.
    ///
    /// `Down` if the interface is not up, `TxBufferFull` if the transmit
    /// queue has no room.
    fn send_frame(&self, frame: &CanFrame) -> Result<(), IfaceError>;

    /// Release the interface and wake any pending `recv_frame`.
    fn detach(&self);
}
