// src/io/socketcan/interface.rs
//
// SocketCAN implementation of the interface seam.
//
// The raw CAN socket is non-blocking and registered with the tokio reactor,
// so receiving suspends without a dedicated thread. Link configuration is
// delegated to `LinkControl`.
//
// This module is only fully functional on Linux.

#[cfg(target_os = "linux")]
mod linux_impl {
    use std::sync::{Arc, Mutex, PoisonError};

    use async_trait::async_trait;
    use socketcan::{CanSocket, Socket};
    use tokio::io::unix::AsyncFd;
    use tokio::sync::watch;

    use crate::frame::{Bitrate, CanFrame, InterfaceMode};
    use crate::io::error::IfaceError;
    use crate::io::interface::{CanHandle, CanInterface};
    use crate::io::socketcan::codec::{from_socketcan, to_socketcan};
    use crate::io::socketcan::link::{is_link_up, is_virtual_link, LinkControl};

    /// errno values surfaced by the CAN socket
    const ENODEV: i32 = 19;
    const ENETDOWN: i32 = 100;
    const ENOBUFS: i32 = 105;

    pub struct SocketCanInterface {
        link: Arc<LinkControl>,
        create_virtual: bool,
    }

    impl SocketCanInterface {
        /// `create_virtual`: create a missing interface as vcan on attach and
        /// remove it again on detach.
        pub fn new(create_virtual: bool, link_helper: Option<String>) -> Self {
            SocketCanInterface {
                link: Arc::new(LinkControl::new(link_helper)),
                create_virtual,
            }
        }
    }

    impl CanInterface for SocketCanInterface {
        type Handle = SocketCanHandle;

        fn attach(&self, name: &str) -> Result<Arc<SocketCanHandle>, IfaceError> {
            let mut created = false;
            let socket = match open_socket(name) {
                Err(IfaceError::NotFound(_)) if self.create_virtual => {
                    self.link.add_vcan(name)?;
                    created = true;
                    tlog!("[socketcan] Created virtual interface {}", name);
                    open_socket(name).inspect_err(|_| {
                        let _ = self.link.delete(name);
                    })?
                }
                other => other?,
            };

            let virtual_link = created || is_virtual_link(name);
            tlog!(
                "[socketcan] Attached to {}{}",
                name,
                if virtual_link { " (virtual)" } else { "" }
            );

            let (closed, _) = watch::channel(false);
            Ok(Arc::new(SocketCanHandle {
                name: name.to_string(),
                socket,
                link: Arc::clone(&self.link),
                virtual_link,
                created,
                bitrate: ConfiguredBitrate::default(),
                closed,
            }))
        }
    }

    fn open_socket(name: &str) -> Result<AsyncFd<CanSocket>, IfaceError> {
        let socket = CanSocket::open(name).map_err(|e| map_open_error(name, e))?;
        socket.set_nonblocking(true)?;
        Ok(AsyncFd::new(socket)?)
    }

    fn map_open_error(name: &str, e: std::io::Error) -> IfaceError {
        if e.raw_os_error() == Some(ENODEV)
            || e.kind() == std::io::ErrorKind::NotFound
            || e.to_string().contains("No such device")
        {
            IfaceError::NotFound(name.to_string())
        } else if e.kind() == std::io::ErrorKind::PermissionDenied {
            IfaceError::PermissionDenied(name.to_string())
        } else {
            IfaceError::Io(e)
        }
    }

    fn map_send_error(e: std::io::Error) -> IfaceError {
        match e.raw_os_error() {
            Some(ENOBUFS) => IfaceError::TxBufferFull,
            Some(ENETDOWN) => IfaceError::Down,
            _ if e.kind() == std::io::ErrorKind::WouldBlock => IfaceError::TxBufferFull,
            _ => IfaceError::Io(e),
        }
    }

    /// Bitrate this handle has applied. The kernel only reports a missing
    /// bitrate as EINVAL on `ip link set up`.
    #[derive(Default)]
    struct ConfiguredBitrate(Mutex<Option<Bitrate>>);

    impl ConfiguredBitrate {
        fn record(&self, bitrate: Bitrate) {
            *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(bitrate);
        }

        fn require(&self) -> Result<Bitrate, IfaceError> {
            self.0
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .ok_or(IfaceError::NoBitrateConfigured)
        }
    }

    pub struct SocketCanHandle {
        name: String,
        socket: AsyncFd<CanSocket>,
        link: Arc<LinkControl>,
        virtual_link: bool,
        created: bool,
        bitrate: ConfiguredBitrate,
        closed: watch::Sender<bool>,
    }

    impl SocketCanHandle {
        fn ensure_down(&self) -> Result<(), IfaceError> {
            if self.is_up() {
                Err(IfaceError::BusyWhileUp)
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CanHandle for SocketCanHandle {
        fn name(&self) -> &str {
            &self.name
        }

        fn set_bitrate(&self, bitrate: Bitrate) -> Result<(), IfaceError> {
            self.ensure_down()?;
            if self.virtual_link {
                tlog!(
                    "[socketcan] {} is virtual, bitrate {} not applied",
                    self.name,
                    bitrate
                );
            } else {
                self.link.set_bitrate(&self.name, bitrate.bits_per_second())?;
            }
            self.bitrate.record(bitrate);
            Ok(())
        }

        fn set_mode(&self, mode: InterfaceMode) -> Result<(), IfaceError> {
            self.ensure_down()?;
            if self.virtual_link {
                return Ok(());
            }
            self.link.set_mode(&self.name, mode)
        }

        fn up(&self) -> Result<(), IfaceError> {
            self.bitrate.require()?;
            self.link.set_up(&self.name, true)
        }

        fn down(&self) -> Result<(), IfaceError> {
            self.link.set_up(&self.name, false)
        }

        fn is_up(&self) -> bool {
            is_link_up(&self.name)
        }

        async fn recv_frame(&self) -> Option<CanFrame> {
            let mut closed = self.closed.subscribe();
            if *closed.borrow_and_update() {
                return None;
            }
            loop {
                let mut guard = tokio::select! {
                    ready = self.socket.readable() => match ready {
                        Ok(guard) => guard,
                        Err(e) => {
                            tlog!("[socketcan] {}: poll failed: {}", self.name, e);
                            return None;
                        }
                    },
                    _ = closed.changed() => return None,
                };

                match guard.try_io(|inner| inner.get_ref().read_frame()) {
                    Ok(Ok(frame)) => {
                        if let Some(frame) = from_socketcan(&frame) {
                            return Some(frame);
                        }
                    }
                    Ok(Err(e)) => {
                        tlog!("[socketcan] {}: read failed: {}", self.name, e);
                        return None;
                    }
                    Err(_would_block) => continue,
                }
            }
        }

        fn send_frame(&self, frame: &CanFrame) -> Result<(), IfaceError> {
            if *self.closed.borrow() {
                return Err(IfaceError::Down);
            }
            let kernel_frame = to_socketcan(frame).ok_or_else(|| {
                IfaceError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("cannot represent {:?}", frame),
                ))
            })?;
            self.socket
                .get_ref()
                .write_frame(&kernel_frame)
                .map_err(map_send_error)
        }

        fn detach(&self) {
            self.closed.send_replace(true);
            if self.created {
                match self.link.delete(&self.name) {
                    Ok(()) => tlog!("[socketcan] Removed virtual interface {}", self.name),
                    Err(e) => tlog!("[socketcan] Failed to remove {}: {}", self.name, e),
                }
            }
        }
    }

}

#[cfg(not(target_os = "linux"))]
mod stub {
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::frame::{Bitrate, CanFrame, InterfaceMode};
    use crate::io::error::IfaceError;
    use crate::io::interface::{CanHandle, CanInterface};

    pub struct SocketCanInterface;

    impl SocketCanInterface {
        pub fn new(_create_virtual: bool, _link_helper: Option<String>) -> Self {
            SocketCanInterface
        }
    }

    impl CanInterface for SocketCanInterface {
        type Handle = SocketCanHandle;

        fn attach(&self, _name: &str) -> Result<Arc<SocketCanHandle>, IfaceError> {
            Err(IfaceError::Unsupported(
                "SocketCAN is only available on Linux".to_string(),
            ))
        }
    }

    /// Never constructed off Linux.
    pub enum SocketCanHandle {}

    #[async_trait]
    impl CanHandle for SocketCanHandle {
        fn name(&self) -> &str {
            match *self {}
        }

        fn set_bitrate(&self, _bitrate: Bitrate) -> Result<(), IfaceError> {
            match *self {}
        }

        fn set_mode(&self, _mode: InterfaceMode) -> Result<(), IfaceError> {
            match *self {}
        }

        fn up(&self) -> Result<(), IfaceError> {
            match *self {}
        }

        fn down(&self) -> Result<(), IfaceError> {
            match *self {}
        }

        fn is_up(&self) -> bool {
            match *self {}
        }

        async fn recv_frame(&self) -> Option<CanFrame> {
            match *self {}
        }

        fn send_frame(&self, _frame: &CanFrame) -> Result<(), IfaceError> {
            match *self {}
        }

        fn detach(&self) {
            match *self {}
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux_impl::{SocketCanHandle, SocketCanInterface};

#[cfg(not(target_os = "linux"))]
pub use stub::{SocketCanHandle, SocketCanInterface};
