// src/bridge/mod.rs
//
// The serial <-> CAN bridge.
//
// Two tasks share the serial writer:
// - the command task reads lines, runs them through the `Bridge` state
//   machine and writes one reply per line
// - the forwarder follows the published active handle and writes every
//   received frame as an slcan line
//
// Either task failing, or a shutdown request, ends the bridge. The channel
// is closed on the way out.

mod state;

pub use state::{
    ActiveLink, Bridge, BridgeConfig, BridgeState, CommandError, Reply, STATUS_TX_ERROR,
    STATUS_TX_FULL,
};

use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use crate::io::error::ProtocolError;
use crate::io::interface::{CanHandle, CanInterface};
use crate::io::now_us;
use crate::io::serial::{SerialReader, SerialWriter};
use crate::io::slcan::{timestamp_ms, SlcanCodec};

/// Conditions that end the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("serial peer closed the line")]
    SerialClosed,
    #[error("serial I/O failed: {0}")]
    Serial(#[source] std::io::Error),
    #[error("CAN interface {0} was lost")]
    InterfaceLost(String),
    #[error("bridge task failed: {0}")]
    Task(String),
}

// ============================================================================
// Shutdown
// ============================================================================

/// Cloneable stop request observed by both bridge tasks.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        ShutdownHandle(Arc::new(tx))
    }

    pub fn trigger(&self) {
        self.0.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once shutdown has been requested.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Run the bridge until the serial line closes, the interface is lost, or
/// `shutdown` is triggered. A shutdown request is a clean exit.
pub async fn run<I, R, W>(
    mut bridge: Bridge<I>,
    mut reader: SerialReader<R>,
    writer: SerialWriter<W>,
    shutdown: ShutdownHandle,
) -> Result<(), BridgeError>
where
    I: CanInterface,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut forwarder = tokio::spawn(forward_frames(
        bridge.subscribe(),
        writer.clone(),
        shutdown.subscribe(),
    ));

    enum Exit {
        Commands(Result<(), BridgeError>),
        Forwarder(Result<(), BridgeError>),
        Shutdown,
    }

    let mut stop = shutdown.subscribe();
    let exit = tokio::select! {
        result = command_loop(&mut bridge, &mut reader, &writer) => Exit::Commands(result),
        joined = &mut forwarder => Exit::Forwarder(
            joined.unwrap_or_else(|e| Err(BridgeError::Task(e.to_string())))
        ),
        _ = stopped(&mut stop) => Exit::Shutdown,
    };

    bridge.close_if_open();
    shutdown.trigger();

    let result = match exit {
        Exit::Forwarder(result) => result,
        Exit::Commands(result) => {
            let _ = forwarder.await;
            result
        }
        Exit::Shutdown => {
            let _ = forwarder.await;
            Ok(())
        }
    };

    if let Err(e) = writer.close().await {
        tlog!("[serial] Flush on close failed: {}", e);
    }

    match &result {
        Ok(()) => tlog!("[bridge] Stopped"),
        Err(e) => tlog!("[bridge] Stopped: {}", e),
    }
    result
}

async fn command_loop<I, R, W>(
    bridge: &mut Bridge<I>,
    reader: &mut SerialReader<R>,
    writer: &SerialWriter<W>,
) -> Result<(), BridgeError>
where
    I: CanInterface,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let reply = match reader.read_line().await {
            Ok(Some(line)) => bridge.handle_line(&line),
            Ok(None) => return Err(BridgeError::SerialClosed),
            Err(ProtocolError::LineTooLong { limit }) => {
                tlog!("[serial] Dropped line longer than {} bytes", limit);
                Reply::Nack
            }
            Err(ProtocolError::Io(e)) => return Err(BridgeError::Serial(e)),
        };
        send_reply(writer, &reply)
            .await
            .map_err(BridgeError::Serial)?;
    }
}

async fn send_reply<W: AsyncWrite + Unpin>(
    writer: &SerialWriter<W>,
    reply: &Reply,
) -> std::io::Result<()> {
    match reply {
        Reply::Ack => writer.write_ack(true).await,
        Reply::Nack => writer.write_ack(false).await,
        Reply::Line(line) => writer.write_line(line).await,
    }
}

fn is_current<H>(links: &watch::Receiver<Option<ActiveLink<H>>>, handle: &Arc<H>) -> bool {
    links
        .borrow()
        .as_ref()
        .is_some_and(|link| Arc::ptr_eq(&link.handle, handle))
}

/// Forward frames from whichever handle is currently published.
async fn forward_frames<H, W>(
    mut links: watch::Receiver<Option<ActiveLink<H>>>,
    writer: SerialWriter<W>,
    mut stop: watch::Receiver<bool>,
) -> Result<(), BridgeError>
where
    H: CanHandle,
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let current = links.borrow_and_update().clone();
        let Some(link) = current else {
            tokio::select! {
                changed = links.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                _ = stopped(&mut stop) => return Ok(()),
            }
            continue;
        };

        tokio::select! {
            received = link.handle.recv_frame() => match received {
                Some(frame) => {
                    let line = if link.timestamps {
                        SlcanCodec::encode_frame_with_timestamp(&frame, timestamp_ms(now_us()))
                    } else {
                        SlcanCodec::encode_frame(&frame)
                    };
                    // Frames from a handle withdrawn by a close are dropped
                    writer
                        .write_line_if(&line, || is_current(&links, &link.handle))
                        .await
                        .map_err(BridgeError::Serial)?;
                }
                None => {
                    if is_current(&links, &link.handle) {
                        return Err(BridgeError::InterfaceLost(link.handle.name().to_string()));
                    }
                }
            },
            changed = links.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            _ = stopped(&mut stop) => return Ok(()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
