// src/io/memory.rs
//
// In-memory CAN interfaces.
//
// Each named `MemoryBus` behaves like a netdev: bitrate and mode are only
// writable while down, frames are only delivered while up, and the transmit
// queue can be bounded to exercise backpressure. The test side plays the
// remote nodes through `inject` and `drain_sent`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::frame::{Bitrate, CanFrame, InterfaceMode};
use crate::io::error::IfaceError;
use crate::io::interface::{CanHandle, CanInterface};

/// Registry of in-memory buses, keyed by interface name.
#[derive(Default)]
pub struct MemoryInterface {
    buses: Mutex<HashMap<String, Arc<MemoryBus>>>,
}

impl MemoryInterface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the bus `name`, or return it if it already exists.
    pub fn add_bus(&self, name: &str) -> Arc<MemoryBus> {
        let mut buses = self.buses.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            buses
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(MemoryBus::new(name))),
        )
    }

    pub fn bus(&self, name: &str) -> Option<Arc<MemoryBus>> {
        let buses = self.buses.lock().unwrap_or_else(PoisonError::into_inner);
        buses.get(name).cloned()
    }
}

impl CanInterface for MemoryInterface {
    type Handle = MemoryHandle;

    fn attach(&self, name: &str) -> Result<Arc<MemoryHandle>, IfaceError> {
        let bus = self
            .bus(name)
            .ok_or_else(|| IfaceError::NotFound(name.to_string()))?;
        MemoryHandle::attach(bus).map(Arc::new)
    }
}

// ============================================================================
// Bus
// ============================================================================

#[derive(Default)]
struct BusState {
    bitrate: Option<Bitrate>,
    mode: InterfaceMode,
    up: bool,
    restricted: bool,
    link_fault: Option<String>,
    tx_capacity: Option<usize>,
    tx_queue: Vec<CanFrame>,
    listeners: Vec<(u64, mpsc::UnboundedSender<CanFrame>)>,
}

/// One simulated CAN network interface.
pub struct MemoryBus {
    name: String,
    state: Mutex<BusState>,
    next_listener: AtomicU64,
}

impl MemoryBus {
    fn new(name: &str) -> Self {
        MemoryBus {
            name: name.to_string(),
            state: Mutex::new(BusState::default()),
            next_listener: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deliver a frame from a remote node to every attached handle.
    /// Returns false if the interface is down or nobody is attached.
    pub fn inject(&self, frame: CanFrame) -> bool {
        let mut state = self.state();
        if !state.up {
            return false;
        }
        state.listeners.retain(|(_, tx)| tx.send(frame).is_ok());
        !state.listeners.is_empty()
    }

    /// Frames transmitted and not yet drained, oldest first.
    pub fn sent(&self) -> Vec<CanFrame> {
        self.state().tx_queue.clone()
    }

    /// Take all queued transmit frames, freeing queue space.
    pub fn drain_sent(&self) -> Vec<CanFrame> {
        std::mem::take(&mut self.state().tx_queue)
    }

    /// Bound the transmit queue. `None` is unbounded.
    pub fn set_tx_capacity(&self, capacity: Option<usize>) {
        self.state().tx_capacity = capacity;
    }

    /// Refuse attaches with `PermissionDenied`.
    pub fn set_restricted(&self, restricted: bool) {
        self.state().restricted = restricted;
    }

    /// Make link configuration (`set_bitrate`, `up`) fail with
    /// `IfaceError::Link(reason)` until cleared with `None`.
    pub fn fail_link(&self, reason: Option<&str>) {
        self.state().link_fault = reason.map(str::to_string);
    }

    pub fn bitrate(&self) -> Option<Bitrate> {
        self.state().bitrate
    }

    pub fn mode(&self) -> InterfaceMode {
        self.state().mode
    }

    pub fn is_up(&self) -> bool {
        self.state().up
    }

    /// Change link state from outside, as `ip link set` would.
    pub fn set_link(&self, up: bool) {
        self.state().up = up;
    }

    /// Remove the device: every attached handle sees its receive stream end.
    pub fn unplug(&self) {
        let mut state = self.state();
        state.up = false;
        state.listeners.clear();
    }

    /// Number of currently attached handles.
    pub fn attached(&self) -> usize {
        self.state().listeners.len()
    }
}

// ============================================================================
// Handle
// ============================================================================

pub struct MemoryHandle {
    bus: Arc<MemoryBus>,
    listener_id: u64,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<CanFrame>>,
    closed: watch::Sender<bool>,
}

impl MemoryHandle {
    fn attach(bus: Arc<MemoryBus>) -> Result<Self, IfaceError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener_id = bus.next_listener.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = bus.state();
            if state.restricted {
                return Err(IfaceError::PermissionDenied(bus.name.clone()));
            }
            state.listeners.push((listener_id, tx));
        }
        let (closed, _) = watch::channel(false);
        Ok(MemoryHandle {
            bus,
            listener_id,
            rx: tokio::sync::Mutex::new(rx),
            closed,
        })
    }

    pub fn bus(&self) -> &Arc<MemoryBus> {
        &self.bus
    }

    fn is_detached(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl CanHandle for MemoryHandle {
    fn name(&self) -> &str {
        &self.bus.name
    }

    fn set_bitrate(&self, bitrate: Bitrate) -> Result<(), IfaceError> {
        let mut state = self.bus.state();
        if state.up {
            return Err(IfaceError::BusyWhileUp);
        }
        if let Some(reason) = &state.link_fault {
            return Err(IfaceError::Link(reason.clone()));
        }
        state.bitrate = Some(bitrate);
        Ok(())
    }

    fn set_mode(&self, mode: InterfaceMode) -> Result<(), IfaceError> {
        let mut state = self.bus.state();
        if state.up {
            return Err(IfaceError::BusyWhileUp);
        }
        state.mode = mode;
        Ok(())
    }

    fn up(&self) -> Result<(), IfaceError> {
        let mut state = self.bus.state();
        if state.bitrate.is_none() {
            return Err(IfaceError::NoBitrateConfigured);
        }
        if let Some(reason) = &state.link_fault {
            return Err(IfaceError::Link(reason.clone()));
        }
        state.up = true;
        Ok(())
    }

    fn down(&self) -> Result<(), IfaceError> {
        self.bus.state().up = false;
        Ok(())
    }

    fn is_up(&self) -> bool {
        self.bus.is_up()
    }

    async fn recv_frame(&self) -> Option<CanFrame> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return None;
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            frame = rx.recv() => frame,
            _ = closed.changed() => None,
        }
    }

    fn send_frame(&self, frame: &CanFrame) -> Result<(), IfaceError> {
        if self.is_detached() {
            return Err(IfaceError::Down);
        }
        let mut state = self.bus.state();
        if !state.up {
            return Err(IfaceError::Down);
        }
        if let Some(capacity) = state.tx_capacity {
            if state.tx_queue.len() >= capacity {
                return Err(IfaceError::TxBufferFull);
            }
        }
        state.tx_queue.push(*frame);
        if state.mode == InterfaceMode::Loopback {
            state.listeners.retain(|(_, tx)| tx.send(*frame).is_ok());
        }
        Ok(())
    }

    fn detach(&self) {
        self.closed.send_replace(true);
        let id = self.listener_id;
        self.bus.state().listeners.retain(|(listener, _)| *listener != id);
    }
}

// ============================================================================
// Tests
// ============================================================================
