// src/io/socketcan/codec.rs
//
// Conversion between our frame type and the socketcan crate's classic frames.

use socketcan::{CanFrame as SocketFrame, EmbeddedFrame, ExtendedId, Frame, Id, StandardId};

use crate::frame::{CanFrame, CAN_EFF_MASK};

/// Build a kernel frame for transmission.
pub fn to_socketcan(frame: &CanFrame) -> Option<SocketFrame> {
    let id = if frame.is_extended() {
        Id::Extended(ExtendedId::new(frame.id())?)
    } else {
        Id::Standard(StandardId::new(u16::try_from(frame.id()).ok()?)?)
    };

    if frame.is_remote() {
        <SocketFrame as EmbeddedFrame>::new_remote(id, frame.dlc() as usize)
    } else {
        <SocketFrame as EmbeddedFrame>::new(id, frame.payload())
    }
}

/// Convert a received kernel frame. Error frames are skipped.
pub fn from_socketcan(frame: &SocketFrame) -> Option<CanFrame> {
    if frame.is_error_frame() {
        return None;
    }
    let id = frame.raw_id() & CAN_EFF_MASK;
    if frame.is_remote_frame() {
        CanFrame::new_remote(id, frame.is_extended(), frame.dlc() as u8)
    } else {
        CanFrame::new_data(id, frame.is_extended(), frame.data())
    }
}
