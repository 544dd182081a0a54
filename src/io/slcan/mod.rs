// src/io/slcan/mod.rs
//
// slcan (Serial Line CAN) protocol, spoken from the adapter side: the serial
// peer sends Lawicel/slcan commands and this daemon answers them.
//
// Protocol reference: http://www.can232.com/docs/can232_v3.pdf

pub mod codec;

pub use codec::{timestamp_ms, SlcanCodec, ACK_ERROR, TERMINATOR};
