// src/io/slcan/codec.rs
//
// slcan (Serial Line CAN) ASCII protocol codec.
//
// Protocol reference: http://www.can232.com/docs/can232_v3.pdf
//
// Frame formats:
//   Standard: t<ID:3hex><DLC:1hex><DATA:2hex*DLC>
//   Extended: T<ID:8hex><DLC:1hex><DATA:2hex*DLC>
//   RTR:      r<ID:3hex><DLC:1hex> / R<ID:8hex><DLC:1hex>
//
// Commands:
//   O open, L open listen-only, C close, S0-S8 bitrate, Z0/Z1 timestamps,
//   F status flags, V version, N serial number
//
// Lines passed to and returned from this codec never include the `\r`
// terminator; the serial channel owns line termination.

use crate::frame::{Bitrate, CanFrame, Command, CAN_EFF_MASK, CAN_MAX_DLC, CAN_SFF_MASK};
use crate::io::error::DecodeError;

/// Line terminator and success acknowledgment
pub const TERMINATOR: u8 = b'\r';
/// Error acknowledgment (bell)
pub const ACK_ERROR: u8 = 0x07;

/// Timestamps wrap at 60 seconds, in milliseconds
pub const TIMESTAMP_WRAP_MS: u64 = 60_000;

const STD_ID_LEN: usize = 3;
const EXT_ID_LEN: usize = 8;

/// slcan (Serial Line CAN) ASCII protocol codec.
pub struct SlcanCodec;

impl SlcanCodec {
    /// Decode one terminator-stripped command line.
    ///
    /// Examples:
    ///   `t1234AABBCCDD` -> Transmit, ID=0x123, DLC=4, data=AA BB CC DD
    ///   `T123456782AABB` -> TransmitExtended, ID=0x12345678, DLC=2
    ///   `r1230` -> TransmitRemote, standard ID=0x123, DLC=0
    ///   `S6` -> SetBitrate(500k)
    pub fn decode(line: &[u8]) -> Result<Command, DecodeError> {
        let (&first, rest) = line
            .split_first()
            .ok_or_else(|| DecodeError::malformed("empty line"))?;

        match first {
            b'O' => no_operands(Command::OpenChannel, rest),
            b'L' => no_operands(Command::OpenListenOnly, rest),
            b'C' => no_operands(Command::CloseChannel, rest),
            b'F' => no_operands(Command::ReadStatus, rest),
            b'V' => no_operands(Command::ReadVersion, rest),
            b'N' => no_operands(Command::ReadSerial, rest),
            b'S' => {
                let digit = single_hex_operand('S', rest)?;
                Bitrate::from_digit(digit)
                    .map(Command::SetBitrate)
                    .ok_or_else(|| DecodeError::invalid_operand(format!("bitrate digit {:X}", digit)))
            }
            b'Z' => match single_hex_operand('Z', rest)? {
                0 => Ok(Command::SetTimestamps(false)),
                1 => Ok(Command::SetTimestamps(true)),
                other => Err(DecodeError::invalid_operand(format!("timestamp flag {:X}", other))),
            },
            b't' => decode_frame(rest, false, false).map(Command::Transmit),
            b'T' => decode_frame(rest, true, false).map(Command::TransmitExtended),
            b'r' => decode_frame(rest, false, true).map(Command::TransmitRemote),
            b'R' => decode_frame(rest, true, true).map(Command::TransmitRemote),
            c => Err(DecodeError::malformed(format!(
                "unknown command '{}'",
                (c as char).escape_default()
            ))),
        }
    }

    /// Encode a CAN frame as an slcan line (without terminator).
    ///
    /// The command letter follows the frame flags: `t`/`T` for data frames,
    /// `r`/`R` for remote frames.
    pub fn encode_frame(frame: &CanFrame) -> Vec<u8> {
        let mut line = String::with_capacity(32);

        let prefix = match (frame.is_extended(), frame.is_remote()) {
            (false, false) => 't',
            (true, false) => 'T',
            (false, true) => 'r',
            (true, true) => 'R',
        };
        line.push(prefix);

        if frame.is_extended() {
            line.push_str(&format!("{:08X}", frame.id() & CAN_EFF_MASK));
        } else {
            line.push_str(&format!("{:03X}", frame.id() & CAN_SFF_MASK));
        }

        line.push_str(&format!("{:X}", frame.dlc().min(CAN_MAX_DLC)));
        line.push_str(&hex::encode_upper(frame.payload()));

        line.into_bytes()
    }

    /// Encode a CAN frame followed by a 4-digit millisecond timestamp.
    pub fn encode_frame_with_timestamp(frame: &CanFrame, timestamp_ms: u16) -> Vec<u8> {
        let mut line = Self::encode_frame(frame);
        line.extend_from_slice(format!("{:04X}", timestamp_ms).as_bytes());
        line
    }

    /// Encode a command as an slcan line (without terminator).
    pub fn encode_command(command: &Command) -> Vec<u8> {
        match command {
            Command::OpenChannel => b"O".to_vec(),
            Command::OpenListenOnly => b"L".to_vec(),
            Command::CloseChannel => b"C".to_vec(),
            Command::ReadStatus => b"F".to_vec(),
            Command::ReadVersion => b"V".to_vec(),
            Command::ReadSerial => b"N".to_vec(),
            Command::SetBitrate(rate) => format!("S{}", rate.digit()).into_bytes(),
            Command::SetTimestamps(on) => format!("Z{}", u8::from(*on)).into_bytes(),
            Command::Transmit(frame)
            | Command::TransmitExtended(frame)
            | Command::TransmitRemote(frame) => Self::encode_frame(frame),
        }
    }

    /// Reply to `F`: status flags as two hex digits
    pub fn status_reply(flags: u8) -> Vec<u8> {
        format!("F{:02X}", flags).into_bytes()
    }

    /// Reply to `V`
    pub fn version_reply(version: &str) -> Vec<u8> {
        format!("V{}", version).into_bytes()
    }

    /// Reply to `N`
    pub fn serial_reply(serial_number: &str) -> Vec<u8> {
        format!("N{}", serial_number).into_bytes()
    }
}

/// Convert a host time in microseconds to the wrapping slcan timestamp
pub fn timestamp_ms(now_us: u64) -> u16 {
    ((now_us / 1_000) % TIMESTAMP_WRAP_MS) as u16
}

fn no_operands(command: Command, rest: &[u8]) -> Result<Command, DecodeError> {
    if rest.is_empty() {
        Ok(command)
    } else {
        Err(DecodeError::malformed(format!(
            "unexpected operands after {:?}",
            command
        )))
    }
}

fn single_hex_operand(letter: char, rest: &[u8]) -> Result<u8, DecodeError> {
    match rest {
        [digit] => hex_nibble(*digit)
            .ok_or_else(|| DecodeError::malformed(format!("non-hex operand for '{}'", letter))),
        _ => Err(DecodeError::malformed(format!(
            "'{}' takes exactly one hex digit",
            letter
        ))),
    }
}

/// Decode the part of a frame command after the command letter.
fn decode_frame(rest: &[u8], extended: bool, remote: bool) -> Result<CanFrame, DecodeError> {
    let id_len = if extended { EXT_ID_LEN } else { STD_ID_LEN };
    let header_len = id_len + 1; // ID + DLC

    if rest.len() < header_len {
        return Err(DecodeError::malformed(format!(
            "frame too short: {} bytes, need at least {}",
            rest.len() + 1,
            header_len + 1
        )));
    }

    let id = parse_hex(&rest[..id_len])
        .ok_or_else(|| DecodeError::malformed("invalid hex in frame ID"))?;
    let max_id = if extended { CAN_EFF_MASK } else { CAN_SFF_MASK };
    if id > max_id {
        return Err(DecodeError::invalid_operand(format!(
            "ID 0x{:X} out of range (max 0x{:X})",
            id, max_id
        )));
    }

    let dlc = hex_nibble(rest[id_len])
        .ok_or_else(|| DecodeError::malformed("invalid DLC character"))?;
    if dlc > CAN_MAX_DLC {
        return Err(DecodeError::malformed(format!(
            "invalid DLC: {} (max {})",
            dlc, CAN_MAX_DLC
        )));
    }

    let payload_digits = &rest[header_len..];
    if remote {
        if !payload_digits.is_empty() {
            return Err(DecodeError::malformed("remote frame carries payload digits"));
        }
        return CanFrame::new_remote(id, extended, dlc)
            .ok_or_else(|| DecodeError::malformed("invalid remote frame"));
    }

    let expected = dlc as usize * 2;
    if payload_digits.len() != expected {
        return Err(DecodeError::malformed(format!(
            "payload has {} hex digits, DLC {} needs {}",
            payload_digits.len(),
            dlc,
            expected
        )));
    }

    let payload = hex::decode(payload_digits)
        .map_err(|e| DecodeError::malformed(format!("invalid payload: {}", e)))?;

    CanFrame::new_data(id, extended, &payload)
        .ok_or_else(|| DecodeError::malformed("invalid data frame"))
}

fn hex_nibble(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|d| d as u8)
}

fn parse_hex(digits: &[u8]) -> Option<u32> {
    digits
        .iter()
        .try_fold(0u32, |acc, &b| Some((acc << 4) | hex_nibble(b)? as u32))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_of(command: Command) -> CanFrame {
        *command.frame().expect("transmit command")
    }

    #[test]
    fn test_slcan_decode_standard_frame() {
        let frame = frame_of(SlcanCodec::decode(b"t1234AABBCCDD").unwrap());
        assert_eq!(frame.id(), 0x123);
        assert_eq!(frame.dlc(), 4);
        assert_eq!(frame.payload(), &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert!(!frame.is_extended());
    }

    #[test]
    fn test_slcan_decode_extended_frame() {
        let command = SlcanCodec::decode(b"T123456782AABB").unwrap();
        assert!(matches!(command, Command::TransmitExtended(_)));
        let frame = frame_of(command);
        assert_eq!(frame.id(), 0x12345678);
        assert_eq!(frame.payload(), &[0xAA, 0xBB]);
        assert!(frame.is_extended());
    }

    #[test]
    fn test_slcan_decode_lowercase_hex() {
        let frame = frame_of(SlcanCodec::decode(b"t7ff2aabb").unwrap());
        assert_eq!(frame.id(), 0x7FF);
        assert_eq!(frame.payload(), &[0xAA, 0xBB]);
    }

    #[test]
    fn test_slcan_decode_zero_dlc() {
        let frame = frame_of(SlcanCodec::decode(b"t1230").unwrap());
        assert_eq!(frame.id(), 0x123);
        assert_eq!(frame.dlc(), 0);
        assert!(frame.payload().is_empty());
    }

    #[test]
    fn test_slcan_decode_rtr() {
        let command = SlcanCodec::decode(b"r1234").unwrap();
        assert!(matches!(command, Command::TransmitRemote(_)));
        let frame = frame_of(command);
        assert_eq!(frame.id(), 0x123);
        assert_eq!(frame.dlc(), 4);
        assert!(frame.is_remote());
        assert!(frame.payload().is_empty());

        let frame = frame_of(SlcanCodec::decode(b"R123456780").unwrap());
        assert!(frame.is_extended());
        assert!(frame.is_remote());
    }

    #[test]
    fn test_slcan_decode_rtr_with_payload_is_malformed() {
        assert!(matches!(
            SlcanCodec::decode(b"r1232AABB"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_slcan_decode_control_commands() {
        assert_eq!(SlcanCodec::decode(b"O").unwrap(), Command::OpenChannel);
        assert_eq!(SlcanCodec::decode(b"L").unwrap(), Command::OpenListenOnly);
        assert_eq!(SlcanCodec::decode(b"C").unwrap(), Command::CloseChannel);
        assert_eq!(SlcanCodec::decode(b"F").unwrap(), Command::ReadStatus);
        assert_eq!(SlcanCodec::decode(b"V").unwrap(), Command::ReadVersion);
        assert_eq!(SlcanCodec::decode(b"N").unwrap(), Command::ReadSerial);
        assert_eq!(SlcanCodec::decode(b"Z1").unwrap(), Command::SetTimestamps(true));
        assert_eq!(
            SlcanCodec::decode(b"S6").unwrap(),
            Command::SetBitrate(Bitrate::Rate500K)
        );
        assert_eq!(
            SlcanCodec::decode(b"S7").unwrap(),
            Command::SetBitrate(Bitrate::Rate800K)
        );
    }

    #[test]
    fn test_slcan_decode_bitrate_out_of_range() {
        assert!(matches!(
            SlcanCodec::decode(b"S9"),
            Err(DecodeError::InvalidOperand(_))
        ));
        assert!(matches!(
            SlcanCodec::decode(b"SF"),
            Err(DecodeError::InvalidOperand(_))
        ));
        assert!(matches!(SlcanCodec::decode(b"SX"), Err(DecodeError::Malformed(_))));
        assert!(matches!(SlcanCodec::decode(b"S"), Err(DecodeError::Malformed(_))));
        assert!(matches!(SlcanCodec::decode(b"S66"), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_slcan_decode_command_letters_are_case_sensitive() {
        assert!(SlcanCodec::decode(b"o").is_err());
        assert!(SlcanCodec::decode(b"s6").is_err());
        assert!(SlcanCodec::decode(b"c").is_err());
    }

    #[test]
    fn test_slcan_decode_invalid_prefix() {
        assert!(matches!(SlcanCodec::decode(b"x1234AABB"), Err(DecodeError::Malformed(_))));
        assert!(matches!(SlcanCodec::decode(b""), Err(DecodeError::Malformed(_))));
        assert!(matches!(SlcanCodec::decode(b"O1"), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_slcan_decode_dlc_nine_rejected() {
        // DLC > 8 is invalid for classic CAN, even with enough digits supplied
        assert!(matches!(
            SlcanCodec::decode(b"t123900112233445566778899"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(SlcanCodec::decode(b"t123F").is_err());
    }

    #[test]
    fn test_slcan_decode_payload_length_mismatch() {
        // Declared length 8 with only 7 bytes of payload
        assert!(matches!(
            SlcanCodec::decode(b"t12381122334455667"),
            Err(DecodeError::Malformed(_))
        ));
        // Declared length 0 with trailing payload digits
        assert!(matches!(
            SlcanCodec::decode(b"t1230011223344556677"),
            Err(DecodeError::Malformed(_))
        ));
        // Truncated header
        assert!(matches!(SlcanCodec::decode(b"t12"), Err(DecodeError::Malformed(_))));
        assert!(matches!(SlcanCodec::decode(b"T1234567"), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_slcan_decode_invalid_hex() {
        assert!(matches!(SlcanCodec::decode(b"t12G0"), Err(DecodeError::Malformed(_))));
        assert!(matches!(SlcanCodec::decode(b"t1231ZZ"), Err(DecodeError::Malformed(_))));
        // A sign is not a hex digit
        assert!(matches!(SlcanCodec::decode(b"t+120"), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_slcan_decode_id_out_of_range() {
        assert!(matches!(
            SlcanCodec::decode(b"t8000"),
            Err(DecodeError::InvalidOperand(_))
        ));
        assert!(matches!(
            SlcanCodec::decode(b"T200000000"),
            Err(DecodeError::InvalidOperand(_))
        ));
    }

    #[test]
    fn test_slcan_encode_standard_frame() {
        let frame = CanFrame::new_data(0x123, false, &[0x01, 0x02, 0x03]).unwrap();
        assert_eq!(SlcanCodec::encode_frame(&frame), b"t1233010203");
    }

    #[test]
    fn test_slcan_encode_max_standard_id() {
        let frame = CanFrame::new_data(0x7FF, false, &[0xAA, 0xBB]).unwrap();
        assert_eq!(SlcanCodec::encode_frame(&frame), b"t7FF2AABB");
    }

    #[test]
    fn test_slcan_encode_extended_frame() {
        let frame = CanFrame::new_data(0x12345678, true, &[0xAA, 0xBB]).unwrap();
        assert_eq!(SlcanCodec::encode_frame(&frame), b"T123456782AABB");
    }

    #[test]
    fn test_slcan_encode_remote_frames() {
        let frame = CanFrame::new_remote(0x123, false, 4).unwrap();
        assert_eq!(SlcanCodec::encode_frame(&frame), b"r1234");
        let frame = CanFrame::new_remote(0x1ABCDEF, true, 0).unwrap();
        assert_eq!(SlcanCodec::encode_frame(&frame), b"R01ABCDEF0");
    }

    #[test]
    fn test_slcan_encode_with_timestamp() {
        let frame = CanFrame::new_data(0x100, false, &[0x01]).unwrap();
        assert_eq!(
            SlcanCodec::encode_frame_with_timestamp(&frame, 0xEA5F),
            b"t100101EA5F"
        );
    }

    #[test]
    fn test_timestamp_wraps() {
        assert_eq!(timestamp_ms(0), 0);
        assert_eq!(timestamp_ms(59_999_000), 59_999);
        assert_eq!(timestamp_ms(60_000_000), 0);
        assert_eq!(timestamp_ms(61_234_999), 1_234);
    }

    #[test]
    fn test_slcan_roundtrip() {
        let original = CanFrame::new_data(0x7FF, false, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        let encoded = SlcanCodec::encode_frame(&original);
        let decoded = frame_of(SlcanCodec::decode(&encoded).unwrap());
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_command_encoding_inverts_decoding() {
        let lines: [&[u8]; 11] = [
            b"O",
            b"L",
            b"C",
            b"F",
            b"V",
            b"N",
            b"S0",
            b"S8",
            b"Z0",
            b"t12380011223344556677",
            b"R1FFFFFFF8",
        ];
        for line in lines {
            let command = SlcanCodec::decode(line).unwrap();
            assert_eq!(SlcanCodec::encode_command(&command), line);
        }
    }

    #[test]
    fn test_replies() {
        assert_eq!(SlcanCodec::status_reply(0x02), b"F02");
        assert_eq!(SlcanCodec::version_reply("1013"), b"V1013");
        assert_eq!(SlcanCodec::serial_reply("SLCD"), b"NSLCD");
    }
}
