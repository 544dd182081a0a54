// src/frame.rs
//
// Shared data definitions for CAN frames and the slcan command vocabulary.
//
// Identifier layout follows the Linux `struct can_frame` convention:
//   bit 31     extended frame format (EFF)
//   bit 30     remote transmission request (RTR)
//   bit 29     error frame
//   bits 0-28  identifier (11 bits used for standard frames)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Extended frame format flag
pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
/// Remote transmission request flag
pub const CAN_RTR_FLAG: u32 = 0x4000_0000;
/// Error frame flag
pub const CAN_ERR_FLAG: u32 = 0x2000_0000;
/// Mask for 11-bit standard IDs
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
/// Mask for 29-bit extended IDs
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;
/// Maximum payload length of a classic CAN frame
pub const CAN_MAX_DLC: u8 = 8;

// ============================================================================
// Identifier packing
// ============================================================================

/// Flag bits carried alongside a CAN identifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct IdFlags {
    pub extended: bool,
    pub remote: bool,
    pub error: bool,
}

/// Pack an identifier and its flags into the 32-bit `can_id` representation.
///
/// The identifier is masked to 11 or 29 bits so it can never spill into the
/// flag bits.
pub fn pack(id: u32, flags: IdFlags) -> u32 {
    let mut raw = if flags.extended {
        (id & CAN_EFF_MASK) | CAN_EFF_FLAG
    } else {
        id & CAN_SFF_MASK
    };
    if flags.remote {
        raw |= CAN_RTR_FLAG;
    }
    if flags.error {
        raw |= CAN_ERR_FLAG;
    }
    raw
}

/// Split a packed `can_id` back into identifier and flags.
///
/// Every `u32` is accepted. The returned identifier is already masked.
pub fn unpack(raw: u32) -> (u32, IdFlags) {
    let flags = IdFlags {
        extended: raw & CAN_EFF_FLAG != 0,
        remote: raw & CAN_RTR_FLAG != 0,
        error: raw & CAN_ERR_FLAG != 0,
    };
    let mask = if flags.extended { CAN_EFF_MASK } else { CAN_SFF_MASK };
    (raw & mask, flags)
}

// ============================================================================
// CAN Frame
// ============================================================================

/// Classic CAN frame (at most 8 payload bytes).
///
/// Bytes of `data` past `dlc` are always zero, so derived equality compares
/// only the meaningful payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CanFrame {
    id: u32,
    flags: IdFlags,
    dlc: u8,
    data: [u8; CAN_MAX_DLC as usize],
}

impl CanFrame {
    /// Build a data frame. Returns `None` if the payload exceeds 8 bytes or
    /// the identifier does not fit the selected format.
    pub fn new_data(id: u32, extended: bool, payload: &[u8]) -> Option<Self> {
        if payload.len() > CAN_MAX_DLC as usize || !id_fits(id, extended) {
            return None;
        }
        let mut data = [0u8; CAN_MAX_DLC as usize];
        data[..payload.len()].copy_from_slice(payload);
        Some(Self {
            id,
            flags: IdFlags {
                extended,
                ..IdFlags::default()
            },
            dlc: payload.len() as u8,
            data,
        })
    }

    /// Build a remote (RTR) frame requesting `dlc` bytes.
    pub fn new_remote(id: u32, extended: bool, dlc: u8) -> Option<Self> {
        if dlc > CAN_MAX_DLC || !id_fits(id, extended) {
            return None;
        }
        Some(Self {
            id,
            flags: IdFlags {
                extended,
                remote: true,
                error: false,
            },
            dlc,
            data: [0u8; CAN_MAX_DLC as usize],
        })
    }

    /// Rebuild a frame from its packed `can_id`, dlc and payload.
    pub fn from_raw(raw_id: u32, dlc: u8, payload: &[u8]) -> Option<Self> {
        let (id, flags) = unpack(raw_id);
        let mut frame = if flags.remote {
            Self::new_remote(id, flags.extended, dlc)?
        } else {
            Self::new_data(id, flags.extended, payload.get(..dlc as usize)?)?
        };
        frame.flags.error = flags.error;
        Some(frame)
    }

    /// Bare identifier (flags masked off)
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn flags(&self) -> IdFlags {
        self.flags
    }

    /// Packed `can_id` including flag bits
    pub fn raw_id(&self) -> u32 {
        pack(self.id, self.flags)
    }

    pub fn is_extended(&self) -> bool {
        self.flags.extended
    }

    pub fn is_remote(&self) -> bool {
        self.flags.remote
    }

    pub fn is_error(&self) -> bool {
        self.flags.error
    }

    /// Declared data length code
    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    /// Payload bytes. Empty for remote frames.
    pub fn payload(&self) -> &[u8] {
        if self.flags.remote {
            &[]
        } else {
            &self.data[..self.dlc as usize]
        }
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = if self.flags.extended { 8 } else { 3 };
        write!(f, "CanFrame({:0width$X}", self.id, width = width)?;
        if self.flags.remote {
            write!(f, " RTR")?;
        }
        write!(f, " [{}]", self.dlc)?;
        for byte in self.payload() {
            write!(f, " {:02X}", byte)?;
        }
        write!(f, ")")
    }
}

fn id_fits(id: u32, extended: bool) -> bool {
    if extended {
        id <= CAN_EFF_MASK
    } else {
        id <= CAN_SFF_MASK
    }
}

// ============================================================================
// Bitrate
// ============================================================================

/// Standard CAN bus speeds selectable with the slcan `S0`-`S8` commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Bitrate {
    Rate10K,
    Rate20K,
    Rate50K,
    Rate100K,
    Rate125K,
    Rate250K,
    Rate500K,
    Rate800K,
    Rate1M,
}

/// Digit order of the `S` command
const BITRATES: [(Bitrate, u32); 9] = [
    (Bitrate::Rate10K, 10_000),
    (Bitrate::Rate20K, 20_000),
    (Bitrate::Rate50K, 50_000),
    (Bitrate::Rate100K, 100_000),
    (Bitrate::Rate125K, 125_000),
    (Bitrate::Rate250K, 250_000),
    (Bitrate::Rate500K, 500_000),
    (Bitrate::Rate800K, 800_000),
    (Bitrate::Rate1M, 1_000_000),
];

impl Bitrate {
    /// Map an `S` command digit (0-8) to its bitrate
    pub fn from_digit(digit: u8) -> Option<Self> {
        BITRATES.get(digit as usize).map(|(rate, _)| *rate)
    }

    /// The `S` command digit for this bitrate
    pub fn digit(self) -> u8 {
        BITRATES
            .iter()
            .position(|(rate, _)| *rate == self)
            .unwrap_or_default() as u8
    }

    pub fn bits_per_second(self) -> u32 {
        BITRATES
            .iter()
            .find(|(rate, _)| *rate == self)
            .map(|(_, bps)| *bps)
            .unwrap_or_default()
    }

    /// Find the bitrate for an exact bits-per-second value
    pub fn from_bps(bps: u32) -> Option<Self> {
        BITRATES
            .iter()
            .find(|(_, rate)| *rate == bps)
            .map(|(rate, _)| *rate)
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bps = self.bits_per_second();
        if bps >= 1_000_000 {
            write!(f, "{}M", bps / 1_000_000)
        } else {
            write!(f, "{}k", bps / 1_000)
        }
    }
}

impl FromStr for Bitrate {
    type Err = String;

    /// Accepts an `S` digit ("6"), bits per second ("500000") or a suffixed
    /// value ("500k", "1M").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = if s.len() == 1 {
            s.parse::<u8>().ok().and_then(Bitrate::from_digit)
        } else if let Some(k) = s.strip_suffix(['k', 'K']) {
            k.parse::<u32>()
                .ok()
                .and_then(|v| v.checked_mul(1_000))
                .and_then(Bitrate::from_bps)
        } else if let Some(m) = s.strip_suffix(['m', 'M']) {
            m.parse::<u32>()
                .ok()
                .and_then(|v| v.checked_mul(1_000_000))
                .and_then(Bitrate::from_bps)
        } else {
            s.parse::<u32>().ok().and_then(Bitrate::from_bps)
        };

        parsed.ok_or_else(|| {
            let valid: Vec<String> = BITRATES.iter().map(|(r, _)| r.to_string()).collect();
            format!("invalid CAN bitrate '{}'. Valid bitrates: {}", s, valid.join(", "))
        })
    }
}

impl TryFrom<u32> for Bitrate {
    type Error = String;

    fn try_from(bps: u32) -> Result<Self, Self::Error> {
        Bitrate::from_bps(bps).ok_or_else(|| format!("unsupported CAN bitrate {}", bps))
    }
}

impl From<Bitrate> for u32 {
    fn from(rate: Bitrate) -> u32 {
        rate.bits_per_second()
    }
}

// ============================================================================
// Interface mode
// ============================================================================

/// Controller mode applied to the CAN interface before it is brought up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceMode {
    #[default]
    Normal,
    /// Receive only; the controller never ACKs or transmits
    ListenOnly,
    /// Transmitted frames are looped back by the controller
    Loopback,
}

impl InterfaceMode {
    pub fn can_transmit(self) -> bool {
        self != InterfaceMode::ListenOnly
    }
}

// ============================================================================
// Commands
// ============================================================================

/// One decoded slcan command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// `O`
    OpenChannel,
    /// `L` - open with the controller in listen-only mode
    OpenListenOnly,
    /// `C`
    CloseChannel,
    /// `S0`-`S8`
    SetBitrate(Bitrate),
    /// `t` - standard data frame
    Transmit(CanFrame),
    /// `T` - extended data frame
    TransmitExtended(CanFrame),
    /// `r` / `R`
    TransmitRemote(CanFrame),
    /// `F`
    ReadStatus,
    /// `V`
    ReadVersion,
    /// `N`
    ReadSerial,
    /// `Z0` / `Z1`
    SetTimestamps(bool),
}

impl Command {
    /// Frame carried by a transmit command
    pub fn frame(&self) -> Option<&CanFrame> {
        match self {
            Command::Transmit(frame)
            | Command::TransmitExtended(frame)
            | Command::TransmitRemote(frame) => Some(frame),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_standard() {
        assert_eq!(pack(0x123, IdFlags::default()), 0x123);
        // Bits above 11 are masked for standard frames
        assert_eq!(pack(0xFFFF, IdFlags::default()), 0x7FF);
    }

    #[test]
    fn test_pack_extended_rtr() {
        let flags = IdFlags {
            extended: true,
            remote: true,
            error: false,
        };
        assert_eq!(pack(0x1234_5678, flags), 0x1234_5678 | CAN_EFF_FLAG | CAN_RTR_FLAG);
    }

    #[test]
    fn test_pack_never_aliases_flags() {
        let raw = pack(0xFFFF_FFFF, IdFlags { extended: true, ..IdFlags::default() });
        assert_eq!(raw & CAN_RTR_FLAG, 0);
        assert_eq!(raw & CAN_ERR_FLAG, 0);
        assert_eq!(raw & CAN_EFF_MASK, CAN_EFF_MASK);
    }

    #[test]
    fn test_unpack() {
        let (id, flags) = unpack(0x1234_5678 | CAN_EFF_FLAG | CAN_ERR_FLAG);
        assert_eq!(id, 0x1234_5678);
        assert!(flags.extended);
        assert!(flags.error);
        assert!(!flags.remote);

        let (id, flags) = unpack(0x7FF);
        assert_eq!(id, 0x7FF);
        assert_eq!(flags, IdFlags::default());
    }

    #[test]
    fn test_frame_new_data() {
        let frame = CanFrame::new_data(0x7FF, false, &[0xAA, 0xBB]).unwrap();
        assert_eq!(frame.id(), 0x7FF);
        assert_eq!(frame.dlc(), 2);
        assert_eq!(frame.payload(), &[0xAA, 0xBB]);
        assert!(!frame.is_extended());
        assert!(!frame.is_remote());
    }

    #[test]
    fn test_frame_rejects_oversized() {
        assert!(CanFrame::new_data(0x123, false, &[0; 9]).is_none());
        assert!(CanFrame::new_data(0x800, false, &[]).is_none());
        assert!(CanFrame::new_data(0x2000_0000, true, &[]).is_none());
        assert!(CanFrame::new_remote(0x123, false, 9).is_none());
    }

    #[test]
    fn test_remote_frame_has_no_payload() {
        let frame = CanFrame::new_remote(0x123, false, 4).unwrap();
        assert_eq!(frame.dlc(), 4);
        assert!(frame.payload().is_empty());
        assert_eq!(frame.raw_id(), 0x123 | CAN_RTR_FLAG);
    }

    #[test]
    fn test_from_raw() {
        let frame = CanFrame::from_raw(0x1ABC_DEF0 | CAN_EFF_FLAG, 3, &[1, 2, 3, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(frame.id(), 0x1ABC_DEF0);
        assert!(frame.is_extended());
        assert_eq!(frame.payload(), &[1, 2, 3]);

        // Payload shorter than the declared length
        assert!(CanFrame::from_raw(0x123, 4, &[1, 2]).is_none());
    }

    #[test]
    fn test_bitrate_digits() {
        assert_eq!(Bitrate::from_digit(0), Some(Bitrate::Rate10K));
        assert_eq!(Bitrate::from_digit(6), Some(Bitrate::Rate500K));
        assert_eq!(Bitrate::from_digit(7), Some(Bitrate::Rate800K));
        assert_eq!(Bitrate::from_digit(8), Some(Bitrate::Rate1M));
        assert_eq!(Bitrate::from_digit(9), None);
        assert_eq!(Bitrate::Rate250K.digit(), 5);
        assert_eq!(Bitrate::Rate500K.bits_per_second(), 500_000);
    }

    #[test]
    fn test_bitrate_from_str() {
        assert_eq!("6".parse::<Bitrate>().unwrap(), Bitrate::Rate500K);
        assert_eq!("125000".parse::<Bitrate>().unwrap(), Bitrate::Rate125K);
        assert_eq!("250k".parse::<Bitrate>().unwrap(), Bitrate::Rate250K);
        assert_eq!("1M".parse::<Bitrate>().unwrap(), Bitrate::Rate1M);
        assert!("123456".parse::<Bitrate>().is_err());
        assert!("9".parse::<Bitrate>().is_err());
    }

    #[test]
    fn test_bitrate_display() {
        assert_eq!(Bitrate::Rate500K.to_string(), "500k");
        assert_eq!(Bitrate::Rate1M.to_string(), "1M");
    }

    #[test]
    fn test_listen_only_cannot_transmit() {
        assert!(InterfaceMode::Normal.can_transmit());
        assert!(InterfaceMode::Loopback.can_transmit());
        assert!(!InterfaceMode::ListenOnly.can_transmit());
    }
}
