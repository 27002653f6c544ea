//! Portable CAN frame.

use std::fmt;
use std::str::FromStr;

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while_m_n},
    character::complete::char,
    combinator::{all_consuming, map, map_res, opt},
    multi::many0,
    sequence::{pair, preceded, terminated},
    IResult,
};
use thiserror::Error;

pub const MAX_CLASSIC_PAYLOAD: usize = 8;
pub const MAX_FD_PAYLOAD: usize = 64;
pub const STANDARD_ID_MASK: u32 = 0x7ff;
pub const EXTENDED_ID_MASK: u32 = 0x1fff_ffff;

/// Payload lengths representable by an FD data length code.
const FD_PAYLOAD_LENGTHS: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameType {
    Unknown,
    #[default]
    Data,
    Error,
    RemoteRequest,
    Invalid,
}

/// Microseconds since the driver's time base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub fn as_micros(&self) -> u64 {
        self.0
    }
}

/// A CAN or CAN FD frame. Built once and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CanFrame {
    id: u32,
    payload: Vec<u8>,
    frame_type: FrameType,
    extended: bool,
    fd: bool,
    bitrate_switch: bool,
    error_state_indicator: bool,
    local_echo: bool,
    timestamp: Timestamp,
}

impl CanFrame {
    /// Creates a data frame.
    ///
    /// Identifiers above the 11 bit range select the extended format and
    /// payloads longer than 8 bytes select FD.
    pub fn new(id: u32, payload: &[u8]) -> Self {
        Self {
            id,
            payload: payload.to_vec(),
            frame_type: FrameType::Data,
            extended: id > STANDARD_ID_MASK,
            fd: payload.len() > MAX_CLASSIC_PAYLOAD,
            ..Default::default()
        }
    }

    pub fn remote(id: u32) -> Self {
        Self::new(id, &[]).with_frame_type(FrameType::RemoteRequest)
    }

    pub fn with_frame_type(mut self, frame_type: FrameType) -> Self {
        self.frame_type = frame_type;
        self
    }

    pub fn with_extended(mut self, extended: bool) -> Self {
        self.extended = extended;
        self
    }

    pub fn with_fd(mut self, fd: bool) -> Self {
        self.fd = fd;
        self
    }

    pub fn with_bitrate_switch(mut self, bitrate_switch: bool) -> Self {
        self.bitrate_switch = bitrate_switch;
        self
    }

    pub fn with_error_state_indicator(mut self, esi: bool) -> Self {
        self.error_state_indicator = esi;
        self
    }

    pub fn with_local_echo(mut self, local_echo: bool) -> Self {
        self.local_echo = local_echo;
        self
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn is_fd(&self) -> bool {
        self.fd
    }

    pub fn bitrate_switch(&self) -> bool {
        self.bitrate_switch
    }

    pub fn error_state_indicator(&self) -> bool {
        self.error_state_indicator
    }

    /// The frame was transmitted by this node and reported back by the driver.
    pub fn is_local_echo(&self) -> bool {
        self.local_echo
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn is_valid(&self) -> bool {
        if self.frame_type == FrameType::Invalid {
            return false;
        }
        let id_mask = if self.extended {
            EXTENDED_ID_MASK
        } else {
            STANDARD_ID_MASK
        };
        if self.id & !id_mask != 0 {
            return false;
        }
        if self.fd {
            if self.frame_type == FrameType::RemoteRequest {
                return false;
            }
            FD_PAYLOAD_LENGTHS.contains(&self.payload.len())
        } else {
            !self.bitrate_switch
                && !self.error_state_indicator
                && self.payload.len() <= MAX_CLASSIC_PAYLOAD
                && (self.frame_type != FrameType::RemoteRequest || self.payload.is_empty())
        }
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "{:08X}", self.id)?;
        } else {
            write!(f, "{:>8X}", self.id)?;
        }
        if self.fd {
            write!(f, "  [{:02}]", self.payload.len())?;
        } else {
            write!(f, "   [{}]", self.payload.len())?;
        }
        match self.frame_type {
            FrameType::RemoteRequest => write!(f, "  Remote Request"),
            FrameType::Error => write!(f, "  ERRORFRAME"),
            _ => {
                for byte in &self.payload {
                    write!(f, " {:02X}", byte)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid frame syntax: {0}")]
pub struct FrameParseError(String);

enum FrameBody {
    Remote,
    Classic(Vec<u8>),
    Fd(u8, Vec<u8>),
}

fn is_hex(c: char) -> bool {
    c.is_ascii_hexdigit()
}

fn hex_byte(input: &str) -> IResult<&str, u8> {
    map_res(take_while_m_n(2, 2, is_hex), |s| u8::from_str_radix(s, 16))(input)
}

fn hex_nibble(input: &str) -> IResult<&str, u8> {
    map_res(take_while_m_n(1, 1, is_hex), |s| u8::from_str_radix(s, 16))(input)
}

fn payload(input: &str) -> IResult<&str, Vec<u8>> {
    many0(terminated(hex_byte, opt(char('.'))))(input)
}

fn frame_id(input: &str) -> IResult<&str, (u32, bool)> {
    map_res(take_while_m_n(1, 8, is_hex), |s: &str| {
        u32::from_str_radix(s, 16).map(|id| (id, s.len() > 3))
    })(input)
}

fn body(input: &str) -> IResult<&str, FrameBody> {
    alt((
        map(tag("R"), |_| FrameBody::Remote),
        map(preceded(char('#'), pair(hex_nibble, payload)), |(flags, data)| {
            FrameBody::Fd(flags, data)
        }),
        map(payload, FrameBody::Classic),
    ))(input)
}

/// Flag nibble of the `ID##F...` syntax.
const FD_FLAG_BRS: u8 = 0x1;
const FD_FLAG_ESI: u8 = 0x2;

/// Parses the `cansend` notation: `123#DEADBEEF`, `1F334455#R`,
/// `123##1AABBCC` (FD, flag nibble then data). Bytes may be separated by `.`.
impl FromStr for CanFrame {
    type Err = FrameParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (_, ((id, extended), body)) =
            all_consuming(pair(frame_id, preceded(char('#'), body)))(s)
                .map_err(|e| FrameParseError(format!("{s}: {e}")))?;
        let frame = match body {
            FrameBody::Remote => CanFrame::remote(id),
            FrameBody::Classic(data) => CanFrame::new(id, &data).with_fd(false),
            FrameBody::Fd(flags, data) => CanFrame::new(id, &data)
                .with_fd(true)
                .with_bitrate_switch(flags & FD_FLAG_BRS != 0)
                .with_error_state_indicator(flags & FD_FLAG_ESI != 0),
        };
        Ok(frame.with_extended(extended || id > STANDARD_ID_MASK))
    }
}

#[cfg(test)]
mod tests {
    use super::{CanFrame, FrameType};

    #[test]
    fn test_new_selects_format() {
        let frame = CanFrame::new(0x7ff, &[1, 2, 3]);
        assert!(!frame.is_extended());
        assert!(!frame.is_fd());
        assert_eq!(frame.frame_type(), FrameType::Data);

        let frame = CanFrame::new(0x800, &[0u8; 16]);
        assert!(frame.is_extended());
        assert!(frame.is_fd());
        assert!(frame.is_valid());
    }

    #[test]
    fn test_validity() {
        assert!(CanFrame::new(0x123, &[0u8; 8]).is_valid());
        assert!(!CanFrame::new(0x123, &[0u8; 9]).with_fd(false).is_valid());
        assert!(!CanFrame::new(0x123, &[0u8; 9]).is_valid());
        assert!(!CanFrame::new(0x800, &[]).with_extended(false).is_valid());
        assert!(!CanFrame::new(0x2000_0000, &[]).is_valid());
        assert!(!CanFrame::new(0x1, &[]).with_bitrate_switch(true).is_valid());
        assert!(!CanFrame::remote(0x1).with_fd(true).is_valid());
        assert!(!CanFrame::new(0x1, &[]).with_frame_type(FrameType::Invalid).is_valid());
        assert!(CanFrame::remote(0x1).is_valid());
    }

    #[test]
    fn test_parse() {
        let frame: CanFrame = "123#DEADBEEF".parse().unwrap();
        assert_eq!(frame.id(), 0x123);
        assert_eq!(frame.payload(), &[0xde, 0xad, 0xbe, 0xef]);
        assert!(!frame.is_extended());

        let frame: CanFrame = "00000123#11.22".parse().unwrap();
        assert!(frame.is_extended());
        assert_eq!(frame.payload(), &[0x11, 0x22]);

        let frame: CanFrame = "1F334455#R".parse().unwrap();
        assert_eq!(frame.frame_type(), FrameType::RemoteRequest);
        assert!(frame.is_extended());

        let frame: CanFrame = "321##1AABBCC".parse().unwrap();
        assert!(frame.is_fd());
        assert!(frame.bitrate_switch());
        assert_eq!(frame.payload(), &[0xaa, 0xbb, 0xcc]);

        let frame: CanFrame = "7ff#".parse().unwrap();
        assert!(frame.payload().is_empty());

        assert!("123".parse::<CanFrame>().is_err());
        assert!("123#ABC".parse::<CanFrame>().is_err());
        assert!("xyz#00".parse::<CanFrame>().is_err());
    }

    #[test]
    fn test_display() {
        let frame = CanFrame::new(0x123, &[0xde, 0xad]);
        assert_eq!(frame.to_string(), "     123   [2] DE AD");
        let frame = CanFrame::remote(0x1234);
        assert_eq!(frame.to_string(), "00001234   [0]  Remote Request");
    }
}
