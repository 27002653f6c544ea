//! Translation between CANlib messages and [`CanFrame`].

use bitfield::bitfield;

use crate::frame::{CanFrame, FrameType, Timestamp, MAX_CLASSIC_PAYLOAD, MAX_FD_PAYLOAD};

/// Driver timestamps are milliseconds.
const TICKS_TO_MICROS: u64 = 1000;

bitfield! {
    /// Message flag word exchanged with `canRead`/`canWrite`.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct MessageFlags(u32);
    impl Debug;
    pub remote_request, set_remote_request: 0;
    pub standard, set_standard: 1;
    pub extended, set_extended: 2;
    pub wakeup, _: 3;
    pub nerr, _: 4;
    pub error_frame, set_error_frame: 5;
    pub tx_ack, set_tx_ack: 6;
    pub tx_request, _: 7;
    pub fd, set_fd: 16;
    pub bitrate_switch, set_bitrate_switch: 17;
    pub error_state_indicator, set_error_state_indicator: 18;
}

impl From<u32> for MessageFlags {
    fn from(bits: u32) -> Self {
        MessageFlags(bits)
    }
}

impl From<MessageFlags> for u32 {
    fn from(flags: MessageFlags) -> Self {
        flags.0
    }
}

/// One message as the driver sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMessage {
    pub id: u32,
    pub data: [u8; MAX_FD_PAYLOAD],
    /// Payload length in bytes.
    pub dlc: u32,
    pub flags: MessageFlags,
    /// Driver ticks.
    pub time: u32,
}

impl RawMessage {
    pub fn new(id: u32, payload: &[u8], flags: MessageFlags, time: u32) -> Self {
        let len = payload.len().min(MAX_FD_PAYLOAD);
        let mut data = [0u8; MAX_FD_PAYLOAD];
        data[..len].copy_from_slice(&payload[..len]);
        Self {
            id,
            data,
            dlc: len as u32,
            flags,
            time,
        }
    }

    pub fn payload(&self) -> &[u8] {
        let len = (self.dlc as usize).min(MAX_FD_PAYLOAD);
        &self.data[..len]
    }
}

pub fn encode_flags(frame: &CanFrame) -> MessageFlags {
    let mut flags = MessageFlags(0);
    flags.set_remote_request(frame.frame_type() == FrameType::RemoteRequest);
    flags.set_error_frame(frame.frame_type() == FrameType::Error);
    flags.set_extended(frame.is_extended());
    flags.set_standard(!frame.is_extended());
    flags.set_fd(frame.is_fd());
    flags.set_bitrate_switch(frame.bitrate_switch());
    flags
}

pub fn encode(frame: &CanFrame) -> RawMessage {
    RawMessage::new(frame.id(), frame.payload(), encode_flags(frame), 0)
}

/// Error flag wins over remote request; data is the default.
pub fn decode_type(flags: MessageFlags) -> FrameType {
    if flags.error_frame() {
        FrameType::Error
    } else if flags.remote_request() {
        FrameType::RemoteRequest
    } else {
        FrameType::Data
    }
}

pub fn decode(message: &RawMessage) -> CanFrame {
    let flags = message.flags;
    let mut payload = message.payload();
    if !flags.fd() && payload.len() > MAX_CLASSIC_PAYLOAD {
        payload = &payload[..MAX_CLASSIC_PAYLOAD];
    }
    CanFrame::new(message.id, payload)
        .with_frame_type(decode_type(flags))
        .with_extended(flags.extended())
        .with_fd(flags.fd())
        .with_bitrate_switch(flags.bitrate_switch())
        .with_error_state_indicator(flags.error_state_indicator())
        .with_local_echo(flags.tx_ack())
        .with_timestamp(Timestamp::from_micros(
            u64::from(message.time) * TICKS_TO_MICROS,
        ))
}

#[cfg(test)]
mod tests {
    use super::{decode, decode_type, encode, encode_flags, MessageFlags, RawMessage};
    use crate::frame::{CanFrame, FrameType};

    #[test]
    fn test_flag_bits() {
        let frame = CanFrame::new(0x123, &[1, 2]);
        assert_eq!(u32::from(encode_flags(&frame)), 0x2);

        let frame = CanFrame::new(0x1234, &[1, 2]);
        assert_eq!(u32::from(encode_flags(&frame)), 0x4);

        let frame = CanFrame::remote(0x10);
        assert_eq!(u32::from(encode_flags(&frame)), 0x3);

        let frame = CanFrame::new(0x10, &[]).with_frame_type(FrameType::Error);
        assert_eq!(u32::from(encode_flags(&frame)), 0x22);

        let frame = CanFrame::new(0x1abcde, &[0u8; 12]).with_bitrate_switch(true);
        assert_eq!(u32::from(encode_flags(&frame)), 0x30004);
    }

    #[test]
    fn test_extended_fd_brs_round_trip() {
        let frame = CanFrame::new(0x18daf110, &(0..24).collect::<Vec<u8>>())
            .with_bitrate_switch(true);
        let decoded = decode(&encode(&frame));
        assert_eq!(decoded.id(), frame.id());
        assert_eq!(decoded.payload(), frame.payload());
        assert_eq!(decoded.frame_type(), FrameType::Data);
        assert!(decoded.is_extended());
        assert!(decoded.is_fd());
        assert!(decoded.bitrate_switch());
    }

    #[test]
    fn test_type_precedence() {
        let mut flags = MessageFlags(0);
        assert_eq!(decode_type(flags), FrameType::Data);
        flags.set_remote_request(true);
        assert_eq!(decode_type(flags), FrameType::RemoteRequest);
        flags.set_error_frame(true);
        assert_eq!(decode_type(flags), FrameType::Error);
        flags.set_remote_request(false);
        assert_eq!(decode_type(flags), FrameType::Error);
    }

    #[test]
    fn test_decode_timestamp_and_echo() {
        let mut flags = MessageFlags(0x2);
        flags.set_tx_ack(true);
        let message = RawMessage::new(0x7ff, &[0xaa; 8], flags, 1234);
        let frame = decode(&message);
        assert_eq!(frame.timestamp().as_micros(), 1_234_000);
        assert!(frame.is_local_echo());
        assert!(!frame.is_extended());
        assert_eq!(frame.payload(), &[0xaa; 8]);
    }

    #[test]
    fn test_decode_clamps_length() {
        let mut message = RawMessage::new(0x1, &[0x55; 64], MessageFlags(0x10002), 0);
        message.dlc = 200;
        assert_eq!(decode(&message).payload().len(), 64);
        message.dlc = 3;
        assert_eq!(decode(&message).payload(), &[0x55; 3]);

        let message = RawMessage::new(0x1, &[0x55; 12], MessageFlags(0x2), 0);
        assert_eq!(decode(&message).payload().len(), 8);
    }
}
