//! The narrow surface of the vendor CANlib driver used by the session.
//!
//! Every call is synchronous. Reads never block: an empty receive queue is
//! reported as [`Status::NoMessages`].

use std::sync::Arc;

use bitflags::bitflags;
use num_enum::{FromPrimitive, IntoPrimitive};
use thiserror::Error;

use crate::codec::RawMessage;

pub mod canlib;
pub mod mock;

/// Handle returned by `canOpenChannel`.
pub type ChannelHandle = i32;

pub type DriverResult<T> = Result<T, Status>;

/// CANlib status codes (`canStatus`).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum Status {
    #[error("ok")]
    Ok = 0,
    #[error("error in parameter")]
    Param = -1,
    #[error("no messages available")]
    NoMessages = -2,
    #[error("specified device not found")]
    NotFound = -3,
    #[error("out of memory")]
    NoMemory = -4,
    #[error("no channels available")]
    NoChannels = -5,
    #[error("timeout occurred")]
    Timeout = -7,
    #[error("library not initialized")]
    NotInitialized = -8,
    #[error("no more handles")]
    NoHandles = -9,
    #[error("handle is invalid")]
    InvalidHandle = -10,
    #[error("CAN driver type not supported")]
    Driver = -12,
    #[error("transmit buffer overflow")]
    TxBufferOverflow = -13,
    #[error("a hardware error has occurred")]
    Hardware = -15,
    #[error("operation not supported")]
    NotSupported = -19,
    #[error("can't find or load kernel driver")]
    DriverLoad = -23,
    #[error("card not found")]
    NoCard = -26,
    #[error("access denied")]
    NoAccess = -31,
    #[error("not implemented")]
    NotImplemented = -32,
    #[num_enum(catch_all)]
    #[error("driver status {0}")]
    Other(i32) = 1,
}

impl Status {
    /// Maps a raw return code to `Ok(())` or the failing status.
    pub fn check(code: i32) -> DriverResult<()> {
        match Status::from(code) {
            Status::Ok => Ok(()),
            status => Err(status),
        }
    }

    pub fn code(self) -> i32 {
        self.into()
    }
}

/// Attribute ids accepted by `canGetChannelData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive)]
#[repr(i32)]
pub enum ChannelDataItem {
    Capabilities = 1,
    ChannelOnCard = 6,
    CardSerialNumber = 7,
    CardUpcNumber = 11,
    DeviceProductName = 26,
    CustomChannelName = 39,
}

/// Output control modes for `canSetBusOutputControl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u32)]
pub enum DriverMode {
    Normal = 4,
}

/// `canIoCtl` function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u32)]
pub enum IoControl {
    /// Report own transmitted frames back with the TXACK flag.
    SetTxAck = 7,
    /// Echo transmitted frames to other handles on the same channel.
    SetLocalTxEcho = 32,
}

/// Identifier format an acceptance code/mask pair applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptanceFormat {
    Standard,
    Extended,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NotifyEvents: u32 {
        const RX = 0x01;
        const TX = 0x02;
        const ERROR = 0x04;
        const STATUS = 0x08;
        const BUSONOFF = 0x20;
        const REMOVED = 0x40;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: i32 {
        const ACCEPT_VIRTUAL = 0x20;
        const REQUIRE_INIT_ACCESS = 0x80;
        const NO_INIT_ACCESS = 0x100;
        const CAN_FD = 0x400;
        const CAN_FD_NONISO = 0x800;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u32 {
        const EXTENDED_CAN = 0x1;
        const BUS_STATISTICS = 0x2;
        const ERROR_COUNTERS = 0x4;
        const GENERATE_ERROR = 0x10;
        const GENERATE_OVERLOAD = 0x20;
        const TX_REQUEST = 0x40;
        const TX_ACKNOWLEDGE = 0x80;
        const VIRTUAL = 0x10000;
        const SIMULATED = 0x20000;
        const CANFD = 0x80000;
        const CANFD_NONISO = 0x100000;
        const SILENT_MODE = 0x200000;
    }
}

bitflags! {
    /// Bits reported by `canReadStatus`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusFlags: u32 {
        const ERROR_PASSIVE = 0x1;
        const BUS_OFF = 0x2;
        const ERROR_WARNING = 0x4;
        const ERROR_ACTIVE = 0x8;
        const TX_PENDING = 0x10;
        const RX_PENDING = 0x20;
        const TX_ERROR = 0x80;
        const RX_ERROR = 0x100;
        const HW_OVERRUN = 0x200;
        const SW_OVERRUN = 0x400;
    }
}

/// Receiver of driver notifications.
///
/// `notify` runs on a thread owned by the driver. Implementations must not
/// block and must not call back into the driver.
pub trait NotifyTarget: Send + Sync {
    fn notify(&self, events: NotifyEvents);
}

pub trait Driver: Clone + Send + Sync + 'static {
    fn initialize(&self);

    fn channel_count(&self) -> DriverResult<i32>;

    /// Copies the attribute into `buf`, which must be large enough for it.
    fn channel_data(&self, channel: i32, item: ChannelDataItem, buf: &mut [u8]) -> DriverResult<()>;

    fn open_channel(&self, channel: i32, flags: OpenFlags) -> DriverResult<ChannelHandle>;

    fn close_channel(&self, handle: ChannelHandle) -> DriverResult<()>;

    fn set_bus_params(&self, handle: ChannelHandle, bit_rate_code: i32) -> DriverResult<()>;

    fn set_bus_params_fd(&self, handle: ChannelHandle, bit_rate_code: i32) -> DriverResult<()>;

    /// Whether the loaded driver exposes FD data-phase bus parameters.
    fn supports_fd_params(&self) -> bool;

    fn set_output_control(&self, handle: ChannelHandle, mode: DriverMode) -> DriverResult<()>;

    fn bus_on(&self, handle: ChannelHandle) -> DriverResult<()>;

    fn io_control(&self, handle: ChannelHandle, code: IoControl, value: u32) -> DriverResult<()>;

    fn set_notify_callback(
        &self,
        handle: ChannelHandle,
        target: Arc<dyn NotifyTarget>,
        events: NotifyEvents,
    ) -> DriverResult<()>;

    fn read_status(&self, handle: ChannelHandle) -> DriverResult<StatusFlags>;

    /// Polls one message; `Err(Status::NoMessages)` when the queue is empty.
    fn read(&self, handle: ChannelHandle) -> DriverResult<RawMessage>;

    fn write(&self, handle: ChannelHandle, message: &RawMessage) -> DriverResult<()>;

    fn set_acceptance_filter(
        &self,
        handle: ChannelHandle,
        code: u32,
        mask: u32,
        format: AcceptanceFormat,
    ) -> DriverResult<()>;

    fn reset_bus(&self, handle: ChannelHandle) -> DriverResult<()>;

    fn error_text(&self, status: Status) -> DriverResult<String>;
}

#[cfg(test)]
mod tests {
    use super::Status;

    const LISTED: [(i32, Status); 18] = [
        (0, Status::Ok),
        (-1, Status::Param),
        (-2, Status::NoMessages),
        (-3, Status::NotFound),
        (-4, Status::NoMemory),
        (-5, Status::NoChannels),
        (-7, Status::Timeout),
        (-8, Status::NotInitialized),
        (-9, Status::NoHandles),
        (-10, Status::InvalidHandle),
        (-12, Status::Driver),
        (-13, Status::TxBufferOverflow),
        (-15, Status::Hardware),
        (-19, Status::NotSupported),
        (-23, Status::DriverLoad),
        (-26, Status::NoCard),
        (-31, Status::NoAccess),
        (-32, Status::NotImplemented),
    ];

    #[test]
    fn test_status_check() {
        assert_eq!(Status::check(0), Ok(()));
        for (code, status) in LISTED.into_iter().skip(1) {
            assert_eq!(Status::check(code), Err(status));
        }
        assert_eq!(Status::check(-99), Err(Status::Other(-99)));
        assert_eq!(Status::check(-6), Err(Status::Other(-6)));
    }

    #[test]
    fn test_status_code() {
        for (code, status) in LISTED {
            assert_eq!(Status::from(code), status);
            assert_eq!(status.code(), code);
        }
        assert_eq!(Status::Other(-99).code(), -99);
        assert_eq!(Status::Other(-99).to_string(), "driver status -99");
    }
}
