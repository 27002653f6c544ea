use async_trait::async_trait;

use crate::driver::Driver;
use crate::error::SessionError;
use crate::frame::CanFrame;
use crate::session::{BusSession, BusStatus, ConfigOutcome, ConfigurationParameter};

/// Host-facing CAN bus device.
#[async_trait]
pub trait CanBusDevice: Send {
    fn open(&mut self) -> Result<(), SessionError>;

    fn close(&mut self);

    fn set_configuration_parameter(
        &mut self,
        parameter: ConfigurationParameter,
    ) -> Result<ConfigOutcome, SessionError>;

    fn write_frame(&mut self, frame: &CanFrame) -> Result<(), SessionError>;

    fn bus_status(&mut self) -> BusStatus;

    fn reset_controller(&mut self);

    /// Next received frame; `None` once the device is closed and drained.
    async fn recv(&mut self) -> Option<CanFrame>;
}

#[async_trait]
impl<D: Driver> CanBusDevice for BusSession<D> {
    fn open(&mut self) -> Result<(), SessionError> {
        BusSession::open(self)
    }

    fn close(&mut self) {
        BusSession::close(self);
    }

    fn set_configuration_parameter(
        &mut self,
        parameter: ConfigurationParameter,
    ) -> Result<ConfigOutcome, SessionError> {
        BusSession::set_configuration_parameter(self, parameter)
    }

    fn write_frame(&mut self, frame: &CanFrame) -> Result<(), SessionError> {
        BusSession::write_frame(self, frame)
    }

    fn bus_status(&mut self) -> BusStatus {
        BusSession::bus_status(self)
    }

    fn reset_controller(&mut self) {
        BusSession::reset_controller(self);
    }

    async fn recv(&mut self) -> Option<CanFrame> {
        BusSession::recv(self).await
    }
}
