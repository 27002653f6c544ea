//! One open CANlib channel.
//!
//! A [`BusSession`] is driven by a single owner. Driver callbacks arrive on a
//! foreign thread and are queued by the notification bridge; the owner runs
//! them through [`BusSession::process_notifications`] or [`BusSession::recv`].

use std::collections::VecDeque;

use tokio::sync::broadcast;

use crate::codec;
use crate::driver::{
    AcceptanceFormat, ChannelHandle, Driver, DriverMode, NotifyEvents, OpenFlags, Status,
    StatusFlags,
};
use crate::error::{ErrorKind, SessionError};
use crate::frame::{CanFrame, FrameType};
use crate::identity;

mod bridge;
pub mod config;

use bridge::{Notification, NotificationBridge};
pub use config::{
    BusConfiguration, ConfigOutcome, ConfigurationKey, ConfigurationParameter, Filter,
    FilterFormat,
};
use config::{ConfigCommand, FilterSlots};

const EVENT_CAPACITY: usize = 64;
const NO_ERROR_TEXT: &str = "Unable to retrieve an error string";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStatus {
    Unknown,
    Good,
    Warning,
    Error,
    BusOff,
}

impl From<StatusFlags> for BusStatus {
    fn from(flags: StatusFlags) -> Self {
        if flags.contains(StatusFlags::BUS_OFF) {
            BusStatus::BusOff
        } else if flags.contains(StatusFlags::ERROR_PASSIVE) {
            BusStatus::Error
        } else if flags.contains(StatusFlags::ERROR_WARNING) {
            BusStatus::Warning
        } else if flags.contains(StatusFlags::ERROR_ACTIVE) {
            BusStatus::Good
        } else {
            BusStatus::Unknown
        }
    }
}

/// Broadcast to every [`BusSession::subscribe`] receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    FramesReceived(usize),
    FramesWritten(usize),
    ErrorOccurred(SessionError),
    BusStatusChanged(BusStatus),
    BusOn,
    BusOff,
    DeviceRemoved,
}

pub struct BusSession<D: Driver> {
    driver: D,
    name: String,
    state: SessionState,
    handle: Option<ChannelHandle>,
    init_access: bool,
    fd_open: bool,
    config: BusConfiguration,
    bridge: NotificationBridge,
    inbound: VecDeque<CanFrame>,
    outbound: VecDeque<CanFrame>,
    drain_scheduled: bool,
    events: broadcast::Sender<SessionEvent>,
    last_error: Option<SessionError>,
}

impl<D: Driver> BusSession<D> {
    /// `name` is a channel identity (`"<EAN>#<serial>.<channel>"`) or a
    /// portable `can<N>` name.
    pub fn new(driver: D, name: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            driver,
            name: name.to_owned(),
            state: SessionState::Closed,
            handle: None,
            init_access: false,
            fd_open: false,
            config: BusConfiguration::default(),
            bridge: NotificationBridge::new(),
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            drain_scheduled: false,
            events,
            last_error: None,
        }
    }

    pub fn builder(driver: D, name: &str) -> BusSessionBuilder<D> {
        BusSessionBuilder::new(driver, name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle(&self) -> Option<ChannelHandle> {
        self.handle
    }

    /// False when the channel had to be opened without init access; hardware
    /// configuration writes are then skipped.
    pub fn has_init_access(&self) -> bool {
        self.init_access
    }

    pub fn configuration(&self) -> &BusConfiguration {
        &self.config
    }

    /// The most recently reported error.
    pub fn error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            log::debug!("{}: {:?} -> {:?}", self.name, self.state, state);
            self.state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    /// Logs, records and broadcasts `error`, then hands it back.
    fn report(&mut self, error: SessionError) -> SessionError {
        log::error!("{}: {}", self.name, error);
        self.last_error = Some(error.clone());
        self.emit(SessionEvent::ErrorOccurred(error.clone()));
        error
    }

    fn driver_error(&self, kind: ErrorKind, status: Status) -> SessionError {
        let text = self.driver.error_text(status).unwrap_or_else(|_| {
            log::debug!("no error text for status {}", status.code());
            NO_ERROR_TEXT.to_owned()
        });
        SessionError::new(kind, text)
    }

    /// Closes and reports; used on every fatal open path.
    fn abort_open(&mut self, error: SessionError) -> SessionError {
        self.close();
        self.report(error)
    }

    pub fn open(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Closed {
            return Err(self.report(SessionError::Connection(format!(
                "{} is already open",
                self.name
            ))));
        }
        self.set_state(SessionState::Opening);

        let channel = match identity::resolve(&self.driver, &self.name) {
            Ok(channel) => channel,
            Err(e) => return Err(self.abort_open(SessionError::Connection(e.to_string()))),
        };

        let mut flags = OpenFlags::ACCEPT_VIRTUAL;
        if self.config.can_fd() {
            flags |= OpenFlags::CAN_FD;
        }
        let handle = match self
            .driver
            .open_channel(channel, flags | OpenFlags::REQUIRE_INIT_ACCESS)
        {
            Ok(handle) => {
                self.init_access = true;
                handle
            }
            Err(status) => {
                log::warn!(
                    "{}: no init access ({}), configuration changes will be skipped",
                    self.name,
                    status
                );
                match self
                    .driver
                    .open_channel(channel, flags | OpenFlags::NO_INIT_ACCESS)
                {
                    Ok(handle) => {
                        self.init_access = false;
                        handle
                    }
                    Err(retry_status) => {
                        let error = self.driver_error(ErrorKind::Connection, retry_status);
                        return Err(self.abort_open(error));
                    }
                }
            }
        };
        self.handle = Some(handle);
        self.fd_open = flags.contains(OpenFlags::CAN_FD);
        log::info!("{}: opened channel {} as handle {}", self.name, channel, handle);

        // drop anything posted for a previous handle
        self.bridge = NotificationBridge::new();
        let events = NotifyEvents::RX
            | NotifyEvents::ERROR
            | NotifyEvents::STATUS
            | NotifyEvents::BUSONOFF
            | NotifyEvents::REMOVED;
        if let Err(status) = self
            .driver
            .set_notify_callback(handle, self.bridge.target(), events)
        {
            let error = self.driver_error(ErrorKind::Connection, status);
            return Err(self.abort_open(error));
        }

        for parameter in self.config.parameters() {
            if let Err(e) = self.apply(&parameter) {
                log::warn!("{}: cannot apply {:?}: {}", self.name, parameter.key(), e);
            }
        }

        if let Err(status) = self.driver.set_output_control(handle, DriverMode::Normal) {
            let error = self.driver_error(ErrorKind::Configuration, status);
            return Err(self.abort_open(error));
        }
        if let Err(status) = self.driver.bus_on(handle) {
            let error = self.driver_error(ErrorKind::Configuration, status);
            return Err(self.abort_open(error));
        }

        self.set_state(SessionState::Open);
        Ok(())
    }

    /// Safe from any state. Queued outbound frames are discarded, received
    /// frames stay readable.
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(status) = self.driver.close_channel(handle) {
                log::debug!("{}: close handle {}: {}", self.name, handle, status);
            }
            log::info!("{}: closed", self.name);
        }
        self.init_access = false;
        self.fd_open = false;
        self.outbound.clear();
        self.drain_scheduled = false;
        self.set_state(SessionState::Closed);
    }

    /// Validates `parameter`, writes it to the hardware when the channel is
    /// open with init access, and stores it for the next open.
    pub fn set_configuration_parameter(
        &mut self,
        parameter: ConfigurationParameter,
    ) -> Result<ConfigOutcome, SessionError> {
        match self.apply(&parameter) {
            Ok(outcome) => {
                log::debug!("{}: {:?} {:?}", self.name, parameter, outcome);
                self.config.store(parameter);
                Ok(outcome)
            }
            Err(e) => Err(self.report(e)),
        }
    }

    fn apply(&self, parameter: &ConfigurationParameter) -> Result<ConfigOutcome, SessionError> {
        let command = parameter.command()?;
        if let ConfigCommand::BusParamsFd(_) = command {
            if !self.driver.supports_fd_params() {
                return Err(SessionError::Configuration(
                    "driver does not support FD bus parameters".to_owned(),
                ));
            }
        }
        let handle = match (self.state, self.handle) {
            (SessionState::Opening | SessionState::Open, Some(handle)) => handle,
            _ => return Ok(ConfigOutcome::Stored),
        };
        if command == ConfigCommand::NextOpen {
            return Ok(ConfigOutcome::Stored);
        }
        if !self.init_access {
            return Ok(ConfigOutcome::Skipped);
        }
        let result = match command {
            ConfigCommand::BusParams(code) => self.driver.set_bus_params(handle, code),
            ConfigCommand::BusParamsFd(code) => self.driver.set_bus_params_fd(handle, code),
            ConfigCommand::IoControl(code, value) => self.driver.io_control(handle, code, value),
            ConfigCommand::Filters(slots) => self.apply_filters(handle, slots),
            ConfigCommand::NextOpen => Ok(()),
        };
        result
            .map(|_| ConfigOutcome::Applied)
            .map_err(|status| self.driver_error(ErrorKind::Configuration, status))
    }

    /// Both formats are always written so an empty slot accepts everything.
    fn apply_filters(&self, handle: ChannelHandle, slots: FilterSlots) -> Result<(), Status> {
        for (format, slot) in [
            (AcceptanceFormat::Standard, slots.standard),
            (AcceptanceFormat::Extended, slots.extended),
        ] {
            let (code, mask) = slot.unwrap_or((0, 0));
            self.driver.set_acceptance_filter(handle, code, mask, format)?;
        }
        Ok(())
    }

    fn writable_handle(&self, frame: &CanFrame) -> Result<ChannelHandle, SessionError> {
        let handle = match (self.state, self.handle) {
            (SessionState::Open, Some(handle)) => handle,
            _ => {
                return Err(SessionError::Write(format!(
                    "cannot write to {} while {:?}",
                    self.name, self.state
                )))
            }
        };
        if !frame.is_valid() {
            return Err(SessionError::Write(format!("invalid frame {frame}")));
        }
        match frame.frame_type() {
            FrameType::Data | FrameType::RemoteRequest | FrameType::Error => {}
            other => {
                return Err(SessionError::Write(format!(
                    "unsupported frame type {other:?}"
                )))
            }
        }
        if frame.is_fd() && !self.fd_open {
            return Err(SessionError::Write(
                "FD frame on a channel not opened in FD mode".to_owned(),
            ));
        }
        Ok(handle)
    }

    fn transmit(&self, handle: ChannelHandle, frame: &CanFrame) -> Result<(), SessionError> {
        self.driver
            .write(handle, &codec::encode(frame))
            .map_err(|status| self.driver_error(ErrorKind::Write, status))
    }

    /// Writes one frame synchronously. A failed write is not retried.
    pub fn write_frame(&mut self, frame: &CanFrame) -> Result<(), SessionError> {
        let result = self
            .writable_handle(frame)
            .and_then(|handle| self.transmit(handle, frame));
        match result {
            Ok(()) => {
                self.emit(SessionEvent::FramesWritten(1));
                Ok(())
            }
            Err(e) => Err(self.report(e)),
        }
    }

    /// Queues a frame for the next outbound drain.
    pub fn enqueue_frame(&mut self, frame: CanFrame) -> Result<(), SessionError> {
        if let Err(e) = self.writable_handle(&frame) {
            return Err(self.report(e));
        }
        self.outbound.push_back(frame);
        if !self.drain_scheduled {
            self.drain_scheduled = true;
            self.bridge.post(Notification::DrainOutbound);
        }
        Ok(())
    }

    pub fn frames_to_write(&self) -> usize {
        self.outbound.len()
    }

    /// Writes queued frames in order. A non-empty cycle schedules another
    /// one; an empty cycle stops the trigger until the next enqueue.
    fn drain_outbound(&mut self) {
        let handle = match self.handle {
            Some(handle) if !self.outbound.is_empty() => handle,
            _ => {
                self.drain_scheduled = false;
                return;
            }
        };
        let mut written = 0;
        while let Some(frame) = self.outbound.pop_front() {
            match self.transmit(handle, &frame) {
                Ok(()) => written += 1,
                Err(e) => {
                    self.report(e);
                }
            }
        }
        if written > 0 {
            self.emit(SessionEvent::FramesWritten(written));
        }
        self.bridge.post(Notification::DrainOutbound);
    }

    /// Current controller state, read from the hardware on every call.
    pub fn bus_status(&mut self) -> BusStatus {
        let Some(handle) = self.handle else {
            return BusStatus::Unknown;
        };
        match self.driver.read_status(handle) {
            Ok(flags) => BusStatus::from(flags),
            Err(status) => {
                let error = self.driver_error(ErrorKind::Read, status);
                self.report(error);
                BusStatus::Unknown
            }
        }
    }

    pub fn reset_controller(&mut self) {
        let Some(handle) = self.handle else {
            return;
        };
        if let Err(status) = self.driver.reset_bus(handle) {
            let error = self.driver_error(ErrorKind::Connection, status);
            self.report(error);
        }
    }

    pub fn read_frame(&mut self) -> Option<CanFrame> {
        self.inbound.pop_front()
    }

    pub fn read_all_frames(&mut self) -> Vec<CanFrame> {
        self.inbound.drain(..).collect()
    }

    pub fn frames_available(&self) -> usize {
        self.inbound.len()
    }

    /// Runs every notification queued so far without waiting. Returns how
    /// many were handled.
    pub fn process_notifications(&mut self) -> usize {
        let mut handled = 0;
        while let Some(notification) = self.bridge.try_next() {
            self.handle_notification(notification);
            handled += 1;
        }
        handled
    }

    /// Waits for the next received frame. Returns `None` once the session
    /// is closed and every received frame has been taken.
    pub async fn recv(&mut self) -> Option<CanFrame> {
        loop {
            if let Some(frame) = self.inbound.pop_front() {
                return Some(frame);
            }
            if self.handle.is_none() {
                return None;
            }
            let notification = self.bridge.next().await?;
            self.handle_notification(notification);
        }
    }

    fn handle_notification(&mut self, notification: Notification) {
        let Some(handle) = self.handle else {
            return;
        };
        match notification {
            Notification::MessagesAvailable => self.read_messages(handle),
            Notification::StatusChanged => match self.driver.read_status(handle) {
                Ok(flags) => self.emit(SessionEvent::BusStatusChanged(BusStatus::from(flags))),
                Err(status) => {
                    let error = self.driver_error(ErrorKind::Connection, status);
                    self.report(error);
                }
            },
            Notification::BusOnOff => match self.driver.read_status(handle) {
                Ok(flags) if flags.contains(StatusFlags::BUS_OFF) => {
                    log::warn!("{}: bus off", self.name);
                    self.emit(SessionEvent::BusOff);
                }
                Ok(_) => self.emit(SessionEvent::BusOn),
                Err(status) => {
                    let error = self.driver_error(ErrorKind::Connection, status);
                    self.report(error);
                }
            },
            Notification::DeviceRemoved => {
                self.report(SessionError::Connection(format!(
                    "{} was removed",
                    self.name
                )));
                self.emit(SessionEvent::DeviceRemoved);
            }
            Notification::DrainOutbound => self.drain_outbound(),
        }
    }

    /// Polls the driver queue until it reports no messages.
    fn read_messages(&mut self, handle: ChannelHandle) {
        self.bridge.begin_drain();
        let mut received = 0;
        loop {
            match self.driver.read(handle) {
                Ok(message) => {
                    self.inbound.push_back(codec::decode(&message));
                    received += 1;
                }
                Err(Status::NoMessages) => break,
                Err(status) => {
                    let error = self.driver_error(ErrorKind::Read, status);
                    self.report(error);
                    break;
                }
            }
        }
        if received > 0 {
            self.emit(SessionEvent::FramesReceived(received));
        }
    }
}

impl<D: Driver> Drop for BusSession<D> {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct BusSessionBuilder<D: Driver> {
    driver: D,
    name: String,
    parameters: Vec<ConfigurationParameter>,
}

impl<D: Driver> BusSessionBuilder<D> {
    pub fn new(driver: D, name: &str) -> Self {
        Self {
            driver,
            name: name.to_owned(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, parameter: ConfigurationParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Fails on the first parameter that does not validate.
    pub fn build(self) -> Result<BusSession<D>, SessionError> {
        let mut session = BusSession::new(self.driver, &self.name);
        for parameter in self.parameters {
            session.set_configuration_parameter(parameter)?;
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::BusStatus;
    use crate::driver::StatusFlags;

    #[test]
    fn test_bus_status_precedence() {
        assert_eq!(BusStatus::from(StatusFlags::empty()), BusStatus::Unknown);
        assert_eq!(BusStatus::from(StatusFlags::ERROR_ACTIVE), BusStatus::Good);
        assert_eq!(
            BusStatus::from(StatusFlags::ERROR_ACTIVE | StatusFlags::ERROR_WARNING),
            BusStatus::Warning
        );
        assert_eq!(
            BusStatus::from(StatusFlags::ERROR_WARNING | StatusFlags::ERROR_PASSIVE),
            BusStatus::Error
        );
        assert_eq!(
            BusStatus::from(StatusFlags::ERROR_PASSIVE | StatusFlags::BUS_OFF),
            BusStatus::BusOff
        );
        assert_eq!(BusStatus::from(StatusFlags::TX_PENDING), BusStatus::Unknown);
    }
}
