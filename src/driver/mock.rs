//! In-process driver used by the test-suite and by hosts without hardware.
//!
//! Every call that takes a channel handle is recorded as a [`DriverCall`].
//! Enumeration and error-text lookups are not recorded.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    AcceptanceFormat, Capabilities, ChannelDataItem, ChannelHandle, Driver, DriverMode,
    DriverResult, IoControl, NotifyEvents, NotifyTarget, OpenFlags, Status, StatusFlags,
};
use crate::codec::RawMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockChannel {
    pub product_name: String,
    pub ean: [u8; 8],
    pub serial: u64,
    pub channel_on_card: u32,
    pub capabilities: Capabilities,
    pub alias: String,
    /// Attributes whose lookup fails with `Status::NotFound`.
    pub unreadable: Vec<ChannelDataItem>,
}

impl MockChannel {
    pub fn new(product_name: &str, ean: [u8; 8], serial: u64, channel_on_card: u32) -> Self {
        Self {
            product_name: product_name.to_owned(),
            ean,
            serial,
            channel_on_card,
            capabilities: Capabilities::EXTENDED_CAN,
            alias: String::new(),
            unreadable: Vec::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = alias.to_owned();
        self
    }

    pub fn with_unreadable(mut self, item: ChannelDataItem) -> Self {
        self.unreadable.push(item);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    OpenChannel { channel: i32, flags: OpenFlags },
    CloseChannel(ChannelHandle),
    SetBusParams { handle: ChannelHandle, code: i32 },
    SetBusParamsFd { handle: ChannelHandle, code: i32 },
    SetOutputControl { handle: ChannelHandle, mode: DriverMode },
    BusOn(ChannelHandle),
    IoControl { handle: ChannelHandle, code: IoControl, value: u32 },
    SetNotifyCallback { handle: ChannelHandle, events: NotifyEvents },
    ReadStatus(ChannelHandle),
    Read(ChannelHandle),
    Write { handle: ChannelHandle, message: RawMessage },
    SetAcceptanceFilter {
        handle: ChannelHandle,
        code: u32,
        mask: u32,
        format: AcceptanceFormat,
    },
    ResetBus(ChannelHandle),
}

/// Operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    ChannelCount,
    OpenChannel,
    SetBusParams,
    SetBusParamsFd,
    SetOutputControl,
    BusOn,
    IoControl,
    SetNotifyCallback,
    ReadStatus,
    Write,
    SetAcceptanceFilter,
    ResetBus,
    ErrorText,
}

struct MockState {
    channels: Vec<MockChannel>,
    calls: Vec<DriverCall>,
    failures: HashMap<MockOp, Status>,
    deny_init_access: bool,
    fd_params: bool,
    next_handle: ChannelHandle,
    open: HashMap<ChannelHandle, i32>,
    targets: HashMap<ChannelHandle, Arc<dyn NotifyTarget>>,
    rx: VecDeque<DriverResult<RawMessage>>,
    status: StatusFlags,
}

/// Cloning shares the same simulated hardware.
#[derive(Clone)]
pub struct MockDriver(Arc<Mutex<MockState>>);

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(MockState {
            channels: Vec::new(),
            calls: Vec::new(),
            failures: HashMap::new(),
            deny_init_access: false,
            fd_params: true,
            next_handle: 0,
            open: HashMap::new(),
            targets: HashMap::new(),
            rx: VecDeque::new(),
            status: StatusFlags::empty(),
        })))
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_channel(&self, channel: MockChannel) -> i32 {
        let mut state = self.state();
        state.channels.push(channel);
        state.channels.len() as i32 - 1
    }

    /// Inserts a channel ahead of the existing ones, shifting their indices
    /// the way a hot-plugged device does.
    pub fn insert_channel(&self, index: usize, channel: MockChannel) {
        let mut state = self.state();
        let index = index.min(state.channels.len());
        state.channels.insert(index, channel);
    }

    pub fn remove_channel(&self, index: usize) -> Option<MockChannel> {
        let mut state = self.state();
        (index < state.channels.len()).then(|| state.channels.remove(index))
    }

    pub fn fail(&self, op: MockOp, status: Status) {
        self.state().failures.insert(op, status);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Opening with init access fails with `Status::NoAccess` while set.
    pub fn deny_init_access(&self, deny: bool) {
        self.state().deny_init_access = deny;
    }

    pub fn set_fd_params_supported(&self, supported: bool) {
        self.state().fd_params = supported;
    }

    pub fn set_status(&self, status: StatusFlags) {
        self.state().status = status;
    }

    pub fn push_message(&self, message: RawMessage) {
        self.state().rx.push_back(Ok(message));
    }

    pub fn push_read_error(&self, status: Status) {
        self.state().rx.push_back(Err(status));
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn open_handles(&self) -> Vec<ChannelHandle> {
        let mut handles: Vec<_> = self.state().open.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    /// Fires the callback registered for `handle` on the calling thread.
    /// Returns false when nothing is registered.
    pub fn notify(&self, handle: ChannelHandle, events: NotifyEvents) -> bool {
        let target = self.state().targets.get(&handle).cloned();
        match target {
            Some(target) => {
                target.notify(events);
                true
            }
            None => false,
        }
    }

    fn record(&self, call: DriverCall, op: MockOp) -> DriverResult<()> {
        let mut state = self.state();
        state.calls.push(call);
        match state.failures.get(&op) {
            Some(status) => Err(*status),
            None => Ok(()),
        }
    }

    fn check_handle(&self, handle: ChannelHandle) -> DriverResult<()> {
        if self.state().open.contains_key(&handle) {
            Ok(())
        } else {
            Err(Status::InvalidHandle)
        }
    }
}

fn put(buf: &mut [u8], bytes: &[u8]) -> DriverResult<()> {
    let dst = buf.get_mut(..bytes.len()).ok_or(Status::Param)?;
    dst.copy_from_slice(bytes);
    Ok(())
}

impl Driver for MockDriver {
    fn initialize(&self) {}

    fn channel_count(&self) -> DriverResult<i32> {
        let state = self.state();
        match state.failures.get(&MockOp::ChannelCount) {
            Some(status) => Err(*status),
            None => Ok(state.channels.len() as i32),
        }
    }

    fn channel_data(&self, channel: i32, item: ChannelDataItem, buf: &mut [u8]) -> DriverResult<()> {
        let state = self.state();
        let info = usize::try_from(channel)
            .ok()
            .and_then(|index| state.channels.get(index))
            .ok_or(Status::NotFound)?;
        if info.unreadable.contains(&item) {
            return Err(Status::NotFound);
        }
        match item {
            ChannelDataItem::Capabilities => put(buf, &info.capabilities.bits().to_le_bytes()),
            ChannelDataItem::ChannelOnCard => put(buf, &info.channel_on_card.to_le_bytes()),
            ChannelDataItem::CardSerialNumber => put(buf, &info.serial.to_le_bytes()),
            ChannelDataItem::CardUpcNumber => put(buf, &info.ean),
            ChannelDataItem::DeviceProductName => {
                put(buf, format!("{}\0", info.product_name).as_bytes())
            }
            ChannelDataItem::CustomChannelName => put(buf, format!("{}\0", info.alias).as_bytes()),
        }
    }

    fn open_channel(&self, channel: i32, flags: OpenFlags) -> DriverResult<ChannelHandle> {
        self.record(DriverCall::OpenChannel { channel, flags }, MockOp::OpenChannel)?;
        let mut state = self.state();
        let index = usize::try_from(channel).map_err(|_| Status::Param)?;
        let info = state.channels.get(index).ok_or(Status::NotFound)?;
        if info.capabilities.contains(Capabilities::VIRTUAL)
            && !flags.contains(OpenFlags::ACCEPT_VIRTUAL)
        {
            return Err(Status::NotFound);
        }
        if state.deny_init_access && flags.contains(OpenFlags::REQUIRE_INIT_ACCESS) {
            return Err(Status::NoAccess);
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        state.open.insert(handle, channel);
        Ok(handle)
    }

    fn close_channel(&self, handle: ChannelHandle) -> DriverResult<()> {
        let mut state = self.state();
        state.calls.push(DriverCall::CloseChannel(handle));
        state.targets.remove(&handle);
        state
            .open
            .remove(&handle)
            .map(|_| ())
            .ok_or(Status::InvalidHandle)
    }

    fn set_bus_params(&self, handle: ChannelHandle, code: i32) -> DriverResult<()> {
        self.record(DriverCall::SetBusParams { handle, code }, MockOp::SetBusParams)?;
        self.check_handle(handle)
    }

    fn set_bus_params_fd(&self, handle: ChannelHandle, code: i32) -> DriverResult<()> {
        self.record(DriverCall::SetBusParamsFd { handle, code }, MockOp::SetBusParamsFd)?;
        self.check_handle(handle)
    }

    fn supports_fd_params(&self) -> bool {
        self.state().fd_params
    }

    fn set_output_control(&self, handle: ChannelHandle, mode: DriverMode) -> DriverResult<()> {
        self.record(DriverCall::SetOutputControl { handle, mode }, MockOp::SetOutputControl)?;
        self.check_handle(handle)
    }

    fn bus_on(&self, handle: ChannelHandle) -> DriverResult<()> {
        self.record(DriverCall::BusOn(handle), MockOp::BusOn)?;
        self.check_handle(handle)?;
        let mut state = self.state();
        if state.status.is_empty() {
            state.status = StatusFlags::ERROR_ACTIVE;
        }
        Ok(())
    }

    fn io_control(&self, handle: ChannelHandle, code: IoControl, value: u32) -> DriverResult<()> {
        self.record(DriverCall::IoControl { handle, code, value }, MockOp::IoControl)?;
        self.check_handle(handle)
    }

    fn set_notify_callback(
        &self,
        handle: ChannelHandle,
        target: Arc<dyn NotifyTarget>,
        events: NotifyEvents,
    ) -> DriverResult<()> {
        self.record(DriverCall::SetNotifyCallback { handle, events }, MockOp::SetNotifyCallback)?;
        self.check_handle(handle)?;
        self.state().targets.insert(handle, target);
        Ok(())
    }

    fn read_status(&self, handle: ChannelHandle) -> DriverResult<StatusFlags> {
        self.record(DriverCall::ReadStatus(handle), MockOp::ReadStatus)?;
        self.check_handle(handle)?;
        Ok(self.state().status)
    }

    fn read(&self, handle: ChannelHandle) -> DriverResult<RawMessage> {
        let mut state = self.state();
        state.calls.push(DriverCall::Read(handle));
        if !state.open.contains_key(&handle) {
            return Err(Status::InvalidHandle);
        }
        state.rx.pop_front().unwrap_or(Err(Status::NoMessages))
    }

    fn write(&self, handle: ChannelHandle, message: &RawMessage) -> DriverResult<()> {
        self.record(
            DriverCall::Write {
                handle,
                message: *message,
            },
            MockOp::Write,
        )?;
        self.check_handle(handle)
    }

    fn set_acceptance_filter(
        &self,
        handle: ChannelHandle,
        code: u32,
        mask: u32,
        format: AcceptanceFormat,
    ) -> DriverResult<()> {
        self.record(
            DriverCall::SetAcceptanceFilter {
                handle,
                code,
                mask,
                format,
            },
            MockOp::SetAcceptanceFilter,
        )?;
        self.check_handle(handle)
    }

    fn reset_bus(&self, handle: ChannelHandle) -> DriverResult<()> {
        self.record(DriverCall::ResetBus(handle), MockOp::ResetBus)?;
        self.check_handle(handle)
    }

    fn error_text(&self, status: Status) -> DriverResult<String> {
        match self.state().failures.get(&MockOp::ErrorText) {
            Some(failure) => Err(*failure),
            None => Ok(status.to_string()),
        }
    }
}
