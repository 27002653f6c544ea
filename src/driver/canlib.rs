//! Binding to the Kvaser CANlib shared library.
//!
//! The library is loaded and initialized once per process on first use and
//! is never unloaded.

use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_long, c_uint, c_ulong, c_void, CStr};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use libloading::Library;
use thiserror::Error;

use super::{
    AcceptanceFormat, ChannelDataItem, ChannelHandle, Driver, DriverMode, DriverResult,
    IoControl, NotifyEvents, NotifyTarget, OpenFlags, Status, StatusFlags,
};
use crate::codec::{MessageFlags, RawMessage};
use crate::frame::MAX_FD_PAYLOAD;

/// Overrides the library search when set.
pub const LIBRARY_PATH_ENV: &str = "KVASER_CANLIB_PATH";

#[cfg(windows)]
const LIBRARY_NAMES: &[&str] = &["canlib32.dll"];
#[cfg(not(windows))]
const LIBRARY_NAMES: &[&str] = &["libcanlib.so.1", "libcanlib.so"];

const ERROR_TEXT_LEN: usize = 256;

// canAccept() envelope selectors
const FILTER_SET_CODE_STD: c_uint = 3;
const FILTER_SET_MASK_STD: c_uint = 4;
const FILTER_SET_CODE_EXT: c_uint = 5;
const FILTER_SET_MASK_EXT: c_uint = 6;

type KvCallback = unsafe extern "system" fn(c_int, *mut c_void, c_uint);

type CanInitializeLibrary = unsafe extern "system" fn();
type CanGetNumberOfChannels = unsafe extern "system" fn(*mut c_int) -> c_int;
type CanGetChannelData = unsafe extern "system" fn(c_int, c_int, *mut c_void, usize) -> c_int;
type CanIoCtl = unsafe extern "system" fn(c_int, c_uint, *mut c_void, c_uint) -> c_int;
type CanOpenChannel = unsafe extern "system" fn(c_int, c_int) -> c_int;
type CanClose = unsafe extern "system" fn(c_int) -> c_int;
type CanSetBusParams =
    unsafe extern "system" fn(c_int, c_long, c_uint, c_uint, c_uint, c_uint, c_uint) -> c_int;
type CanSetBusParamsFd = unsafe extern "system" fn(c_int, c_long, c_uint, c_uint, c_uint) -> c_int;
type CanSetBusOutputControl = unsafe extern "system" fn(c_int, c_uint) -> c_int;
type CanBusOn = unsafe extern "system" fn(c_int) -> c_int;
type KvSetNotifyCallback =
    unsafe extern "system" fn(c_int, Option<KvCallback>, *mut c_void, c_uint) -> c_int;
type CanReadStatus = unsafe extern "system" fn(c_int, *mut c_ulong) -> c_int;
type CanRead = unsafe extern "system" fn(
    c_int,
    *mut c_long,
    *mut c_void,
    *mut c_uint,
    *mut c_uint,
    *mut c_ulong,
) -> c_int;
type CanWrite = unsafe extern "system" fn(c_int, c_long, *const c_void, c_uint, c_uint) -> c_int;
type CanAccept = unsafe extern "system" fn(c_int, c_long, c_uint) -> c_int;
type CanResetBus = unsafe extern "system" fn(c_int) -> c_int;
type CanGetErrorText = unsafe extern "system" fn(c_int, *mut c_char, c_uint) -> c_int;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverLoadError {
    #[error("unable to load CANlib from {path}: {reason}")]
    Library { path: String, reason: String },

    #[error("CANlib symbol {symbol} is missing: {reason}")]
    Symbol { symbol: &'static str, reason: String },
}

macro_rules! resolve_symbol {
    ($library:expr, $name:literal, $ty:ty) => {
        // SAFETY: the declared signature matches the CANlib header.
        match unsafe { $library.get::<$ty>(concat!($name, "\0").as_bytes()) } {
            Ok(symbol) => *symbol,
            Err(e) => {
                return Err(DriverLoadError::Symbol {
                    symbol: $name,
                    reason: e.to_string(),
                })
            }
        }
    };
}

/// Resolved CANlib entry points.
pub struct Canlib {
    can_initialize_library: CanInitializeLibrary,
    can_get_number_of_channels: CanGetNumberOfChannels,
    can_get_channel_data: CanGetChannelData,
    can_io_ctl: CanIoCtl,
    can_open_channel: CanOpenChannel,
    can_close: CanClose,
    can_set_bus_params: CanSetBusParams,
    can_set_bus_params_fd: Option<CanSetBusParamsFd>,
    can_set_bus_output_control: CanSetBusOutputControl,
    can_bus_on: CanBusOn,
    kv_set_notify_callback: KvSetNotifyCallback,
    can_read_status: CanReadStatus,
    can_read: CanRead,
    can_write: CanWrite,
    can_accept: CanAccept,
    can_reset_bus: CanResetBus,
    can_get_error_text: CanGetErrorText,
    /// Callback contexts handed to the driver, released on close.
    contexts: Mutex<HashMap<ChannelHandle, Vec<Box<Arc<dyn NotifyTarget>>>>>,
    _library: Library,
}

static CANLIB: OnceLock<Result<Canlib, DriverLoadError>> = OnceLock::new();

/// Returns the process-wide driver, loading it on first call.
///
/// `path` (or `KVASER_CANLIB_PATH`) only has an effect on the first call.
pub fn load(path: Option<&str>) -> Result<CanlibDriver, DriverLoadError> {
    match CANLIB.get_or_init(|| Canlib::load(path)) {
        Ok(canlib) => Ok(CanlibDriver(canlib)),
        Err(e) => Err(e.clone()),
    }
}

fn open_library(path: Option<&str>) -> Result<Library, DriverLoadError> {
    let candidates: Vec<String> = match path
        .map(str::to_owned)
        .or_else(|| std::env::var(LIBRARY_PATH_ENV).ok())
    {
        Some(path) => vec![path],
        None => LIBRARY_NAMES.iter().map(|name| (*name).to_owned()).collect(),
    };
    let mut last_error = None;
    for candidate in candidates {
        // SAFETY: loading CANlib runs no initialisation code with preconditions.
        match unsafe { Library::new(&candidate) } {
            Ok(library) => {
                log::info!("loaded CANlib from {}", candidate);
                return Ok(library);
            }
            Err(e) => {
                log::debug!("failed to load {}: {}", candidate, e);
                last_error = Some(DriverLoadError::Library {
                    path: candidate,
                    reason: e.to_string(),
                });
            }
        }
    }
    Err(last_error.unwrap_or_else(|| DriverLoadError::Library {
        path: String::new(),
        reason: "no candidate library".to_owned(),
    }))
}

impl Canlib {
    fn load(path: Option<&str>) -> Result<Self, DriverLoadError> {
        let library = open_library(path)?;
        let can_initialize_library =
            resolve_symbol!(library, "canInitializeLibrary", CanInitializeLibrary);
        let can_get_number_of_channels =
            resolve_symbol!(library, "canGetNumberOfChannels", CanGetNumberOfChannels);
        let can_get_channel_data = resolve_symbol!(library, "canGetChannelData", CanGetChannelData);
        let can_io_ctl = resolve_symbol!(library, "canIoCtl", CanIoCtl);
        let can_open_channel = resolve_symbol!(library, "canOpenChannel", CanOpenChannel);
        let can_close = resolve_symbol!(library, "canClose", CanClose);
        let can_set_bus_params = resolve_symbol!(library, "canSetBusParams", CanSetBusParams);
        let can_set_bus_output_control =
            resolve_symbol!(library, "canSetBusOutputControl", CanSetBusOutputControl);
        let can_bus_on = resolve_symbol!(library, "canBusOn", CanBusOn);
        let kv_set_notify_callback =
            resolve_symbol!(library, "kvSetNotifyCallback", KvSetNotifyCallback);
        let can_read_status = resolve_symbol!(library, "canReadStatus", CanReadStatus);
        let can_read = resolve_symbol!(library, "canRead", CanRead);
        let can_write = resolve_symbol!(library, "canWrite", CanWrite);
        let can_accept = resolve_symbol!(library, "canAccept", CanAccept);
        let can_reset_bus = resolve_symbol!(library, "canResetBus", CanResetBus);
        let can_get_error_text = resolve_symbol!(library, "canGetErrorText", CanGetErrorText);
        // Older CANlib releases predate FD.
        // SAFETY: as above.
        let can_set_bus_params_fd =
            unsafe { library.get::<CanSetBusParamsFd>(b"canSetBusParamsFd\0") }
                .ok()
                .map(|symbol| *symbol);

        // SAFETY: resolved from the loaded library, takes no arguments.
        unsafe { can_initialize_library() };

        Ok(Self {
            can_initialize_library,
            can_get_number_of_channels,
            can_get_channel_data,
            can_io_ctl,
            can_open_channel,
            can_close,
            can_set_bus_params,
            can_set_bus_params_fd,
            can_set_bus_output_control,
            can_bus_on,
            kv_set_notify_callback,
            can_read_status,
            can_read,
            can_write,
            can_accept,
            can_reset_bus,
            can_get_error_text,
            contexts: Mutex::new(HashMap::new()),
            _library: library,
        })
    }
}

/// Entry point CANlib calls from its notification thread.
unsafe extern "system" fn notify_trampoline(_handle: c_int, context: *mut c_void, events: c_uint) {
    if context.is_null() {
        return;
    }
    // SAFETY: `context` points into a box kept in `Canlib::contexts` until
    // the handle is closed, after which the driver no longer calls back.
    let target = unsafe { &*(context as *const Arc<dyn NotifyTarget>) };
    target.notify(NotifyEvents::from_bits_truncate(events));
}

/// Cheap copyable handle to the loaded library.
#[derive(Clone, Copy)]
pub struct CanlibDriver(&'static Canlib);

impl Driver for CanlibDriver {
    fn initialize(&self) {
        // SAFETY: idempotent in CANlib.
        unsafe { (self.0.can_initialize_library)() }
    }

    fn channel_count(&self) -> DriverResult<i32> {
        let mut count: c_int = 0;
        // SAFETY: `count` outlives the call.
        Status::check(unsafe { (self.0.can_get_number_of_channels)(&mut count) })?;
        Ok(count)
    }

    fn channel_data(&self, channel: i32, item: ChannelDataItem, buf: &mut [u8]) -> DriverResult<()> {
        // SAFETY: the driver writes at most `buf.len()` bytes.
        Status::check(unsafe {
            (self.0.can_get_channel_data)(
                channel,
                item.into(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        })
    }

    fn open_channel(&self, channel: i32, flags: OpenFlags) -> DriverResult<ChannelHandle> {
        // SAFETY: plain value arguments.
        let handle = unsafe { (self.0.can_open_channel)(channel, flags.bits()) };
        if handle < 0 {
            Err(Status::from(handle))
        } else {
            Ok(handle)
        }
    }

    fn close_channel(&self, handle: ChannelHandle) -> DriverResult<()> {
        // SAFETY: plain value arguments.
        let result = Status::check(unsafe { (self.0.can_close)(handle) });
        self.0
            .contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle);
        result
    }

    fn set_bus_params(&self, handle: ChannelHandle, bit_rate_code: i32) -> DriverResult<()> {
        // SAFETY: predefined bit rate codes ignore the timing arguments.
        Status::check(unsafe {
            (self.0.can_set_bus_params)(handle, c_long::from(bit_rate_code), 0, 0, 0, 0, 0)
        })
    }

    fn set_bus_params_fd(&self, handle: ChannelHandle, bit_rate_code: i32) -> DriverResult<()> {
        let set_bus_params_fd = self.0.can_set_bus_params_fd.ok_or(Status::NotImplemented)?;
        // SAFETY: predefined bit rate codes ignore the timing arguments.
        Status::check(unsafe { set_bus_params_fd(handle, c_long::from(bit_rate_code), 0, 0, 0) })
    }

    fn supports_fd_params(&self) -> bool {
        self.0.can_set_bus_params_fd.is_some()
    }

    fn set_output_control(&self, handle: ChannelHandle, mode: DriverMode) -> DriverResult<()> {
        // SAFETY: plain value arguments.
        Status::check(unsafe { (self.0.can_set_bus_output_control)(handle, mode.into()) })
    }

    fn bus_on(&self, handle: ChannelHandle) -> DriverResult<()> {
        // SAFETY: plain value arguments.
        Status::check(unsafe { (self.0.can_bus_on)(handle) })
    }

    fn io_control(&self, handle: ChannelHandle, code: IoControl, value: u32) -> DriverResult<()> {
        let mut value: c_uint = value;
        // SAFETY: `value` outlives the call and its size is passed along.
        Status::check(unsafe {
            (self.0.can_io_ctl)(
                handle,
                code.into(),
                (&mut value as *mut c_uint).cast(),
                std::mem::size_of::<c_uint>() as c_uint,
            )
        })
    }

    fn set_notify_callback(
        &self,
        handle: ChannelHandle,
        target: Arc<dyn NotifyTarget>,
        events: NotifyEvents,
    ) -> DriverResult<()> {
        let context = Box::new(target);
        let context_ptr = &*context as *const Arc<dyn NotifyTarget> as *mut c_void;
        // SAFETY: the boxed context is stored below and outlives the handle.
        Status::check(unsafe {
            (self.0.kv_set_notify_callback)(
                handle,
                Some(notify_trampoline as KvCallback),
                context_ptr,
                events.bits(),
            )
        })?;
        self.0
            .contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(handle)
            .or_default()
            .push(context);
        Ok(())
    }

    fn read_status(&self, handle: ChannelHandle) -> DriverResult<StatusFlags> {
        let mut flags: c_ulong = 0;
        // SAFETY: `flags` outlives the call.
        Status::check(unsafe { (self.0.can_read_status)(handle, &mut flags) })?;
        Ok(StatusFlags::from_bits_truncate(flags as u32))
    }

    fn read(&self, handle: ChannelHandle) -> DriverResult<RawMessage> {
        let mut id: c_long = 0;
        let mut data = [0u8; MAX_FD_PAYLOAD];
        let mut dlc: c_uint = 0;
        let mut flags: c_uint = 0;
        let mut time: c_ulong = 0;
        // SAFETY: `data` holds the largest FD payload; the rest are scalars.
        Status::check(unsafe {
            (self.0.can_read)(
                handle,
                &mut id,
                data.as_mut_ptr().cast(),
                &mut dlc,
                &mut flags,
                &mut time,
            )
        })?;
        Ok(RawMessage {
            id: id as u32,
            data,
            dlc,
            flags: MessageFlags::from(flags),
            time: time as u32,
        })
    }

    fn write(&self, handle: ChannelHandle, message: &RawMessage) -> DriverResult<()> {
        // SAFETY: `message.data` covers `dlc` bytes.
        Status::check(unsafe {
            (self.0.can_write)(
                handle,
                message.id as c_long,
                message.data.as_ptr().cast(),
                message.dlc,
                u32::from(message.flags),
            )
        })
    }

    fn set_acceptance_filter(
        &self,
        handle: ChannelHandle,
        code: u32,
        mask: u32,
        format: AcceptanceFormat,
    ) -> DriverResult<()> {
        let (set_code, set_mask) = match format {
            AcceptanceFormat::Standard => (FILTER_SET_CODE_STD, FILTER_SET_MASK_STD),
            AcceptanceFormat::Extended => (FILTER_SET_CODE_EXT, FILTER_SET_MASK_EXT),
        };
        // SAFETY: plain value arguments.
        Status::check(unsafe { (self.0.can_accept)(handle, code as c_long, set_code) })?;
        // SAFETY: plain value arguments.
        Status::check(unsafe { (self.0.can_accept)(handle, mask as c_long, set_mask) })
    }

    fn reset_bus(&self, handle: ChannelHandle) -> DriverResult<()> {
        // SAFETY: plain value arguments.
        Status::check(unsafe { (self.0.can_reset_bus)(handle) })
    }

    fn error_text(&self, status: Status) -> DriverResult<String> {
        let mut buf = [0u8; ERROR_TEXT_LEN];
        // SAFETY: the driver writes a NUL terminated string within `buf`.
        Status::check(unsafe {
            (self.0.can_get_error_text)(
                status.code(),
                buf.as_mut_ptr().cast(),
                ERROR_TEXT_LEN as c_uint,
            )
        })?;
        CStr::from_bytes_until_nul(&buf)
            .map(|text| text.to_string_lossy().into_owned())
            .map_err(|_| Status::Param)
    }
}

#[cfg(test)]
mod tests {
    use super::{load, DriverLoadError};

    #[test]
    fn test_load_missing_library() {
        let err = load(Some("/nonexistent/libcanlib.so.1")).err().unwrap();
        assert!(matches!(
            err,
            DriverLoadError::Library { ref path, .. } if path == "/nonexistent/libcanlib.so.1"
        ));
        // the failed load is cached for the process
        assert_eq!(load(None).err(), Some(err));
    }
}
