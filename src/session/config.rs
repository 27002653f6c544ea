//! Bus configuration keys, their validation and the driver call each maps to.

use crate::driver::IoControl;
use crate::error::SessionError;
use crate::frame::{FrameType, EXTENDED_ID_MASK, STANDARD_ID_MASK};

pub const DEFAULT_BIT_RATE: u32 = 500_000;

/// Classic bit rates and their `canBITRATE_*` codes.
pub const SUPPORTED_BIT_RATES: [(u32, i32); 9] = [
    (10_000, -9),
    (50_000, -7),
    (62_000, -6),
    (83_000, -8),
    (100_000, -5),
    (125_000, -4),
    (250_000, -3),
    (500_000, -2),
    (1_000_000, -1),
];

/// FD data-phase bit rates and their `canFD_BITRATE_*` codes.
pub const SUPPORTED_DATA_BIT_RATES: [(u32, i32); 5] = [
    (500_000, -1000),
    (1_000_000, -1001),
    (2_000_000, -1002),
    (4_000_000, -1003),
    (8_000_000, -1004),
];

pub fn bit_rate_code(bit_rate: u32) -> Option<i32> {
    SUPPORTED_BIT_RATES
        .iter()
        .find(|(rate, _)| *rate == bit_rate)
        .map(|(_, code)| *code)
}

pub fn data_bit_rate_code(bit_rate: u32) -> Option<i32> {
    SUPPORTED_DATA_BIT_RATES
        .iter()
        .find(|(rate, _)| *rate == bit_rate)
        .map(|(_, code)| *code)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigurationKey {
    BitRate,
    DataBitRate,
    CanFd,
    Loopback,
    ReceiveOwn,
    Filters,
    ErrorFilter,
    Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterFormat {
    Base,
    Extended,
    BaseAndExtended,
}

/// Acceptance filter. A received id passes when
/// `id & frame_id_mask == frame_id & frame_id_mask`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub frame_id: u32,
    pub frame_id_mask: u32,
    pub frame_type: FrameType,
    pub format: FilterFormat,
}

impl Filter {
    pub fn new(frame_id: u32, frame_id_mask: u32, format: FilterFormat) -> Self {
        Self {
            frame_id,
            frame_id_mask,
            frame_type: FrameType::Data,
            format,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationParameter {
    BitRate(u32),
    DataBitRate(u32),
    CanFd(bool),
    Loopback(bool),
    ReceiveOwn(bool),
    Filters(Vec<Filter>),
    ErrorFilter(u32),
    Protocol(String),
}

impl ConfigurationParameter {
    pub fn key(&self) -> ConfigurationKey {
        match self {
            ConfigurationParameter::BitRate(_) => ConfigurationKey::BitRate,
            ConfigurationParameter::DataBitRate(_) => ConfigurationKey::DataBitRate,
            ConfigurationParameter::CanFd(_) => ConfigurationKey::CanFd,
            ConfigurationParameter::Loopback(_) => ConfigurationKey::Loopback,
            ConfigurationParameter::ReceiveOwn(_) => ConfigurationKey::ReceiveOwn,
            ConfigurationParameter::Filters(_) => ConfigurationKey::Filters,
            ConfigurationParameter::ErrorFilter(_) => ConfigurationKey::ErrorFilter,
            ConfigurationParameter::Protocol(_) => ConfigurationKey::Protocol,
        }
    }

    /// Validates the value and translates it to the driver operation that
    /// applies it. Never touches the hardware.
    pub(crate) fn command(&self) -> Result<ConfigCommand, SessionError> {
        match self {
            ConfigurationParameter::BitRate(rate) => bit_rate_code(*rate)
                .map(ConfigCommand::BusParams)
                .ok_or_else(|| {
                    SessionError::Configuration(format!("unsupported bit rate {rate}"))
                }),
            ConfigurationParameter::DataBitRate(rate) => data_bit_rate_code(*rate)
                .map(ConfigCommand::BusParamsFd)
                .ok_or_else(|| {
                    SessionError::Configuration(format!("unsupported data bit rate {rate}"))
                }),
            ConfigurationParameter::CanFd(_) => Ok(ConfigCommand::NextOpen),
            ConfigurationParameter::Loopback(on) => Ok(ConfigCommand::IoControl(
                IoControl::SetLocalTxEcho,
                u32::from(*on),
            )),
            ConfigurationParameter::ReceiveOwn(on) => {
                Ok(ConfigCommand::IoControl(IoControl::SetTxAck, u32::from(*on)))
            }
            ConfigurationParameter::Filters(filters) => {
                FilterSlots::from_filters(filters).map(ConfigCommand::Filters)
            }
            ConfigurationParameter::ErrorFilter(_) | ConfigurationParameter::Protocol(_) => Err(
                SessionError::Configuration(format!("unsupported key {:?}", self.key())),
            ),
        }
    }
}

/// Driver operation derived from a validated parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConfigCommand {
    BusParams(i32),
    BusParamsFd(i32),
    IoControl(IoControl, u32),
    Filters(FilterSlots),
    /// Only read when the channel is next opened.
    NextOpen,
}

/// One hardware acceptance slot per identifier format; `None` accepts all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct FilterSlots {
    pub(crate) standard: Option<(u32, u32)>,
    pub(crate) extended: Option<(u32, u32)>,
}

impl FilterSlots {
    pub(crate) fn from_filters(filters: &[Filter]) -> Result<Self, SessionError> {
        let mut slots = FilterSlots::default();
        for filter in filters {
            if filter.frame_type != FrameType::Data {
                return Err(SessionError::Configuration(format!(
                    "filter frame type {:?} is not supported",
                    filter.frame_type
                )));
            }
            let range = match filter.format {
                FilterFormat::Base => STANDARD_ID_MASK,
                FilterFormat::Extended | FilterFormat::BaseAndExtended => EXTENDED_ID_MASK,
            };
            if filter.frame_id & !range != 0 {
                return Err(SessionError::Configuration(format!(
                    "filter id {:#x} out of range",
                    filter.frame_id
                )));
            }
            let fills_standard = filter.format != FilterFormat::Extended;
            let fills_extended = filter.format != FilterFormat::Base;
            if (fills_standard && slots.standard.is_some())
                || (fills_extended && slots.extended.is_some())
            {
                return Err(SessionError::Configuration(
                    "only one filter per frame format is supported".to_owned(),
                ));
            }
            if fills_standard {
                slots.standard = Some((
                    filter.frame_id & STANDARD_ID_MASK,
                    filter.frame_id_mask & STANDARD_ID_MASK,
                ));
            }
            if fills_extended {
                slots.extended = Some((
                    filter.frame_id & EXTENDED_ID_MASK,
                    filter.frame_id_mask & EXTENDED_ID_MASK,
                ));
            }
        }
        Ok(slots)
    }
}

/// Result of a successful `set_configuration_parameter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOutcome {
    /// Written to the hardware.
    Applied,
    /// Kept for the next open; nothing to write right now.
    Stored,
    /// Kept, but the channel was opened without init access so the
    /// hardware write was left out.
    Skipped,
}

/// Parameters a session applies when it opens. Bit rate is always present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfiguration {
    bit_rate: u32,
    data_bit_rate: Option<u32>,
    can_fd: Option<bool>,
    loopback: Option<bool>,
    receive_own: Option<bool>,
    filters: Option<Vec<Filter>>,
}

impl Default for BusConfiguration {
    fn default() -> Self {
        Self {
            bit_rate: DEFAULT_BIT_RATE,
            data_bit_rate: None,
            can_fd: None,
            loopback: None,
            receive_own: None,
            filters: None,
        }
    }
}

impl BusConfiguration {
    pub fn bit_rate(&self) -> u32 {
        self.bit_rate
    }

    pub fn data_bit_rate(&self) -> Option<u32> {
        self.data_bit_rate
    }

    pub fn can_fd(&self) -> bool {
        self.can_fd.unwrap_or(false)
    }

    pub fn filters(&self) -> Option<&[Filter]> {
        self.filters.as_deref()
    }

    pub(crate) fn store(&mut self, parameter: ConfigurationParameter) {
        match parameter {
            ConfigurationParameter::BitRate(rate) => self.bit_rate = rate,
            ConfigurationParameter::DataBitRate(rate) => self.data_bit_rate = Some(rate),
            ConfigurationParameter::CanFd(on) => self.can_fd = Some(on),
            ConfigurationParameter::Loopback(on) => self.loopback = Some(on),
            ConfigurationParameter::ReceiveOwn(on) => self.receive_own = Some(on),
            ConfigurationParameter::Filters(filters) => self.filters = Some(filters),
            ConfigurationParameter::ErrorFilter(_) | ConfigurationParameter::Protocol(_) => {}
        }
    }

    /// Explicitly set parameters, in the order they are applied on open.
    pub fn parameters(&self) -> Vec<ConfigurationParameter> {
        let mut parameters = vec![ConfigurationParameter::BitRate(self.bit_rate)];
        parameters.extend(self.data_bit_rate.map(ConfigurationParameter::DataBitRate));
        parameters.extend(self.can_fd.map(ConfigurationParameter::CanFd));
        parameters.extend(self.loopback.map(ConfigurationParameter::Loopback));
        parameters.extend(self.receive_own.map(ConfigurationParameter::ReceiveOwn));
        parameters.extend(self.filters.clone().map(ConfigurationParameter::Filters));
        parameters
    }
}

#[cfg(test)]
mod tests {
    use super::{
        BusConfiguration, ConfigCommand, ConfigurationParameter, Filter, FilterFormat,
        FilterSlots, SUPPORTED_BIT_RATES,
    };
    use crate::driver::IoControl;
    use crate::error::ErrorKind;
    use crate::frame::FrameType;

    #[test]
    fn test_bit_rate_commands() {
        for (rate, code) in SUPPORTED_BIT_RATES {
            assert_eq!(
                ConfigurationParameter::BitRate(rate).command(),
                Ok(ConfigCommand::BusParams(code))
            );
        }
        for rate in [0, 20_000, 800_000, 2_000_000] {
            let err = ConfigurationParameter::BitRate(rate).command().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration);
        }
        assert_eq!(
            ConfigurationParameter::DataBitRate(2_000_000).command(),
            Ok(ConfigCommand::BusParamsFd(-1002))
        );
        assert!(ConfigurationParameter::DataBitRate(3_000_000)
            .command()
            .is_err());
    }

    #[test]
    fn test_io_control_commands() {
        assert_eq!(
            ConfigurationParameter::Loopback(true).command(),
            Ok(ConfigCommand::IoControl(IoControl::SetLocalTxEcho, 1))
        );
        assert_eq!(
            ConfigurationParameter::ReceiveOwn(false).command(),
            Ok(ConfigCommand::IoControl(IoControl::SetTxAck, 0))
        );
        assert_eq!(
            ConfigurationParameter::CanFd(true).command(),
            Ok(ConfigCommand::NextOpen)
        );
    }

    #[test]
    fn test_unsupported_keys() {
        assert!(ConfigurationParameter::ErrorFilter(0xff).command().is_err());
        assert!(ConfigurationParameter::Protocol("j1939".to_owned())
            .command()
            .is_err());
    }

    #[test]
    fn test_filter_slots() {
        let slots = FilterSlots::from_filters(&[
            Filter::new(0x123, 0x7ff, FilterFormat::Base),
            Filter::new(0x18daf100, 0x1fffff00, FilterFormat::Extended),
        ])
        .unwrap();
        assert_eq!(slots.standard, Some((0x123, 0x7ff)));
        assert_eq!(slots.extended, Some((0x18daf100, 0x1fffff00)));

        let slots =
            FilterSlots::from_filters(&[Filter::new(0x100, 0x700, FilterFormat::BaseAndExtended)])
                .unwrap();
        assert_eq!(slots.standard, Some((0x100, 0x700)));
        assert_eq!(slots.extended, Some((0x100, 0x700)));

        assert_eq!(FilterSlots::from_filters(&[]).unwrap(), FilterSlots::default());
    }

    #[test]
    fn test_filter_validation() {
        let occupied = FilterSlots::from_filters(&[
            Filter::new(0x100, 0x7ff, FilterFormat::Base),
            Filter::new(0x200, 0x7ff, FilterFormat::Base),
        ]);
        assert!(occupied.is_err());

        let overlapping = FilterSlots::from_filters(&[
            Filter::new(0x100, 0x7ff, FilterFormat::Extended),
            Filter::new(0x200, 0x7ff, FilterFormat::BaseAndExtended),
        ]);
        assert!(overlapping.is_err());

        let remote = Filter {
            frame_type: FrameType::RemoteRequest,
            ..Filter::new(0x100, 0x7ff, FilterFormat::Base)
        };
        assert!(FilterSlots::from_filters(&[remote]).is_err());

        assert!(FilterSlots::from_filters(&[Filter::new(0x800, 0x7ff, FilterFormat::Base)]).is_err());
        assert!(
            FilterSlots::from_filters(&[Filter::new(0x2000_0000, 0, FilterFormat::Extended)])
                .is_err()
        );
    }

    #[test]
    fn test_configuration_parameters() {
        let mut config = BusConfiguration::default();
        assert_eq!(config.parameters(), vec![ConfigurationParameter::BitRate(500_000)]);

        config.store(ConfigurationParameter::ReceiveOwn(true));
        config.store(ConfigurationParameter::BitRate(250_000));
        config.store(ConfigurationParameter::Filters(vec![]));
        config.store(ConfigurationParameter::Protocol("ignored".to_owned()));
        assert_eq!(
            config.parameters(),
            vec![
                ConfigurationParameter::BitRate(250_000),
                ConfigurationParameter::ReceiveOwn(true),
                ConfigurationParameter::Filters(vec![]),
            ]
        );
        assert!(!config.can_fd());
    }
}
