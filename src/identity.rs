//! Stable channel identities and device enumeration.
//!
//! CANlib numbers channels in enumeration order, which shifts whenever a
//! device is plugged in or removed. A channel is therefore addressed by
//! `"<EAN>#<serial>.<channel on card>"`, which survives re-enumeration.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use nom::{
    bytes::complete::{tag, take_while_m_n},
    character::complete::{char, digit1},
    combinator::{all_consuming, map, map_res},
    sequence::{preceded, separated_pair},
    IResult,
};
use thiserror::Error;

use crate::driver::{Capabilities, ChannelDataItem, Driver, DriverResult, Status};

const NAME_BUFFER_LEN: usize = 256;
const EAN_BYTES: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("channel {0} not found")]
    ChannelNotFound(String),

    #[error("invalid channel name {0}")]
    InvalidName(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelIdentity {
    ean: String,
    serial: u64,
    channel_on_card: u32,
}

impl ChannelIdentity {
    pub fn new(ean: &[u8; EAN_BYTES], serial: u64, channel_on_card: u32) -> Self {
        Self {
            ean: format_ean(ean),
            serial,
            channel_on_card,
        }
    }

    pub fn ean(&self) -> &str {
        &self.ean
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn channel_on_card(&self) -> u32 {
        self.channel_on_card
    }

    /// Reads the identity attributes of an enumerated channel.
    pub fn read<D: Driver>(driver: &D, channel: i32) -> DriverResult<Self> {
        let mut ean = [0u8; EAN_BYTES];
        driver.channel_data(channel, ChannelDataItem::CardUpcNumber, &mut ean)?;
        let serial = read_u64(driver, channel, ChannelDataItem::CardSerialNumber)?;
        let channel_on_card = read_u32(driver, channel, ChannelDataItem::ChannelOnCard)?;
        Ok(Self::new(&ean, serial, channel_on_card))
    }
}

impl fmt::Display for ChannelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}.{}", self.ean, self.serial, self.channel_on_card)
    }
}

/// Sixteen hex digits, low nibble of each byte first.
pub fn format_ean(bytes: &[u8; EAN_BYTES]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{:x}{:x}", byte & 0x0f, byte >> 4))
        .collect()
}

fn identity(input: &str) -> IResult<&str, ChannelIdentity> {
    map(
        separated_pair(
            take_while_m_n(16, 16, |c: char| c.is_ascii_hexdigit()),
            char('#'),
            separated_pair(
                map_res(digit1, str::parse::<u64>),
                char('.'),
                map_res(digit1, str::parse::<u32>),
            ),
        ),
        |(ean, (serial, channel_on_card)): (&str, (u64, u32))| ChannelIdentity {
            ean: ean.to_ascii_lowercase(),
            serial,
            channel_on_card,
        },
    )(input)
}

fn portable_name(input: &str) -> IResult<&str, i32> {
    preceded(tag("can"), map_res(digit1, str::parse::<i32>))(input)
}

impl FromStr for ChannelIdentity {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        all_consuming(identity)(s)
            .map(|(_, identity)| identity)
            .map_err(|_| ResolveError::InvalidName(s.to_owned()))
    }
}

/// Names accepted by [`resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelName {
    Identity(ChannelIdentity),
    /// `can<N>`: a raw enumeration index, only valid until the next hot-plug.
    Index(i32),
}

impl FromStr for ChannelName {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok((_, index)) = all_consuming(portable_name)(s) {
            return Ok(ChannelName::Index(index));
        }
        s.parse().map(ChannelName::Identity)
    }
}

fn read_u32<D: Driver>(driver: &D, channel: i32, item: ChannelDataItem) -> DriverResult<u32> {
    let mut buf = [0u8; 4];
    driver.channel_data(channel, item, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<D: Driver>(driver: &D, channel: i32, item: ChannelDataItem) -> DriverResult<u64> {
    let mut buf = [0u8; 8];
    driver.channel_data(channel, item, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_string<D: Driver>(driver: &D, channel: i32, item: ChannelDataItem) -> DriverResult<String> {
    let mut buf = [0u8; NAME_BUFFER_LEN];
    driver.channel_data(channel, item, &mut buf)?;
    let len = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
}

fn channel_count<D: Driver>(driver: &D) -> i32 {
    driver.initialize();
    driver.channel_count().unwrap_or_else(|status: Status| {
        log::warn!("Cannot get number of channels: {}", status);
        0
    })
}

/// Maps `name` to the channel index the driver currently assigns to it.
pub fn resolve<D: Driver>(driver: &D, name: &str) -> Result<i32, ResolveError> {
    let count = channel_count(driver);
    match name.parse::<ChannelName>()? {
        ChannelName::Index(index) if index < count => Ok(index),
        ChannelName::Index(_) => Err(ResolveError::ChannelNotFound(name.to_owned())),
        ChannelName::Identity(target) => (0..count)
            .find(|channel| {
                ChannelIdentity::read(driver, *channel)
                    .map(|identity| identity == target)
                    .unwrap_or(false)
            })
            .ok_or_else(|| ResolveError::ChannelNotFound(name.to_owned())),
    }
}

/// Descriptor of one enumerated channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// `can<N>`, valid until the next re-enumeration.
    pub name: String,
    pub identity: ChannelIdentity,
    pub serial: u64,
    pub description: String,
    pub alias: String,
    pub channel_on_card: u32,
    pub is_virtual: bool,
    pub is_fd_capable: bool,
}

struct Probe {
    channel: i32,
    identity: ChannelIdentity,
    product_name: String,
    alias: String,
    capabilities: Capabilities,
}

fn probe_channel<D: Driver>(driver: &D, channel: i32) -> DriverResult<Probe> {
    let product_name = read_string(driver, channel, ChannelDataItem::DeviceProductName)?;
    let identity = ChannelIdentity::read(driver, channel)?;
    let capabilities = Capabilities::from_bits_truncate(read_u32(
        driver,
        channel,
        ChannelDataItem::Capabilities,
    )?);
    let alias = read_string(driver, channel, ChannelDataItem::CustomChannelName).unwrap_or_default();
    Ok(Probe {
        channel,
        identity,
        product_name,
        alias,
        capabilities,
    })
}

/// Lists every channel the driver reports, virtual ones included.
///
/// Channels whose attributes cannot be read are left out.
pub fn interfaces<D: Driver>(driver: &D) -> Vec<DeviceInfo> {
    let probes: Vec<Probe> = (0..channel_count(driver))
        .filter_map(|channel| match probe_channel(driver, channel) {
            Ok(probe) => Some(probe),
            Err(status) => {
                log::debug!("skipping channel {}: {}", channel, status);
                None
            }
        })
        .collect();

    let mut channels_per_card: HashMap<(&str, u64), usize> = HashMap::new();
    for probe in probes
        .iter()
        .filter(|probe| !probe.capabilities.contains(Capabilities::VIRTUAL))
    {
        *channels_per_card
            .entry((probe.identity.ean(), probe.identity.serial()))
            .or_default() += 1;
    }

    probes
        .iter()
        .map(|probe| {
            let is_virtual = probe.capabilities.contains(Capabilities::VIRTUAL);
            let shared = !is_virtual
                && channels_per_card
                    .get(&(probe.identity.ean(), probe.identity.serial()))
                    .is_some_and(|count| *count > 1);
            let description = if shared {
                format!(
                    "{} {}",
                    probe.product_name,
                    probe.identity.channel_on_card() + 1
                )
            } else {
                probe.product_name.clone()
            };
            DeviceInfo {
                name: format!("can{}", probe.channel),
                identity: probe.identity.clone(),
                serial: probe.identity.serial(),
                description,
                alias: probe.alias.clone(),
                channel_on_card: probe.identity.channel_on_card(),
                is_virtual,
                is_fd_capable: probe
                    .capabilities
                    .intersects(Capabilities::CANFD | Capabilities::CANFD_NONISO),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{format_ean, interfaces, resolve, ChannelIdentity, ChannelName, ResolveError};
    use crate::driver::mock::{MockChannel, MockDriver, MockOp};
    use crate::driver::{Capabilities, ChannelDataItem, Status};

    const EAN: [u8; 8] = [0x30, 0x05, 0x60, 0x30, 0x03, 0x07, 0x00, 0x00];

    fn leaf(serial: u64, channel_on_card: u32) -> MockChannel {
        MockChannel::new("Kvaser Leaf Light v2", EAN, serial, channel_on_card)
    }

    #[test]
    fn test_format_ean() {
        assert_eq!(format_ean(&EAN), "0350060330700000");
        assert_eq!(format_ean(&[0xab; 8]), "babababababababa");
    }

    #[test]
    fn test_identity_string() {
        let identity = ChannelIdentity::new(&EAN, 12345, 1);
        assert_eq!(identity.to_string(), "0350060330700000#12345.1");
        let parsed: ChannelIdentity = "0350060330700000#12345.1".parse().unwrap();
        assert_eq!(parsed, identity);
        assert!("0350060330700000#12345".parse::<ChannelIdentity>().is_err());
        assert!("035006033070#12345.1".parse::<ChannelIdentity>().is_err());
    }

    #[test]
    fn test_channel_name() {
        assert_eq!("can3".parse::<ChannelName>(), Ok(ChannelName::Index(3)));
        assert!(matches!(
            "0350060330700000#1.0".parse::<ChannelName>(),
            Ok(ChannelName::Identity(_))
        ));
        assert_eq!(
            "vcan0".parse::<ChannelName>(),
            Err(ResolveError::InvalidName("vcan0".to_owned()))
        );
    }

    #[test]
    fn test_identity_survives_reenumeration() {
        let driver = MockDriver::new();
        driver.add_channel(leaf(100, 0));
        driver.add_channel(leaf(200, 0));
        let target = ChannelIdentity::read(&driver, 1).unwrap();
        assert_eq!(resolve(&driver, &target.to_string()), Ok(1));

        // a hot-plugged device takes index 0
        driver.insert_channel(0, leaf(300, 0));
        let index = resolve(&driver, &target.to_string()).unwrap();
        assert_eq!(index, 2);
        assert_eq!(ChannelIdentity::read(&driver, index).unwrap(), target);
    }

    #[test]
    fn test_resolve_not_found() {
        let driver = MockDriver::new();
        driver.add_channel(leaf(100, 0));
        assert_eq!(
            resolve(&driver, "0350060330700000#999.0"),
            Err(ResolveError::ChannelNotFound(
                "0350060330700000#999.0".to_owned()
            ))
        );
        assert_eq!(resolve(&driver, "can0"), Ok(0));
        assert!(resolve(&driver, "can1").is_err());
    }

    #[test]
    fn test_resolve_skips_unreadable_channels() {
        let driver = MockDriver::new();
        driver.add_channel(leaf(100, 0).with_unreadable(ChannelDataItem::CardSerialNumber));
        driver.add_channel(leaf(100, 0));
        assert_eq!(resolve(&driver, "0350060330700000#100.0"), Ok(1));
    }

    #[test]
    fn test_resolve_without_channel_count() {
        let driver = MockDriver::new();
        driver.add_channel(leaf(100, 0));
        driver.fail(MockOp::ChannelCount, Status::Driver);
        assert!(matches!(
            resolve(&driver, "0350060330700000#100.0"),
            Err(ResolveError::ChannelNotFound(_))
        ));
        assert!(interfaces(&driver).is_empty());
    }

    #[test]
    fn test_interfaces() {
        let driver = MockDriver::new();
        driver.add_channel(leaf(100, 0).with_alias("engine"));
        driver.add_channel(leaf(100, 1));
        driver.add_channel(
            MockChannel::new("Kvaser U100", EAN, 200, 0).with_capabilities(Capabilities::CANFD),
        );
        driver.add_channel(
            MockChannel::new("Kvaser Virtual CAN Driver", [0; 8], 0, 0)
                .with_capabilities(Capabilities::VIRTUAL),
        );
        driver.add_channel(
            MockChannel::new("Kvaser Virtual CAN Driver", [0; 8], 0, 1)
                .with_capabilities(Capabilities::VIRTUAL),
        );
        driver.add_channel(leaf(400, 0).with_unreadable(ChannelDataItem::Capabilities));

        let infos = interfaces(&driver);
        assert_eq!(infos.len(), 5);

        assert_eq!(infos[0].name, "can0");
        assert_eq!(infos[0].description, "Kvaser Leaf Light v2 1");
        assert_eq!(infos[0].alias, "engine");
        assert_eq!(infos[0].identity.to_string(), "0350060330700000#100.0");
        assert_eq!(infos[1].description, "Kvaser Leaf Light v2 2");
        assert_eq!(infos[1].channel_on_card, 1);

        assert_eq!(infos[2].description, "Kvaser U100");
        assert!(infos[2].is_fd_capable);
        assert!(!infos[2].is_virtual);

        assert!(infos[3].is_virtual);
        assert_eq!(infos[3].description, "Kvaser Virtual CAN Driver");
        assert_eq!(infos[4].serial, 0);
    }
}
