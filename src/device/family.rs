//! Device families.
//!
//! Each XY Finder generation speaks its own protocol variant. The family is
//! recognised from the iBeacon proximity UUID and fixes the device's stable
//! identifier format, its connectable service UUIDs and its command encodings.

use uuid::Uuid;

use crate::ble::advertising::IBeacon;
use crate::ble::uuids::*;
use crate::error::{Error, Result};

/// Power level a device advertises in its low-power mode.
pub const POWER_LOW: u8 = 4;
/// Power level a device advertises in its high-power mode.
pub const POWER_HIGH: u8 = 8;

/// Protocol variant of a finder device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceFamily {
    /// First generation XY Find It.
    Xy1,
    /// Second generation.
    Xy2,
    /// Third generation.
    Xy3,
    /// XY4+.
    Xy4,
    /// XY-GPS tracker.
    XyGps,
}

impl DeviceFamily {
    /// Every known family.
    pub const ALL: [DeviceFamily; 5] = [Self::Xy1, Self::Xy2, Self::Xy3, Self::Xy4, Self::XyGps];

    /// iBeacon proximity UUID advertised by this family.
    pub fn uuid(&self) -> Uuid {
        match self {
            Self::Xy1 => XY1_FAMILY_UUID,
            Self::Xy2 => XY2_FAMILY_UUID,
            Self::Xy3 => XY3_FAMILY_UUID,
            Self::Xy4 => XY4_FAMILY_UUID,
            Self::XyGps => XYGPS_FAMILY_UUID,
        }
    }

    /// Identify a family from a beacon's proximity UUID.
    pub fn from_beacon_uuid(uuid: &Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|family| family.uuid() == *uuid)
    }

    /// Prefix of the stable identifier.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::XyGps => "xy:gps",
            _ => "xy:ibeacon",
        }
    }

    /// Human readable family name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Xy1 => "XY1",
            Self::Xy2 => "XY2",
            Self::Xy3 => "XY3",
            Self::Xy4 => "XY4+",
            Self::XyGps => "XY-GPS",
        }
    }

    /// Whether the low nibble of the minor carries the power level.
    pub fn encodes_power_level(&self) -> bool {
        matches!(self, Self::Xy3 | Self::Xy4 | Self::XyGps)
    }

    /// Stable identifier for a beacon of this family.
    ///
    /// For families that encode the power level in the minor value, the
    /// nibble is normalised so the identifier survives power changes.
    pub fn device_id(&self, beacon: &IBeacon) -> String {
        let minor = if self.encodes_power_level() {
            (beacon.minor & 0xfff0) | POWER_LOW as u16
        } else {
            beacon.minor
        };
        format!(
            "{}:{}.{}.{}",
            self.prefix(),
            self.uuid().hyphenated(),
            beacon.major,
            minor
        )
    }

    /// Identifier used when a device is built from the family alone.
    pub fn default_id(&self) -> String {
        format!("{}:{}", self.prefix(), self.uuid().hyphenated())
    }

    /// Service UUIDs a connectable device of this family advertises.
    ///
    /// Older generations expose the control service directly. Newer ones
    /// derive one service per power mode from the family UUID, major and minor.
    pub fn connectable_services(&self, beacon: Option<&IBeacon>) -> Vec<Uuid> {
        match self {
            Self::Xy1 | Self::Xy2 => vec![CONTROL_SERVICE_UUID],
            Self::Xy3 | Self::Xy4 | Self::XyGps => match beacon {
                Some(beacon) => [POWER_LOW, POWER_HIGH]
                    .into_iter()
                    .map(|power| self.derived_service_uuid(beacon, power))
                    .collect(),
                None => Vec::new(),
            },
        }
    }

    fn derived_service_uuid(&self, beacon: &IBeacon, power_level: u8) -> Uuid {
        let source = self.uuid();
        let source = source.as_bytes();
        let mut bytes = [0u8; 16];
        bytes[..12].copy_from_slice(&source[4..16]);
        bytes[12] = (beacon.major >> 8) as u8;
        bytes[13] = (beacon.major & 0x00ff) as u8;
        bytes[14] = (beacon.minor >> 8) as u8;
        bytes[15] = (beacon.minor & 0x00f0) as u8 | power_level;
        Uuid::from_bytes(bytes)
    }

    /// Characteristic that plays songs.
    pub fn buzzer_characteristic(&self) -> GattCharacteristic {
        match self {
            Self::Xy4 => XY4_BUZZER,
            _ => CONTROL_BUZZER_SELECT,
        }
    }

    /// Characteristic that reports button presses.
    pub fn button_characteristic(&self) -> GattCharacteristic {
        match self {
            Self::Xy4 => XY4_BUTTON_STATE,
            _ => CONTROL_BUTTON,
        }
    }

    /// Characteristic holding the firmware version.
    pub fn version_characteristic(&self) -> GattCharacteristic {
        match self {
            Self::Xy4 => FIRMWARE_REVISION,
            _ => CONTROL_VERSION,
        }
    }
}

impl std::fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Parse a stable identifier back into its family and beacon definition.
///
/// Accepts both `prefix:uuid.major.minor` and the bare `prefix:uuid` form.
pub fn parse_device_id(id: &str) -> Result<(DeviceFamily, Option<IBeacon>)> {
    let unknown = || Error::UnknownFamily {
        identifier: id.to_string(),
    };

    let (prefix, rest) = id.rsplit_once(':').ok_or_else(unknown)?;

    let mut parts = rest.split('.');
    let uuid = parts
        .next()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(unknown)?;
    let family = DeviceFamily::from_beacon_uuid(&uuid).ok_or_else(unknown)?;
    if family.prefix() != prefix {
        return Err(unknown());
    }

    let major = parts.next();
    let minor = parts.next();
    if parts.next().is_some() {
        return Err(unknown());
    }
    let beacon = match (major, minor) {
        (Some(major), Some(minor)) => {
            let parse = |name: &str, value: &str| {
                value.parse::<u16>().map_err(|_| Error::InvalidParameter {
                    name: name.to_string(),
                    value: value.to_string(),
                })
            };
            Some(IBeacon::new(
                uuid,
                parse("major", major)?,
                parse("minor", minor)?,
            ))
        }
        (None, None) => None,
        _ => return Err(unknown()),
    };

    Ok((family, beacon))
}

/// Songs a finder device can play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FinderSong {
    /// Stop playing.
    Off,
    /// The "find it" locator tune.
    #[default]
    FindIt,
}

impl FinderSong {
    /// Command bytes for this song on the given family.
    pub fn values(&self, family: DeviceFamily) -> Vec<u8> {
        match (self, family) {
            (Self::Off, DeviceFamily::Xy1) => vec![0xff],
            (Self::Off, _) => vec![0xff, 0x03],
            (Self::FindIt, DeviceFamily::Xy1) => vec![0x01],
            (Self::FindIt, DeviceFamily::Xy4) => vec![0x0b, 0x03],
            (Self::FindIt, _) => vec![0x01, 0x03],
        }
    }
}
