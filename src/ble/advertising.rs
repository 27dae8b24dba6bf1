//! Advertising data parsing.
//!
//! XY Finder devices advertise as iBeacons inside Apple manufacturer data.
//! The frame layout after the company identifier is:
//!
//! | Offset | Size | Field                          |
//! |--------|------|--------------------------------|
//! | 0      | 1    | Beacon type (0x02)             |
//! | 1      | 1    | Remaining length (0x15)        |
//! | 2      | 16   | Proximity UUID                 |
//! | 18     | 2    | Major (big-endian)             |
//! | 20     | 2    | Minor (big-endian)             |
//! | 22     | 1    | Measured power at 1 m (signed) |

use uuid::Uuid;

use crate::error::{Error, Result};

/// iBeacon type byte.
const IBEACON_TYPE: u8 = 0x02;
/// iBeacon remaining-length byte.
const IBEACON_LENGTH: u8 = 0x15;
/// Total frame size after the company identifier.
const IBEACON_FRAME_LEN: usize = 23;

/// Power level advertised while the device's button is held in pressed mode.
pub const BUTTON_PRESSED_POWER_LEVEL: u8 = 8;

/// Parsed iBeacon advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IBeacon {
    /// Proximity UUID, identifies the device family.
    pub uuid: Uuid,
    /// Major value.
    pub major: u16,
    /// Minor value. For XY3 and newer the low nibble is the power level.
    pub minor: u16,
    /// Calibrated transmit power at one meter, in dBm.
    pub measured_power: i8,
}

impl IBeacon {
    /// Create a beacon definition from its parts.
    pub fn new(uuid: Uuid, major: u16, minor: u16) -> Self {
        Self {
            uuid,
            major,
            minor,
            measured_power: -59,
        }
    }

    /// Parse an iBeacon frame from Apple manufacturer data.
    ///
    /// `data` excludes the two company identifier bytes, which is how
    /// btleplug hands manufacturer data over.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < IBEACON_FRAME_LEN {
            return Err(Error::InvalidData {
                context: format!(
                    "iBeacon frame too short: {} bytes, expected {}",
                    data.len(),
                    IBEACON_FRAME_LEN
                ),
            });
        }

        if data[0] != IBEACON_TYPE || data[1] != IBEACON_LENGTH {
            return Err(Error::InvalidData {
                context: format!("Not an iBeacon frame: {:02X} {:02X}", data[0], data[1]),
            });
        }

        let mut uuid_bytes = [0u8; 16];
        uuid_bytes.copy_from_slice(&data[2..18]);

        Ok(Self {
            uuid: Uuid::from_bytes(uuid_bytes),
            major: u16::from_be_bytes([data[18], data[19]]),
            minor: u16::from_be_bytes([data[20], data[21]]),
            measured_power: data[22] as i8,
        })
    }

    /// Encode back into a manufacturer data frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(IBEACON_FRAME_LEN);
        bytes.push(IBEACON_TYPE);
        bytes.push(IBEACON_LENGTH);
        bytes.extend_from_slice(self.uuid.as_bytes());
        bytes.extend_from_slice(&self.major.to_be_bytes());
        bytes.extend_from_slice(&self.minor.to_be_bytes());
        bytes.push(self.measured_power as u8);
        bytes
    }

    /// Power level carried in the low nibble of the minor value.
    pub fn power_level(&self) -> u8 {
        (self.minor & 0x000f) as u8
    }

    /// Whether the advertised power level signals a button press.
    pub fn is_button_pressed(&self) -> bool {
        self.power_level() == BUTTON_PRESSED_POWER_LEVEL
    }
}
