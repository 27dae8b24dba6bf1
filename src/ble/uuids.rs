//! BLE Service and Characteristic UUIDs.
//!
//! Contains the GATT catalog used to command XY Finder devices, and the
//! iBeacon proximity UUIDs that identify each device family.

use uuid::Uuid;

/// A characteristic addressed by its owning service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GattCharacteristic {
    /// Service UUID.
    pub service: Uuid,
    /// Characteristic UUID.
    pub uuid: Uuid,
}

impl GattCharacteristic {
    /// Create a characteristic reference.
    pub const fn new(service: Uuid, uuid: Uuid) -> Self {
        Self { service, uuid }
    }
}

impl std::fmt::Display for GattCharacteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service, self.uuid)
    }
}

// Apple manufacturer ID, carrier of iBeacon frames
/// Apple's Bluetooth company identifier.
pub const APPLE_MANUFACTURER_ID: u16 = 0x004C;

// Family proximity UUIDs
/// XY1 beacon proximity UUID.
pub const XY1_FAMILY_UUID: Uuid = Uuid::from_u128(0xa500248c_abc2_4206_9bd7_034f4fc9ed10);
/// XY2 beacon proximity UUID.
pub const XY2_FAMILY_UUID: Uuid = Uuid::from_u128(0x07775dd0_111b_11e4_9191_0800200c9a66);
/// XY3 beacon proximity UUID.
pub const XY3_FAMILY_UUID: Uuid = Uuid::from_u128(0x08885dd0_111b_11e4_9191_0800200c9a66);
/// XY4+ beacon proximity UUID.
pub const XY4_FAMILY_UUID: Uuid = Uuid::from_u128(0xa44eacf4_0104_0000_0000_5f784c9977b5);
/// XY-GPS beacon proximity UUID.
pub const XYGPS_FAMILY_UUID: Uuid = Uuid::from_u128(0x9474f7c6_47a4_11e6_beb8_9e71128cae77);

// Device Information Service (Standard BLE)
/// Standard BLE Device Information Service UUID.
pub const DEVICE_INFO_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_180a_0000_1000_8000_00805f9b34fb);
/// Firmware Revision characteristic.
pub const FIRMWARE_REVISION: GattCharacteristic = GattCharacteristic::new(
    DEVICE_INFO_SERVICE_UUID,
    Uuid::from_u128(0x0000_2a26_0000_1000_8000_00805f9b34fb),
);

// Link Loss Service (Standard BLE)
/// Standard BLE Link Loss Service UUID.
pub const LINK_LOSS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1803_0000_1000_8000_00805f9b34fb);
/// Link loss alert level characteristic.
pub const LINK_LOSS_ALERT_LEVEL: GattCharacteristic = GattCharacteristic::new(
    LINK_LOSS_SERVICE_UUID,
    Uuid::from_u128(0x0000_2a06_0000_1000_8000_00805f9b34fb),
);

// Control Service (XY1 - XY3, XY-GPS)
/// XY control service UUID.
pub const CONTROL_SERVICE_UUID: Uuid = Uuid::from_u128(0xf014ed15_0439_3000_e001_00001001ffff);
/// Buzzer characteristic.
pub const CONTROL_BUZZER: GattCharacteristic = GattCharacteristic::new(
    CONTROL_SERVICE_UUID,
    Uuid::from_u128(0xf014fff1_0439_3000_e001_00001001ffff),
);
/// Handshake characteristic.
pub const CONTROL_HANDSHAKE: GattCharacteristic = GattCharacteristic::new(
    CONTROL_SERVICE_UUID,
    Uuid::from_u128(0xf014fff2_0439_3000_e001_00001001ffff),
);
/// Firmware version string characteristic.
pub const CONTROL_VERSION: GattCharacteristic = GattCharacteristic::new(
    CONTROL_SERVICE_UUID,
    Uuid::from_u128(0xf014fff4_0439_3000_e001_00001001ffff),
);
/// Song selection characteristic.
pub const CONTROL_BUZZER_SELECT: GattCharacteristic = GattCharacteristic::new(
    CONTROL_SERVICE_UUID,
    Uuid::from_u128(0xf014fff6_0439_3000_e001_00001001ffff),
);
/// Surge characteristic.
pub const CONTROL_SURGE: GattCharacteristic = GattCharacteristic::new(
    CONTROL_SERVICE_UUID,
    Uuid::from_u128(0xf014fff7_0439_3000_e001_00001001ffff),
);
/// Button state characteristic (notify).
pub const CONTROL_BUTTON: GattCharacteristic = GattCharacteristic::new(
    CONTROL_SERVICE_UUID,
    Uuid::from_u128(0xf014fff8_0439_3000_e001_00001001ffff),
);
/// Remote disconnect characteristic.
pub const CONTROL_DISCONNECT: GattCharacteristic = GattCharacteristic::new(
    CONTROL_SERVICE_UUID,
    Uuid::from_u128(0xf014fff9_0439_3000_e001_00001001ffff),
);

// Primary Service (XY4+)
/// XY4+ primary service UUID.
pub const XY4_PRIMARY_SERVICE_UUID: Uuid = Uuid::from_u128(0xa44eacf4_0104_0001_0000_5f784c9977b5);
/// XY4+ button state characteristic (notify).
pub const XY4_BUTTON_STATE: GattCharacteristic = GattCharacteristic::new(
    XY4_PRIMARY_SERVICE_UUID,
    Uuid::from_u128(0xa44eacf4_0104_0001_0004_5f784c9977b5),
);
/// XY4+ buzzer characteristic.
pub const XY4_BUZZER: GattCharacteristic = GattCharacteristic::new(
    XY4_PRIMARY_SERVICE_UUID,
    Uuid::from_u128(0xa44eacf4_0104_0001_000b_5f784c9977b5),
);

/// Check if a characteristic reports button presses.
pub fn is_button_characteristic(characteristic: &GattCharacteristic) -> bool {
    *characteristic == CONTROL_BUTTON || *characteristic == XY4_BUTTON_STATE
}
