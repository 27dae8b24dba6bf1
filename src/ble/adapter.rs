//! Abstract radio capability.
//!
//! The engine never talks to a Bluetooth stack directly. Everything it needs
//! from the platform is expressed by [`RadioAdapter`]: power management, scan
//! control, a single notification stream, and connection/characteristic I/O.
//! [`BtleplugRadio`](crate::ble::platform::BtleplugRadio) is the production
//! implementation.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ble::uuids::GattCharacteristic;
use crate::error::Result;

/// Default number of links a radio keeps open at once.
pub const DEFAULT_MAX_CONNECTIONS: usize = 4;

/// Power state of the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PowerState {
    /// State not yet reported.
    #[default]
    Unknown,
    /// Radio is switched off.
    PoweredOff,
    /// Radio is on and usable.
    PoweredOn,
    /// No usable radio on this system.
    Unsupported,
}

impl PowerState {
    /// Check if the radio is usable.
    pub fn is_powered_on(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

/// Scanning mode requested from the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanMode {
    /// Continuous active scanning.
    #[default]
    Foreground,
    /// Duty-cycled monitoring to conserve power.
    Background,
}

impl std::fmt::Display for ScanMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Foreground => write!(f, "foreground"),
            Self::Background => write!(f, "background"),
        }
    }
}

/// One advertisement observation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sighting {
    /// Transport address of the advertiser. May rotate between sightings.
    pub address: String,
    /// Signal strength in dBm.
    pub rssi: i16,
    /// Manufacturer data keyed by company identifier.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
}

/// Notification delivered by the radio.
#[derive(Debug, Clone)]
pub enum RadioEvent {
    /// The radio's power state changed.
    PowerStateChanged(PowerState),
    /// A batch of advertisement sightings.
    Sightings(Vec<Sighting>),
    /// A link went down, whether requested or not.
    Disconnected {
        /// Address of the peripheral.
        address: String,
    },
    /// A characteristic notification arrived on a live link.
    Notification {
        /// Address of the peripheral.
        address: String,
        /// The characteristic that notified.
        characteristic: GattCharacteristic,
        /// The notified value.
        value: Bytes,
    },
}

/// Capability surface over the platform Bluetooth stack.
///
/// Notifications are delivered on a single stream, one at a time.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// Current power state.
    fn power_state(&self) -> PowerState;

    /// Ask the platform to power the radio on. Completion is reported through
    /// [`RadioEvent::PowerStateChanged`].
    async fn enable(&self) -> Result<()>;

    /// Subscribe to the notification stream.
    fn events(&self) -> broadcast::Receiver<RadioEvent>;

    /// Start delivering sightings.
    async fn start_scan(&self, mode: ScanMode) -> Result<()>;

    /// Stop delivering sightings.
    async fn stop_scan(&self) -> Result<()>;

    /// Open a link to the peripheral at `address`.
    async fn connect(&self, address: &str) -> Result<()>;

    /// Close the link to the peripheral at `address`.
    async fn disconnect(&self, address: &str) -> Result<()>;

    /// Read a characteristic value.
    async fn read(&self, address: &str, characteristic: &GattCharacteristic) -> Result<Bytes>;

    /// Write a characteristic value.
    async fn write(
        &self,
        address: &str,
        characteristic: &GattCharacteristic,
        value: &[u8],
    ) -> Result<()>;

    /// Maximum number of simultaneous links the platform supports.
    fn max_connections(&self) -> usize {
        DEFAULT_MAX_CONNECTIONS
    }
}
