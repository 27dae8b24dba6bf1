//! Finder device model.
//!
//! A [`FinderDevice`] is the canonical record for one physical beacon. It is
//! identified solely by its stable id; the transport address and signal
//! strength are refreshed from every sighting. Devices are shared as
//! `Arc<FinderDevice>` and only the engine mutates them.

pub mod connection;
pub mod family;
pub mod proximity;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::ble::advertising::IBeacon;
use crate::error::{Error, Result};

pub use connection::{ConnectionEvent, ConnectionState};
pub use family::{parse_device_id, DeviceFamily, FinderSong, POWER_HIGH, POWER_LOW};
pub use proximity::{Proximity, ProximityThresholds};

/// Mutable part of a device.
struct DeviceState {
    /// Last advertised beacon frame.
    beacon: Option<IBeacon>,
    /// Last transport address.
    address: Option<String>,
    /// Most recent signal strength sample.
    rssi: Option<i16>,
    /// Most recent advertised power level.
    power_level: u8,
    /// Proximity derived from `rssi`.
    proximity: Proximity,
    /// Monotonic time of the last sighting.
    last_seen: Option<Instant>,
    /// Wall clock time of the last sighting.
    last_seen_at: Option<DateTime<Utc>>,
    /// Number of sightings so far.
    detection_count: u64,
    /// Link state, driven by the command queue.
    connection_state: ConnectionState,
    /// Service UUIDs in the last advertisement.
    advertised_services: Vec<Uuid>,
}

/// Read-only copy of a device's state at one instant.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceSnapshot {
    /// Stable id.
    pub id: String,
    /// Protocol family.
    pub family: DeviceFamily,
    /// Last transport address.
    pub address: Option<String>,
    /// Most recent signal strength.
    pub rssi: Option<i16>,
    /// Most recent power level.
    pub power_level: u8,
    /// Proximity bucket.
    pub proximity: Proximity,
    /// Wall clock time of the last sighting.
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Number of sightings so far.
    pub detection_count: u64,
    /// Link state.
    pub connection_state: ConnectionState,
}

/// A single XY Finder device.
pub struct FinderDevice {
    /// Stable id.
    id: String,
    /// Protocol family.
    family: DeviceFamily,
    /// Internal state.
    state: RwLock<DeviceState>,
    /// Buckets used to derive proximity.
    thresholds: ProximityThresholds,
    /// Connection state change channel.
    state_tx: broadcast::Sender<ConnectionEvent>,
}

impl FinderDevice {
    /// Create a device of `family`, optionally from a beacon frame.
    pub fn new(family: DeviceFamily, beacon: Option<IBeacon>) -> Self {
        let id = match &beacon {
            Some(beacon) => family.device_id(beacon),
            None => family.default_id(),
        };
        let (state_tx, _) = broadcast::channel(16);

        Self {
            id,
            family,
            state: RwLock::new(DeviceState {
                power_level: beacon
                    .as_ref()
                    .filter(|_| family.encodes_power_level())
                    .map(|b| b.power_level())
                    .unwrap_or(POWER_LOW),
                beacon,
                address: None,
                rssi: None,
                proximity: Proximity::Unknown,
                last_seen: None,
                last_seen_at: None,
                detection_count: 0,
                connection_state: ConnectionState::Disconnected,
                advertised_services: Vec::new(),
            }),
            thresholds: ProximityThresholds::default(),
            state_tx,
        }
    }

    /// Build a device from an advertised beacon, if it belongs to a known family.
    pub fn from_beacon(beacon: IBeacon) -> Option<Self> {
        let family = DeviceFamily::from_beacon_uuid(&beacon.uuid)?;
        Some(Self::new(family, Some(beacon)))
    }

    /// Build a device from a known stable id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownFamily`] if the id is not a finder id.
    pub fn from_id(id: &str) -> Result<Self> {
        let (family, beacon) = parse_device_id(id)?;
        Ok(Self::new(family, beacon))
    }

    /// Use custom proximity thresholds.
    pub fn with_thresholds(mut self, thresholds: ProximityThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Refresh the device from a sighting: records the transport address and
    /// beacon frame, then applies [`update`](Self::update).
    ///
    /// Returns the power level before the sighting.
    pub(crate) fn record_sighting(
        &self,
        address: &str,
        beacon: IBeacon,
        rssi: i16,
        services: Vec<Uuid>,
    ) -> u8 {
        let previous = {
            let mut state = self.state.write();
            if state.address.as_deref() != Some(address) {
                debug!("Device {} now at address {}", self.id, address);
                state.address = Some(address.to_string());
            }
            state.beacon = Some(beacon);
            state.advertised_services = services;
            state.power_level
        };
        let power_level = if self.family.encodes_power_level() {
            beacon.power_level()
        } else {
            previous
        };
        self.update(rssi, power_level);
        previous
    }

    /// Refresh last-seen, recompute proximity and count the detection.
    pub(crate) fn update(&self, rssi: i16, power_level: u8) {
        let mut state = self.state.write();
        state.rssi = Some(rssi);
        state.power_level = power_level;
        state.proximity = self.thresholds.classify(Some(rssi));
        state.last_seen = Some(Instant::now());
        state.last_seen_at = Some(Utc::now());
        state.detection_count += 1;
    }

    /// Move to a new connection state, notifying state subscribers.
    pub(crate) fn set_connection_state(&self, new_state: ConnectionState) {
        let previous = {
            let mut state = self.state.write();
            std::mem::replace(&mut state.connection_state, new_state)
        };

        if previous != new_state {
            debug!(
                "Device {} connection state: {} -> {}",
                self.id, previous, new_state
            );
            let _ = self.state_tx.send(ConnectionEvent {
                device_id: self.id.clone(),
                previous,
                state: new_state,
            });
        }
    }

    // === Identification ===

    /// Stable id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Protocol family.
    pub fn family(&self) -> DeviceFamily {
        self.family
    }

    /// Last advertised beacon frame.
    pub fn beacon(&self) -> Option<IBeacon> {
        self.state.read().beacon
    }

    /// Last transport address, if the device has been sighted.
    pub fn address(&self) -> Option<String> {
        self.state.read().address.clone()
    }

    /// Service UUIDs the device advertises when it accepts connections.
    pub fn connectable_services(&self) -> Vec<Uuid> {
        self.family
            .connectable_services(self.state.read().beacon.as_ref())
    }

    /// Whether the last advertisement offered a connectable service.
    pub fn is_connectable(&self) -> bool {
        let connectable = self.connectable_services();
        self.state
            .read()
            .advertised_services
            .iter()
            .any(|s| connectable.contains(s))
    }

    // === Signal ===

    /// Most recent signal strength.
    pub fn rssi(&self) -> Option<i16> {
        self.state.read().rssi
    }

    /// Most recent power level.
    pub fn power_level(&self) -> u8 {
        self.state.read().power_level
    }

    /// Proximity bucket.
    pub fn proximity(&self) -> Proximity {
        self.state.read().proximity
    }

    /// Monotonic time of the last sighting.
    pub fn last_seen(&self) -> Option<Instant> {
        self.state.read().last_seen
    }

    /// Wall clock time of the last sighting.
    pub fn last_seen_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_seen_at
    }

    /// Number of sightings so far.
    pub fn detection_count(&self) -> u64 {
        self.state.read().detection_count
    }

    // === Connection ===

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.state.read().connection_state
    }

    /// Subscribe to connection state changes.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.state_tx.subscribe()
    }

    /// Copy the current state.
    pub fn snapshot(&self) -> DeviceSnapshot {
        let state = self.state.read();
        DeviceSnapshot {
            id: self.id.clone(),
            family: self.family,
            address: state.address.clone(),
            rssi: state.rssi,
            power_level: state.power_level,
            proximity: state.proximity,
            last_seen_at: state.last_seen_at,
            detection_count: state.detection_count,
            connection_state: state.connection_state,
        }
    }

    /// Resolve the transport address needed to open a link.
    pub(crate) fn require_address(&self) -> Result<String> {
        self.address().ok_or(Error::NotConnected)
    }
}

impl PartialEq for FinderDevice {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for FinderDevice {}

impl std::hash::Hash for FinderDevice {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Debug for FinderDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinderDevice")
            .field("id", &self.id)
            .field("family", &self.family)
            .field("rssi", &self.rssi())
            .field("connection_state", &self.connection_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{XY3_FAMILY_UUID, XY4_FAMILY_UUID};

    fn xy4(minor: u16) -> IBeacon {
        IBeacon::new(XY4_FAMILY_UUID, 20, minor)
    }

    #[test]
    fn test_from_beacon() {
        let device = FinderDevice::from_beacon(xy4(0x7064)).unwrap();
        assert_eq!(device.family(), DeviceFamily::Xy4);
        assert_eq!(device.power_level(), 4);
        assert_eq!(device.connection_state(), ConnectionState::Disconnected);
        assert_eq!(device.proximity(), Proximity::Unknown);

        let unknown = IBeacon::new(Uuid::nil(), 1, 1);
        assert!(FinderDevice::from_beacon(unknown).is_none());
    }

    #[test]
    fn test_from_id_round_trips_identity() {
        let device = FinderDevice::from_beacon(xy4(0x7064)).unwrap();
        let rebuilt = FinderDevice::from_id(device.id()).unwrap();
        assert_eq!(device, rebuilt);
        assert!(FinderDevice::from_id("bogus").is_err());
    }

    #[tokio::test]
    async fn test_update_refreshes_state() {
        let device = FinderDevice::from_beacon(xy4(0x7064)).unwrap();
        device.update(-55, 4);
        device.update(-72, 4);

        assert_eq!(device.rssi(), Some(-72));
        assert_eq!(device.proximity(), Proximity::Far);
        assert_eq!(device.detection_count(), 2);
        assert!(device.last_seen().is_some());
        assert!(device.last_seen_at().is_some());
    }

    #[tokio::test]
    async fn test_record_sighting_tracks_address_and_power() {
        let device = FinderDevice::from_beacon(xy4(0x7064)).unwrap();

        let previous = device.record_sighting("AA:BB", xy4(0x7068), -50, Vec::new());
        assert_eq!(previous, 4);
        assert_eq!(device.power_level(), 8);
        assert_eq!(device.address().as_deref(), Some("AA:BB"));

        // Address rotation does not change identity
        device.record_sighting("CC:DD", xy4(0x7064), -50, Vec::new());
        assert_eq!(device.address().as_deref(), Some("CC:DD"));
        assert_eq!(device, FinderDevice::from_beacon(xy4(0x7064)).unwrap());
    }

    #[test]
    fn test_equality_ignores_signal() {
        let a = FinderDevice::from_beacon(xy4(0x7064)).unwrap();
        let b = FinderDevice::from_beacon(xy4(0x7068)).unwrap();
        a.update(-40, 4);
        b.update(-90, 8);
        assert_eq!(a, b);
    }

    #[test]
    fn test_connection_state_events() {
        let device = FinderDevice::from_beacon(xy4(0x7064)).unwrap();
        let mut rx = device.subscribe_state();

        device.set_connection_state(ConnectionState::Connecting);
        device.set_connection_state(ConnectionState::Connecting);
        device.set_connection_state(ConnectionState::Connected);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.previous, ConnectionState::Disconnected);
        assert_eq!(first.state, ConnectionState::Connecting);
        assert_eq!(rx.try_recv().unwrap().state, ConnectionState::Connected);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_is_connectable() {
        let beacon = IBeacon::new(XY3_FAMILY_UUID, 1, 0x0104);
        let device = FinderDevice::from_beacon(beacon).unwrap();
        assert!(!device.is_connectable());

        let services = device.connectable_services();
        device.record_sighting("AA", beacon, -60, vec![services[0]]);
        assert!(device.is_connectable());
    }

    #[test]
    fn test_require_address() {
        let device = FinderDevice::from_id(&DeviceFamily::Xy4.default_id()).unwrap();
        assert!(matches!(device.require_address(), Err(Error::NotConnected)));
    }
}
