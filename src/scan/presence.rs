//! Presence tracking.
//!
//! [`PresenceTracker`] owns the live device set and the per-family ranged
//! groups, and turns sightings into edge-triggered presence events. It does no
//! I/O and never blocks, so the orchestrator can run it inline on every radio
//! notification.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::ble::adapter::Sighting;
use crate::ble::advertising::{IBeacon, BUTTON_PRESSED_POWER_LEVEL};
use crate::ble::uuids::APPLE_MANUFACTURER_ID;
use crate::device::{DeviceFamily, FinderDevice, ProximityThresholds};
use crate::events::{ButtonPress, FinderEvent};

/// Live device set plus ranged grouping.
pub struct PresenceTracker {
    /// Every device seen or registered, by stable id.
    devices: HashMap<String, Arc<FinderDevice>>,
    /// Ids currently in range, grouped by family.
    ranged: BTreeMap<DeviceFamily, BTreeSet<String>>,
    /// Sightings weaker than this count as absent.
    rssi_floor: i16,
    /// Families of interest.
    families: HashSet<DeviceFamily>,
    /// Cutoffs for devices created by the tracker.
    thresholds: ProximityThresholds,
}

impl PresenceTracker {
    /// Create an empty tracker.
    pub fn new(
        rssi_floor: i16,
        families: HashSet<DeviceFamily>,
        thresholds: ProximityThresholds,
    ) -> Self {
        Self {
            devices: HashMap::new(),
            ranged: BTreeMap::new(),
            rssi_floor,
            families,
            thresholds,
        }
    }

    /// Apply a batch of sightings, returning the resulting events in order.
    pub fn process(&mut self, sightings: &[Sighting]) -> Vec<FinderEvent> {
        let mut events = Vec::new();

        for sighting in sightings {
            let Some(beacon) = sighting
                .manufacturer_data
                .get(&APPLE_MANUFACTURER_ID)
                .and_then(|data| IBeacon::parse(data).ok())
            else {
                trace!("Ignoring non-iBeacon sighting from {}", sighting.address);
                continue;
            };

            let Some(family) = DeviceFamily::from_beacon_uuid(&beacon.uuid) else {
                trace!("Ignoring beacon {} from {}", beacon.uuid, sighting.address);
                continue;
            };

            if !self.families.contains(&family) {
                continue;
            }

            let id = family.device_id(&beacon);

            if sighting.rssi == 0 || sighting.rssi < self.rssi_floor {
                // Too weak to count as present
                if let Some(device) = self.remove_ranged(family, &id) {
                    debug!("Device {} fell below the signal floor", id);
                    events.push(FinderEvent::Exited { device });
                }
                continue;
            }

            let device = self.device_for(&id, family, beacon);
            let previous_power = device.record_sighting(
                &sighting.address,
                beacon,
                sighting.rssi,
                sighting.services.clone(),
            );
            let power_level = device.power_level();

            if self.ranged.entry(family).or_default().insert(id.clone()) {
                debug!("Device {} entered range", id);
                events.push(FinderEvent::Entered {
                    device: device.clone(),
                });
            }

            events.push(FinderEvent::Detected {
                device: device.clone(),
                power_level,
                rssi: sighting.rssi,
                proximity: device.proximity(),
            });

            if power_level != previous_power {
                events.push(FinderEvent::Updated {
                    device: device.clone(),
                });
                if power_level == BUTTON_PRESSED_POWER_LEVEL {
                    events.push(FinderEvent::ButtonPressed {
                        device,
                        press: ButtonPress::Single,
                    });
                }
            }
        }

        events
    }

    /// Drop ranged devices not sighted within `stale_timeout` of `now`.
    pub fn sweep(&mut self, now: Instant, stale_timeout: Duration) -> Vec<FinderEvent> {
        let devices = &self.devices;
        let stale: Vec<(DeviceFamily, String)> = self
            .ranged
            .iter()
            .flat_map(|(family, ids)| ids.iter().map(move |id| (*family, id)))
            .filter(|(_, id)| {
                devices
                    .get(*id)
                    .and_then(|d| d.last_seen())
                    .map(|seen| now.saturating_duration_since(seen) > stale_timeout)
                    .unwrap_or(true)
            })
            .map(|(family, id)| (family, id.clone()))
            .collect();

        stale
            .into_iter()
            .filter_map(|(family, id)| {
                debug!("Device {} went stale", id);
                self.remove_ranged(family, &id)
            })
            .map(|device| FinderEvent::Exited { device })
            .collect()
    }

    /// Replace the family filter; ranged devices of dropped families exit.
    pub fn set_families(&mut self, families: HashSet<DeviceFamily>) -> Vec<FinderEvent> {
        self.families = families;

        let dropped: Vec<DeviceFamily> = self
            .ranged
            .keys()
            .filter(|family| !self.families.contains(*family))
            .copied()
            .collect();

        let mut events = Vec::new();
        for family in dropped {
            if let Some(ids) = self.ranged.remove(&family) {
                events.extend(
                    ids.iter()
                        .filter_map(|id| self.devices.get(id).cloned())
                        .map(|device| FinderEvent::Exited { device }),
                );
            }
        }
        events
    }

    /// Replace the signal floor; ranged devices now below it exit.
    pub fn set_rssi_floor(&mut self, rssi_floor: i16) -> Vec<FinderEvent> {
        self.rssi_floor = rssi_floor;

        let below: Vec<(DeviceFamily, String)> = self
            .ranged
            .iter()
            .flat_map(|(family, ids)| ids.iter().map(move |id| (*family, id.clone())))
            .filter(|(_, id)| {
                self.devices
                    .get(id)
                    .and_then(|d| d.rssi())
                    .map(|rssi| rssi < rssi_floor)
                    .unwrap_or(false)
            })
            .collect();

        below
            .into_iter()
            .filter_map(|(family, id)| self.remove_ranged(family, &id))
            .map(|device| FinderEvent::Exited { device })
            .collect()
    }

    /// Empty every ranged group, emitting an exit for each member.
    pub fn clear_ranged(&mut self) -> Vec<FinderEvent> {
        let ranged = std::mem::take(&mut self.ranged);
        ranged
            .into_values()
            .flatten()
            .filter_map(|id| self.devices.get(&id).cloned())
            .map(|device| FinderEvent::Exited { device })
            .collect()
    }

    /// Add a device to the live set, returning the existing one if its id is
    /// already known.
    pub fn register(&mut self, device: FinderDevice) -> Arc<FinderDevice> {
        self.devices
            .entry(device.id().to_string())
            .or_insert_with(|| Arc::new(device))
            .clone()
    }

    /// Look up a device by stable id.
    pub fn device(&self, id: &str) -> Option<Arc<FinderDevice>> {
        self.devices.get(id).cloned()
    }

    /// Look up a device by its last transport address.
    pub fn device_by_address(&self, address: &str) -> Option<Arc<FinderDevice>> {
        self.devices
            .values()
            .find(|d| d.address().as_deref() == Some(address))
            .cloned()
    }

    /// Every device in the live set.
    pub fn devices(&self) -> Vec<Arc<FinderDevice>> {
        self.devices.values().cloned().collect()
    }

    /// Whether a device is currently ranged.
    pub fn is_ranged(&self, id: &str) -> bool {
        self.ranged.values().any(|ids| ids.contains(id))
    }

    /// Ranged devices ordered by power level, then signal strength (both
    /// strongest first), then id.
    pub fn ranged_devices(&self) -> Vec<Arc<FinderDevice>> {
        let mut devices: Vec<Arc<FinderDevice>> = self
            .ranged
            .values()
            .flatten()
            .filter_map(|id| self.devices.get(id).cloned())
            .collect();
        sort_for_display(&mut devices);
        devices
    }

    /// Ranged devices of one family, in display order.
    pub fn ranged_by_family(&self, family: DeviceFamily) -> Vec<Arc<FinderDevice>> {
        let mut devices: Vec<Arc<FinderDevice>> = self
            .ranged
            .get(&family)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.devices.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        sort_for_display(&mut devices);
        devices
    }

    /// Current family filter.
    pub fn families(&self) -> &HashSet<DeviceFamily> {
        &self.families
    }

    /// Current signal floor.
    pub fn rssi_floor(&self) -> i16 {
        self.rssi_floor
    }

    fn device_for(&mut self, id: &str, family: DeviceFamily, beacon: IBeacon) -> Arc<FinderDevice> {
        let thresholds = self.thresholds;
        self.devices
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!("Discovered new {} device: {}", family, id);
                Arc::new(FinderDevice::new(family, Some(beacon)).with_thresholds(thresholds))
            })
            .clone()
    }

    fn remove_ranged(&mut self, family: DeviceFamily, id: &str) -> Option<Arc<FinderDevice>> {
        let group = self.ranged.get_mut(&family)?;
        if !group.remove(id) {
            return None;
        }
        if group.is_empty() {
            self.ranged.remove(&family);
        }
        self.devices.get(id).cloned()
    }
}

/// Order devices by power level, then signal strength, both descending, then
/// by stable id ascending.
pub fn sort_for_display(devices: &mut [Arc<FinderDevice>]) {
    devices.sort_by(|a, b| {
        b.power_level()
            .cmp(&a.power_level())
            .then_with(|| {
                b.rssi()
                    .unwrap_or(i16::MIN)
                    .cmp(&a.rssi().unwrap_or(i16::MIN))
            })
            .then_with(|| a.id().cmp(b.id()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{XY3_FAMILY_UUID, XY4_FAMILY_UUID};
    use crate::events::EventKind;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn sighting(uuid: uuid::Uuid, major: u16, minor: u16, rssi: i16) -> Sighting {
        let mut manufacturer_data = HashMap::new();
        manufacturer_data.insert(
            APPLE_MANUFACTURER_ID,
            IBeacon::new(uuid, major, minor).to_bytes(),
        );
        Sighting {
            address: format!("addr-{}", major),
            rssi,
            manufacturer_data,
            services: Vec::new(),
        }
    }

    fn xy4(major: u16, rssi: i16) -> Sighting {
        sighting(XY4_FAMILY_UUID, major, 0x0104, rssi)
    }

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(
            -95,
            DeviceFamily::ALL.into_iter().collect(),
            ProximityThresholds::default(),
        )
    }

    fn kinds(events: &[FinderEvent]) -> Vec<EventKind> {
        events.iter().map(|e| e.kind()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_sightings_enter_once() {
        let mut tracker = tracker();
        let mut all = Vec::new();
        for _ in 0..3 {
            all.extend(tracker.process(&[xy4(1, -60)]));
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        all.extend(tracker.sweep(Instant::now(), Duration::from_secs(10)));

        assert_eq!(
            kinds(&all),
            vec![
                EventKind::Entered,
                EventKind::Detected,
                EventKind::Detected,
                EventKind::Detected,
                EventKind::Exited,
            ]
        );
        assert_eq!(tracker.devices().len(), 1);
        assert!(tracker.ranged_devices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_fresh_devices() {
        let mut tracker = tracker();
        tracker.process(&[xy4(1, -60)]);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(tracker
            .sweep(Instant::now(), Duration::from_secs(10))
            .is_empty());
        assert_eq!(tracker.ranged_devices().len(), 1);
    }

    #[tokio::test]
    async fn test_below_floor_is_absent() {
        let mut tracker = tracker();
        assert!(tracker.process(&[xy4(1, -99)]).is_empty());

        tracker.process(&[xy4(1, -70)]);
        let events = tracker.process(&[xy4(1, -99)]);
        assert_eq!(kinds(&events), vec![EventKind::Exited]);

        let events = tracker.process(&[xy4(1, -70)]);
        assert_eq!(kinds(&events), vec![EventKind::Entered, EventKind::Detected]);
    }

    #[tokio::test]
    async fn test_ignores_unknown_and_filtered() {
        let mut tracker = tracker();
        let foreign = sighting(uuid::Uuid::nil(), 1, 1, -50);
        let no_beacon = Sighting {
            address: "x".to_string(),
            rssi: -50,
            ..Default::default()
        };
        assert!(tracker.process(&[foreign, no_beacon]).is_empty());

        tracker.set_families([DeviceFamily::Xy3].into_iter().collect());
        assert!(tracker.process(&[xy4(1, -50)]).is_empty());
        assert!(tracker.devices().is_empty());
    }

    #[tokio::test]
    async fn test_family_filter_change_exits_ranged() {
        let mut tracker = tracker();
        tracker.process(&[xy4(1, -60), xy4(2, -60), sighting(XY3_FAMILY_UUID, 9, 0x0104, -60)]);

        let events = tracker.set_families([DeviceFamily::Xy3].into_iter().collect());
        assert_eq!(kinds(&events), vec![EventKind::Exited, EventKind::Exited]);
        assert!(events
            .iter()
            .all(|e| e.device().family() == DeviceFamily::Xy4));

        // No detections for the removed family afterwards
        assert!(tracker.process(&[xy4(1, -60)]).is_empty());
        assert_eq!(tracker.ranged_devices().len(), 1);
    }

    #[tokio::test]
    async fn test_raising_floor_exits_weak_devices() {
        let mut tracker = tracker();
        tracker.process(&[xy4(1, -60), xy4(2, -85)]);
        let events = tracker.set_rssi_floor(-80);
        assert_eq!(kinds(&events), vec![EventKind::Exited]);
        assert_eq!(events[0].device().rssi(), Some(-85));
    }

    #[tokio::test]
    async fn test_button_press_edge() {
        let mut tracker = tracker();
        tracker.process(&[sighting(XY4_FAMILY_UUID, 1, 0x0104, -60)]);

        let pressed = tracker.process(&[sighting(XY4_FAMILY_UUID, 1, 0x0108, -60)]);
        assert_eq!(
            kinds(&pressed),
            vec![
                EventKind::Detected,
                EventKind::Updated,
                EventKind::ButtonPressed
            ]
        );

        let held = tracker.process(&[sighting(XY4_FAMILY_UUID, 1, 0x0108, -60)]);
        assert_eq!(kinds(&held), vec![EventKind::Detected]);
    }

    #[tokio::test]
    async fn test_display_order() {
        let mut tracker = tracker();
        tracker.process(&[
            sighting(XY4_FAMILY_UUID, 3, 0x0104, -70),
            sighting(XY4_FAMILY_UUID, 2, 0x0104, -50),
            sighting(XY4_FAMILY_UUID, 1, 0x0108, -90),
            sighting(XY4_FAMILY_UUID, 4, 0x0104, -50),
        ]);

        let majors: Vec<u16> = tracker
            .ranged_devices()
            .iter()
            .map(|d| d.beacon().unwrap().major)
            .collect();
        // Power 8 first, then strongest signal, then id order on ties
        assert_eq!(majors, vec![1, 2, 4, 3]);
    }

    #[tokio::test]
    async fn test_register_returns_existing() {
        let mut tracker = tracker();
        tracker.process(&[xy4(1, -60)]);
        let existing = tracker.devices()[0].clone();

        let registered = tracker.register(FinderDevice::from_id(existing.id()).unwrap());
        assert!(Arc::ptr_eq(&existing, &registered));
        assert!(tracker.device_by_address("addr-1").is_some());
    }

    #[tokio::test]
    async fn test_clear_ranged() {
        let mut tracker = tracker();
        tracker.process(&[xy4(1, -60), xy4(2, -60)]);
        let events = tracker.clear_ranged();
        assert_eq!(events.len(), 2);
        assert!(tracker.ranged_devices().is_empty());
        assert!(!tracker.is_ranged(events[0].device().id()));
    }

    proptest! {
        #[test]
        fn prop_edges_alternate(steps in proptest::collection::vec(any::<bool>(), 1..60)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            rt.block_on(async {
                let mut tracker = tracker();
                let mut edges = Vec::new();

                // true: sighted this tick, false: silent tick
                for present in steps {
                    if present {
                        edges.extend(tracker.process(&[xy4(1, -60)]));
                    }
                    tokio::time::advance(Duration::from_secs(4)).await;
                    edges.extend(tracker.sweep(Instant::now(), Duration::from_secs(6)));
                }

                let edges: Vec<EventKind> = edges
                    .iter()
                    .map(|e| e.kind())
                    .filter(|k| matches!(k, EventKind::Entered | EventKind::Exited))
                    .collect();

                for pair in edges.windows(2) {
                    assert_ne!(pair[0], pair[1]);
                }
                if let Some(first) = edges.first() {
                    assert_eq!(*first, EventKind::Entered);
                }
            });
        }
    }
}
