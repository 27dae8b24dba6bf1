//! Scan orchestration.
//!
//! [`ScanOrchestrator`] is the single owner of the scanning session. It turns
//! radio sightings into presence events through a [`PresenceTracker`], runs
//! the background duty cycle, and reports session status on its own stream.
//!
//! Sightings are processed inline and never wait on anything; only session
//! changes await the radio.

pub mod presence;

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::ble::adapter::{PowerState, RadioAdapter, ScanMode, Sighting};
use crate::config::ScanConfig;
use crate::device::{DeviceFamily, FinderDevice};
use crate::error::{Error, Result};
use crate::events::{EventBus, FinderEvent};

pub use presence::{sort_for_display, PresenceTracker};

/// Lifecycle of the scanning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanState {
    /// No session.
    #[default]
    Stopped,
    /// Requested, waiting for the radio to power on.
    Starting,
    /// Sightings are being processed.
    Active,
}

/// Session status reported on [`ScanOrchestrator::subscribe_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanStatus {
    /// No session.
    Stopped,
    /// Session requested but not yet scanning.
    Starting,
    /// Scanning in the given mode.
    Active(ScanMode),
    /// The radio is not powered on. Reported once per outage.
    BluetoothUnavailable,
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Active(mode) => write!(f, "active ({})", mode),
            Self::BluetoothUnavailable => write!(f, "bluetooth unavailable"),
        }
    }
}

struct Session {
    state: ScanState,
    mode: ScanMode,
    status: ScanStatus,
    /// Set once the current outage has been reported.
    unavailable_reported: bool,
    duty_cycle: Option<JoinHandle<()>>,
}

/// Owner of the scanning session and the live device set.
pub struct ScanOrchestrator {
    radio: Arc<dyn RadioAdapter>,
    bus: EventBus,
    config: ScanConfig,
    tracker: Mutex<PresenceTracker>,
    session: Mutex<Session>,
    status_tx: broadcast::Sender<ScanStatus>,
}

impl ScanOrchestrator {
    /// Create a stopped orchestrator publishing to `bus`.
    pub fn new(radio: Arc<dyn RadioAdapter>, bus: EventBus, config: ScanConfig) -> Self {
        let tracker = PresenceTracker::new(
            config.rssi_floor,
            config.families.clone(),
            config.proximity,
        );
        let (status_tx, _) = broadcast::channel(16);

        Self {
            radio,
            bus,
            config,
            tracker: Mutex::new(tracker),
            session: Mutex::new(Session {
                state: ScanState::Stopped,
                mode: ScanMode::Foreground,
                status: ScanStatus::Stopped,
                unavailable_reported: false,
                duty_cycle: None,
            }),
            status_tx,
        }
    }

    /// Start a session in `mode`, replacing any current session.
    ///
    /// If the radio is not powered on the session waits in
    /// [`ScanState::Starting`] and begins scanning once power-on is reported
    /// through [`handle_power_state`](Self::handle_power_state).
    pub async fn start(&self, mode: ScanMode) -> Result<()> {
        {
            let mut session = self.session.lock();
            if session.state == ScanState::Active && session.mode == mode {
                debug!("Already scanning in {} mode", mode);
                return Ok(());
            }
            session.mode = mode;
            session.state = ScanState::Starting;
            if let Some(handle) = session.duty_cycle.take() {
                handle.abort();
            }
        }
        self.set_status(ScanStatus::Starting);

        if self.radio.power_state().is_powered_on() {
            return self.begin(mode).await;
        }

        info!("Radio not powered on, {} scan deferred", mode);
        self.report_unavailable();
        if let Err(e) = self.radio.enable().await {
            warn!("Failed to enable radio: {}", e);
        }
        Ok(())
    }

    /// End the session. Every ranged device exits.
    pub async fn stop(&self) -> Result<()> {
        let previous = {
            let mut session = self.session.lock();
            if let Some(handle) = session.duty_cycle.take() {
                handle.abort();
            }
            std::mem::replace(&mut session.state, ScanState::Stopped)
        };

        if previous == ScanState::Stopped {
            return Ok(());
        }

        info!("Stopping scan");
        let exited = self.tracker.lock().clear_ranged();
        self.publish_all(exited);
        self.set_status(ScanStatus::Stopped);

        if previous == ScanState::Active {
            self.radio.stop_scan().await?;
        }
        Ok(())
    }

    /// React to a radio power change.
    pub async fn handle_power_state(&self, state: PowerState) {
        debug!("Radio power state: {:?}", state);

        if state.is_powered_on() {
            let pending = {
                let session = self.session.lock();
                (session.state == ScanState::Starting).then_some(session.mode)
            };
            if let Some(mode) = pending {
                if let Err(e) = self.begin(mode).await {
                    warn!("Failed to start deferred scan: {}", e);
                }
            }
            return;
        }

        let interrupted = {
            let mut session = self.session.lock();
            match session.state {
                ScanState::Stopped => false,
                ScanState::Starting => true,
                ScanState::Active => {
                    if let Some(handle) = session.duty_cycle.take() {
                        handle.abort();
                    }
                    session.state = ScanState::Starting;
                    true
                }
            }
        };

        if interrupted {
            self.report_unavailable();
        }
    }

    /// Apply a batch of sightings. Ignored unless the session is active.
    pub fn handle_sightings(&self, sightings: &[Sighting]) {
        if self.session.lock().state != ScanState::Active {
            trace!("Dropping {} sightings, scan not active", sightings.len());
            return;
        }
        let events = self.tracker.lock().process(sightings);
        self.publish_all(events);
    }

    /// Exit ranged devices not sighted within the current mode's staleness
    /// window.
    pub fn sweep(&self) {
        let mode = {
            let session = self.session.lock();
            if session.state == ScanState::Stopped {
                return;
            }
            session.mode
        };
        let events = self
            .tracker
            .lock()
            .sweep(Instant::now(), self.config.stale_timeout(mode));
        self.publish_all(events);
    }

    /// Replace the family filter. Ranged devices of removed families exit.
    pub fn set_family_filter(&self, families: impl IntoIterator<Item = DeviceFamily>) {
        let families: HashSet<DeviceFamily> = families.into_iter().collect();
        info!("Family filter: {:?}", families);
        let events = self.tracker.lock().set_families(families);
        self.publish_all(events);
    }

    /// Replace the signal floor. Ranged devices below it exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] unless the floor is a negative dBm
    /// value.
    pub fn set_rssi_floor(&self, rssi_floor: i16) -> Result<()> {
        if !(-127..0).contains(&rssi_floor) {
            return Err(Error::InvalidParameter {
                name: "rssi_floor".to_string(),
                value: rssi_floor.to_string(),
            });
        }
        info!("Signal floor: {} dBm", rssi_floor);
        let events = self.tracker.lock().set_rssi_floor(rssi_floor);
        self.publish_all(events);
        Ok(())
    }

    // === Queries ===

    /// Current session state.
    pub fn state(&self) -> ScanState {
        self.session.lock().state
    }

    /// Mode of the current or last session.
    pub fn mode(&self) -> ScanMode {
        self.session.lock().mode
    }

    /// Last reported status.
    pub fn status(&self) -> ScanStatus {
        self.session.lock().status
    }

    /// Subscribe to status changes.
    pub fn subscribe_status(&self) -> broadcast::Receiver<ScanStatus> {
        self.status_tx.subscribe()
    }

    /// Current family filter.
    pub fn families(&self) -> HashSet<DeviceFamily> {
        self.tracker.lock().families().clone()
    }

    /// Current signal floor.
    pub fn rssi_floor(&self) -> i16 {
        self.tracker.lock().rssi_floor()
    }

    /// Ranged devices in display order.
    pub fn ranged_devices(&self) -> Vec<Arc<FinderDevice>> {
        self.tracker.lock().ranged_devices()
    }

    /// Ranged devices of one family in display order.
    pub fn ranged_devices_by_family(&self, family: DeviceFamily) -> Vec<Arc<FinderDevice>> {
        self.tracker.lock().ranged_by_family(family)
    }

    /// Whether the device is currently ranged.
    pub fn is_ranged(&self, id: &str) -> bool {
        self.tracker.lock().is_ranged(id)
    }

    /// Every known device.
    pub fn devices(&self) -> Vec<Arc<FinderDevice>> {
        self.tracker.lock().devices()
    }

    /// Look up a device by stable id.
    pub fn device(&self, id: &str) -> Option<Arc<FinderDevice>> {
        self.tracker.lock().device(id)
    }

    /// Look up a device by transport address.
    pub fn device_by_address(&self, address: &str) -> Option<Arc<FinderDevice>> {
        self.tracker.lock().device_by_address(address)
    }

    /// Add a device to the live set.
    pub fn register(&self, device: FinderDevice) -> Arc<FinderDevice> {
        self.tracker.lock().register(device)
    }

    async fn begin(&self, mode: ScanMode) -> Result<()> {
        let duty_cycle = match mode {
            ScanMode::Foreground => {
                if let Err(e) = self.radio.start_scan(mode).await {
                    warn!("Failed to start scanning: {}", e);
                    self.session.lock().state = ScanState::Stopped;
                    self.set_status(ScanStatus::Stopped);
                    return Err(e);
                }
                None
            }
            ScanMode::Background => Some(tokio::spawn(duty_cycle(
                self.radio.clone(),
                self.config.background_listen_window,
                self.config.background_sleep_window,
            ))),
        };

        {
            let mut session = self.session.lock();
            // A stop or restart may have happened while the radio was busy
            if session.state != ScanState::Starting || session.mode != mode {
                if let Some(handle) = duty_cycle {
                    handle.abort();
                }
                return Ok(());
            }
            session.state = ScanState::Active;
            session.unavailable_reported = false;
            session.duty_cycle = duty_cycle;
        }

        info!("Scanning started in {} mode", mode);
        self.set_status(ScanStatus::Active(mode));
        Ok(())
    }

    fn report_unavailable(&self) {
        let first = {
            let mut session = self.session.lock();
            !std::mem::replace(&mut session.unavailable_reported, true)
        };
        if first {
            warn!("Bluetooth is not available");
            self.set_status(ScanStatus::BluetoothUnavailable);
        }
    }

    fn set_status(&self, status: ScanStatus) {
        let changed = {
            let mut session = self.session.lock();
            std::mem::replace(&mut session.status, status) != status
        };
        if changed {
            let _ = self.status_tx.send(status);
        }
    }

    fn publish_all(&self, events: Vec<FinderEvent>) {
        for event in events {
            self.bus.publish(event);
        }
    }
}

impl Drop for ScanOrchestrator {
    fn drop(&mut self) {
        if let Some(handle) = self.session.get_mut().duty_cycle.take() {
            handle.abort();
        }
    }
}

/// Alternate listening and sleeping until aborted.
async fn duty_cycle(radio: Arc<dyn RadioAdapter>, listen: Duration, sleep: Duration) {
    loop {
        if let Err(e) = radio.start_scan(ScanMode::Background).await {
            warn!("Background listen failed to start: {}", e);
        }
        tokio::time::sleep(listen).await;

        if let Err(e) = radio.stop_scan().await {
            warn!("Background listen failed to stop: {}", e);
        }
        tokio::time::sleep(sleep).await;
    }
}
