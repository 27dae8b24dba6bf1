//! Device manager for discovering and commanding XY Finder devices.
//!
//! [`DeviceManager`] is the long-lived engine handle. It owns the radio, the
//! event bus, the scan orchestrator and one command queue per commanded
//! device, and runs a driver task that routes the radio's notification
//! stream to them one notification at a time.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::ble::adapter::{RadioAdapter, RadioEvent, ScanMode};
use crate::ble::platform::BtleplugRadio;
use crate::ble::uuids::is_button_characteristic;
use crate::command::{CommandQueue, GattOperation, GattValue};
use crate::config::EngineConfig;
use crate::device::{DeviceFamily, FinderDevice, FinderSong};
use crate::error::{Error, Result};
use crate::events::{ButtonPress, EventBus, EventKind, FinderEvent, SubscriptionHandle};
use crate::scan::{ScanOrchestrator, ScanState, ScanStatus};

type QueueMap = Arc<RwLock<HashMap<String, Arc<CommandQueue>>>>;

/// Central manager for discovering and commanding finder devices.
pub struct DeviceManager {
    /// Platform radio.
    radio: Arc<dyn RadioAdapter>,
    /// Event bus shared with the orchestrator and queues.
    bus: EventBus,
    /// Scan orchestrator.
    scanner: Arc<ScanOrchestrator>,
    /// Command queues by device id.
    queues: QueueMap,
    /// Connection budget shared by every queue.
    permits: Arc<Semaphore>,
    /// Engine configuration.
    config: EngineConfig,
    /// Driver task handle.
    driver_handle: RwLock<Option<JoinHandle<()>>>,
    /// Running flag.
    is_running: Arc<AtomicBool>,
}

impl DeviceManager {
    /// Create a manager over the first Bluetooth adapter with default
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        Self::with_config(EngineConfig::default()).await
    }

    /// Create a manager over the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn with_config(config: EngineConfig) -> Result<Self> {
        let radio = BtleplugRadio::new().await?;
        Self::with_radio(Arc::new(radio), config)
    }

    /// Create a manager over any radio implementation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] when called outside a tokio runtime.
    pub fn with_radio(radio: Arc<dyn RadioAdapter>, config: EngineConfig) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Internal(format!("device manager needs a runtime: {}", e)))?;

        let bus = EventBus::new();
        let scanner = Arc::new(ScanOrchestrator::new(
            radio.clone(),
            bus.clone(),
            config.scan.clone(),
        ));
        let queues: QueueMap = Arc::new(RwLock::new(HashMap::new()));
        let permits = Arc::new(Semaphore::new(radio.max_connections().max(1)));
        let is_running = Arc::new(AtomicBool::new(true));

        // Subscribe before spawning so nothing sent from here on is missed
        let radio_rx = radio.events();
        let driver = runtime.spawn(Self::drive(
            radio_rx,
            scanner.clone(),
            queues.clone(),
            bus.clone(),
            config.scan.sweep_interval,
            is_running.clone(),
        ));

        info!(
            "Device manager ready ({} concurrent connections)",
            radio.max_connections()
        );

        Ok(Self {
            radio,
            bus,
            scanner,
            queues,
            permits,
            config,
            driver_handle: RwLock::new(Some(driver)),
            is_running,
        })
    }

    // === Events ===

    /// The event bus.
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// Subscribe `callback` to the given event kinds under a unique `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if `key` is already subscribed.
    pub fn subscribe<F>(
        &self,
        kinds: &[EventKind],
        key: impl Into<String>,
        callback: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(FinderEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(kinds, key, callback)
    }

    /// Remove the subscription registered under `key`.
    pub fn unsubscribe(&self, key: &str) -> bool {
        self.bus.unsubscribe(key)
    }

    // === Scan control ===

    /// Start continuous foreground scanning.
    pub async fn start_scanning(&self) -> Result<()> {
        self.scanner.start(ScanMode::Foreground).await
    }

    /// Stop foreground scanning. No-op if the session is in another mode.
    pub async fn stop_scanning(&self) -> Result<()> {
        self.stop_mode(ScanMode::Foreground).await
    }

    /// Start duty-cycled background monitoring.
    pub async fn start_monitoring(&self) -> Result<()> {
        self.scanner.start(ScanMode::Background).await
    }

    /// Stop background monitoring. No-op if the session is in another mode.
    pub async fn stop_monitoring(&self) -> Result<()> {
        self.stop_mode(ScanMode::Background).await
    }

    /// Replace the family filter.
    pub fn set_family_filter(&self, families: impl IntoIterator<Item = DeviceFamily>) {
        self.scanner.set_family_filter(families);
    }

    /// Current family filter.
    pub fn family_filter(&self) -> HashSet<DeviceFamily> {
        self.scanner.families()
    }

    /// Replace the signal-strength floor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] unless the floor is a negative dBm
    /// value.
    pub fn set_rssi_floor(&self, rssi_floor: i16) -> Result<()> {
        self.scanner.set_rssi_floor(rssi_floor)
    }

    /// Current signal-strength floor.
    pub fn rssi_floor(&self) -> i16 {
        self.scanner.rssi_floor()
    }

    /// Current scan session state.
    pub fn scan_state(&self) -> ScanState {
        self.scanner.state()
    }

    /// Last reported scan status.
    pub fn scan_status(&self) -> ScanStatus {
        self.scanner.status()
    }

    /// Subscribe to scan status changes.
    pub fn subscribe_scan_status(&self) -> broadcast::Receiver<ScanStatus> {
        self.scanner.subscribe_status()
    }

    /// Check if a session is processing sightings.
    pub fn is_scanning(&self) -> bool {
        self.scanner.state() == ScanState::Active
    }

    // === Devices ===

    /// Every known device.
    pub fn devices(&self) -> Vec<Arc<FinderDevice>> {
        self.scanner.devices()
    }

    /// Get a device by stable id.
    pub fn device(&self, id: &str) -> Option<Arc<FinderDevice>> {
        self.scanner.device(id)
    }

    /// Get the number of known devices.
    pub fn device_count(&self) -> usize {
        self.scanner.devices().len()
    }

    /// Add a device from a known stable id, returning the existing record if
    /// the device is already known.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownFamily`] if the id is not a finder id.
    pub fn add_device(&self, id: &str) -> Result<Arc<FinderDevice>> {
        let device = FinderDevice::from_id(id)?.with_thresholds(self.config.scan.proximity);
        Ok(self.scanner.register(device))
    }

    /// Ranged devices ordered by power level, signal strength, then id.
    pub fn ranged_devices(&self) -> Vec<Arc<FinderDevice>> {
        self.scanner.ranged_devices()
    }

    /// Ranged devices of one family.
    pub fn ranged_devices_by_family(&self, family: DeviceFamily) -> Vec<Arc<FinderDevice>> {
        self.scanner.ranged_devices_by_family(family)
    }

    /// Get the ranged device with the strongest signal.
    pub fn nearest_device(&self) -> Option<Arc<FinderDevice>> {
        self.scanner
            .ranged_devices()
            .into_iter()
            .max_by_key(|d| d.rssi().unwrap_or(i16::MIN))
    }

    /// Check if a device is currently ranged.
    pub fn is_ranged(&self, device: &FinderDevice) -> bool {
        self.scanner.is_ranged(device.id())
    }

    // === Commands ===

    /// Run `operations` against `device` in order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] for unknown devices,
    /// [`Error::NotPoweredOn`] if the radio is off, or the first error hit by
    /// the batch.
    pub async fn submit(
        &self,
        device: &FinderDevice,
        operations: Vec<GattOperation>,
    ) -> Result<Vec<GattValue>> {
        let queue = self.queue_for(device)?;
        queue.submit(operations).await
    }

    /// Callback form of [`submit`](Self::submit). Exactly one callback runs.
    pub fn submit_with<C, E>(
        &self,
        device: &FinderDevice,
        operations: Vec<GattOperation>,
        on_complete: C,
        on_error: E,
    ) where
        C: FnOnce(Vec<GattValue>) + Send + 'static,
        E: FnOnce(Error) + Send + 'static,
    {
        match self.queue_for(device) {
            Ok(queue) => queue.submit_with(operations, on_complete, on_error),
            Err(e) => on_error(e),
        }
    }

    /// Open a link to `device`. It closes again after the idle grace period
    /// unless commands follow.
    pub async fn connect(&self, device: &FinderDevice) -> Result<()> {
        self.submit(device, Vec::new()).await.map(|_| ())
    }

    /// Close the link to `device`, cancelling its queued operations.
    pub fn disconnect(&self, device: &FinderDevice) {
        let queue = self.queues.read().get(device.id()).cloned();
        match queue {
            Some(queue) => queue.disconnect(),
            None => debug!("No command queue for {}", device.id()),
        }
    }

    /// Play `song` on `device`.
    pub async fn find(&self, device: &FinderDevice, song: FinderSong) -> Result<()> {
        let family = device.family();
        info!("Playing {:?} on {}", song, device.id());
        self.submit(
            device,
            vec![GattOperation::write(
                family.buzzer_characteristic(),
                song.values(family),
            )],
        )
        .await
        .map(|_| ())
    }

    /// Read the firmware version of `device`.
    pub async fn read_version(&self, device: &FinderDevice) -> Result<String> {
        let values = self
            .submit(
                device,
                vec![GattOperation::read(device.family().version_characteristic())],
            )
            .await?;
        values
            .first()
            .ok_or_else(|| Error::InvalidData {
                context: "empty version read".to_string(),
            })?
            .as_string()
    }

    /// Clean shutdown of all connections and scanning.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down device manager");

        if self.scanner.state() != ScanState::Stopped {
            if let Err(e) = self.scanner.stop().await {
                warn!("Error stopping scan: {}", e);
            }
        }

        let queues: Vec<Arc<CommandQueue>> =
            self.queues.write().drain().map(|(_, q)| q).collect();
        for queue in queues {
            queue.close().await;
        }

        self.is_running.store(false, Ordering::SeqCst);
        let driver = self.driver_handle.write().take();
        if let Some(handle) = driver {
            handle.abort();
            let _ = handle.await;
        }

        Ok(())
    }

    /// Number of links that may be open at once.
    pub fn max_connections(&self) -> usize {
        self.radio.max_connections()
    }

    /// Links that could be opened right now.
    pub fn available_connections(&self) -> usize {
        self.permits.available_permits()
    }

    async fn stop_mode(&self, mode: ScanMode) -> Result<()> {
        if self.scanner.state() == ScanState::Stopped {
            return Ok(());
        }
        if self.scanner.mode() != mode {
            debug!("Not stopping: session is in {} mode", self.scanner.mode());
            return Ok(());
        }
        self.scanner.stop().await
    }

    /// Get or start the queue for a known device.
    fn queue_for(&self, device: &FinderDevice) -> Result<Arc<CommandQueue>> {
        if let Some(queue) = self.queues.read().get(device.id()) {
            return Ok(queue.clone());
        }

        let known = self
            .scanner
            .device(device.id())
            .ok_or_else(|| Error::DeviceNotFound {
                identifier: device.id().to_string(),
            })?;

        let mut queues = self.queues.write();
        if let Some(queue) = queues.get(device.id()) {
            return Ok(queue.clone());
        }

        debug!("Starting command queue for {}", known.id());
        let queue = Arc::new(CommandQueue::spawn(
            known,
            self.radio.clone(),
            self.bus.clone(),
            self.permits.clone(),
            self.config.command,
        )?);
        queues.insert(device.id().to_string(), queue.clone());
        Ok(queue)
    }

    /// Route radio notifications until the stream closes or the manager
    /// shuts down.
    async fn drive(
        mut rx: broadcast::Receiver<RadioEvent>,
        scanner: Arc<ScanOrchestrator>,
        queues: QueueMap,
        bus: EventBus,
        sweep_interval: Duration,
        is_running: Arc<AtomicBool>,
    ) {
        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while is_running.load(Ordering::SeqCst) {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(event) => Self::handle_radio_event(event, &scanner, &queues, &bus).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Radio event stream lagged, {} notifications dropped", skipped);
                    }
                    Err(RecvError::Closed) => {
                        debug!("Radio event stream closed");
                        break;
                    }
                },
                _ = sweep.tick() => scanner.sweep(),
            }
        }

        debug!("Device manager driver task ended");
    }

    async fn handle_radio_event(
        event: RadioEvent,
        scanner: &ScanOrchestrator,
        queues: &QueueMap,
        bus: &EventBus,
    ) {
        match event {
            RadioEvent::PowerStateChanged(state) => scanner.handle_power_state(state).await,
            RadioEvent::Sightings(sightings) => scanner.handle_sightings(&sightings),
            RadioEvent::Disconnected { address } => {
                let Some(device) = scanner.device_by_address(&address) else {
                    trace!("Disconnect from unknown peripheral {}", address);
                    return;
                };
                let queue = queues.read().get(device.id()).cloned();
                if let Some(queue) = queue {
                    queue.link_lost();
                }
            }
            RadioEvent::Notification {
                address,
                characteristic,
                value,
            } => {
                if !is_button_characteristic(&characteristic) {
                    trace!("Notification on {} from {}", characteristic, address);
                    return;
                }
                let Some(device) = scanner.device_by_address(&address) else {
                    trace!("Button notification from unknown peripheral {}", address);
                    return;
                };
                match value.first().copied().and_then(ButtonPress::from_raw) {
                    Some(press) => {
                        info!("Button {:?} on {}", press, device.id());
                        bus.publish(FinderEvent::ButtonPressed { device, press });
                    }
                    None => debug!("Unrecognised button value {:?} from {}", value, device.id()),
                }
            }
        }
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.driver_handle.get_mut().take() {
            handle.abort();
        }
    }
}
