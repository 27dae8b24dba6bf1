//! btleplug-backed radio.
//!
//! Implements [`RadioAdapter`] over the first Bluetooth adapter reported by
//! the system. A single pump task turns btleplug central events into
//! [`RadioEvent`]s, and each live link gets a notification task that forwards
//! characteristic notifications onto the same stream.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::adapter::{PowerState, RadioAdapter, RadioEvent, ScanMode, Sighting};
use crate::ble::uuids::{is_button_characteristic, GattCharacteristic, APPLE_MANUFACTURER_ID};
use crate::error::{Error, Result};

/// Characteristics discovered on a connected peripheral, by UUID.
type CharacteristicCache = HashMap<Uuid, Characteristic>;

/// Radio backed by the platform Bluetooth stack through btleplug.
pub struct BtleplugRadio {
    /// The BLE adapter.
    adapter: Adapter,
    /// Last reported power state.
    power_state: Arc<RwLock<PowerState>>,
    /// Peripherals seen so far, by address.
    peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
    /// Characteristics of connected peripherals, by address.
    characteristics: Arc<RwLock<HashMap<String, CharacteristicCache>>>,
    /// Notification listener tasks, by address.
    listeners: Arc<RwLock<HashMap<String, JoinHandle<()>>>>,
    /// Radio notification stream.
    event_tx: broadcast::Sender<RadioEvent>,
    /// Central event pump.
    pump_handle: RwLock<Option<JoinHandle<()>>>,
}

impl BtleplugRadio {
    /// Open the first Bluetooth adapter on this system.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotPoweredOn`] if no adapter is available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await.map_err(|_e| Error::NotPoweredOn)?;

        let adapters = manager.adapters().await?;

        let adapter = adapters.into_iter().next().ok_or(Error::NotPoweredOn)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Self::with_adapter(adapter).await
    }

    /// Use a specific adapter.
    pub async fn with_adapter(adapter: Adapter) -> Result<Self> {
        let (event_tx, _) = broadcast::channel(256);

        let radio = Self {
            adapter,
            // btleplug only hands out adapters that are present; state
            // updates arrive through the central event stream.
            power_state: Arc::new(RwLock::new(PowerState::PoweredOn)),
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            characteristics: Arc::new(RwLock::new(HashMap::new())),
            listeners: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            pump_handle: RwLock::new(None),
        };

        radio.start_pump().await?;

        Ok(radio)
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn start_pump(&self) -> Result<()> {
        let mut events = self.adapter.events().await?;

        let adapter = self.adapter.clone();
        let power_state = self.power_state.clone();
        let peripherals = self.peripherals.clone();
        let characteristics = self.characteristics.clone();
        let listeners = self.listeners.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        trace!("Device advertised: {:?}", id);
                        Self::process_peripheral(&adapter, id, &peripherals, &event_tx).await;
                    }
                    CentralEvent::ManufacturerDataAdvertisement {
                        id,
                        manufacturer_data,
                    } => {
                        if manufacturer_data.contains_key(&APPLE_MANUFACTURER_ID) {
                            Self::process_peripheral(&adapter, id, &peripherals, &event_tx).await;
                        }
                    }
                    CentralEvent::DeviceConnected(id) => {
                        debug!("Device connected: {:?}", id);
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let address = id.to_string();
                        debug!("Device disconnected: {}", address);

                        characteristics.write().remove(&address);
                        if let Some(listener) = listeners.write().remove(&address) {
                            listener.abort();
                        }

                        let _ = event_tx.send(RadioEvent::Disconnected { address });
                    }
                    CentralEvent::StateUpdate(state) => {
                        let new_state = match state {
                            CentralState::PoweredOn => PowerState::PoweredOn,
                            CentralState::PoweredOff => PowerState::PoweredOff,
                            CentralState::Unknown => PowerState::Unknown,
                        };
                        info!("Radio power state: {:?}", new_state);
                        *power_state.write() = new_state;
                        let _ = event_tx.send(RadioEvent::PowerStateChanged(new_state));
                    }
                    _ => {}
                }
            }

            debug!("Central event stream ended");
        });

        *self.pump_handle.write() = Some(handle);

        Ok(())
    }

    /// Turn an advertising peripheral into a sighting.
    async fn process_peripheral(
        adapter: &Adapter,
        id: PeripheralId,
        peripherals: &Arc<RwLock<HashMap<String, Peripheral>>>,
        event_tx: &broadcast::Sender<RadioEvent>,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        // Finder devices only ever advertise as iBeacons
        if !properties
            .manufacturer_data
            .contains_key(&APPLE_MANUFACTURER_ID)
        {
            return;
        }

        let Some(rssi) = properties.rssi else {
            return;
        };

        let address = id.to_string();
        peripherals.write().insert(address.clone(), peripheral);

        let sighting = Sighting {
            address,
            rssi,
            manufacturer_data: properties.manufacturer_data,
            services: properties.services,
        };

        let _ = event_tx.send(RadioEvent::Sightings(vec![sighting]));
    }

    fn peripheral(&self, address: &str) -> Result<Peripheral> {
        self.peripherals
            .read()
            .get(address)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                identifier: address.to_string(),
            })
    }

    fn characteristic(
        &self,
        address: &str,
        characteristic: &GattCharacteristic,
    ) -> Result<Characteristic> {
        self.characteristics
            .read()
            .get(address)
            .ok_or(Error::NotConnected)?
            .get(&characteristic.uuid)
            .cloned()
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: characteristic.uuid.to_string(),
            })
    }

    /// Forward characteristic notifications from a live link.
    async fn start_notifications(&self, address: &str, peripheral: &Peripheral) -> Result<()> {
        let mut notifications = peripheral.notifications().await?;

        let services: HashMap<Uuid, Uuid> = self
            .characteristics
            .read()
            .get(address)
            .map(|chars| {
                chars
                    .values()
                    .map(|c| (c.uuid, c.service_uuid))
                    .collect()
            })
            .unwrap_or_default();

        let event_tx = self.event_tx.clone();
        let owner = address.to_string();

        let handle = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let Some(service) = services.get(&notification.uuid) else {
                    trace!("Notification from uncached characteristic {}", notification.uuid);
                    continue;
                };

                trace!(
                    "Notification from {}: {} bytes",
                    notification.uuid,
                    notification.value.len()
                );

                let _ = event_tx.send(RadioEvent::Notification {
                    address: owner.clone(),
                    characteristic: GattCharacteristic::new(*service, notification.uuid),
                    value: Bytes::from(notification.value),
                });
            }
            debug!("Notification listener for {} stopped", owner);
        });

        if let Some(previous) = self.listeners.write().insert(address.to_string(), handle) {
            previous.abort();
        }

        Ok(())
    }
}

#[async_trait]
impl RadioAdapter for BtleplugRadio {
    fn power_state(&self) -> PowerState {
        *self.power_state.read()
    }

    async fn enable(&self) -> Result<()> {
        if self.power_state().is_powered_on() {
            return Ok(());
        }
        // The platform owns the power switch; a state update arrives once the
        // user turns Bluetooth on.
        warn!("Bluetooth is off and cannot be enabled programmatically; waiting for power on");
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<RadioEvent> {
        self.event_tx.subscribe()
    }

    async fn start_scan(&self, mode: ScanMode) -> Result<()> {
        info!("Starting BLE scan ({})", mode);
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        info!("Stopping BLE scan");
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<()> {
        let peripheral = self.peripheral(address)?;

        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral.connect().await?;
        }

        if let Err(e) = peripheral.discover_services().await {
            warn!("Failed to discover services on {}: {}", address, e);
        }

        let mut cache = CharacteristicCache::new();
        for service in peripheral.services() {
            for characteristic in service.characteristics {
                trace!(
                    "Found characteristic: {} in service {}",
                    characteristic.uuid,
                    service.uuid
                );
                cache.insert(characteristic.uuid, characteristic);
            }
        }
        debug!("Discovered {} characteristics on {}", cache.len(), address);

        let buttons: Vec<Characteristic> = cache
            .values()
            .filter(|c| is_button_characteristic(&GattCharacteristic::new(c.service_uuid, c.uuid)))
            .cloned()
            .collect();

        self.characteristics
            .write()
            .insert(address.to_string(), cache);

        for button in &buttons {
            if let Err(e) = peripheral.subscribe(button).await {
                warn!("Failed to subscribe to button on {}: {}", address, e);
            }
        }

        if let Err(e) = self.start_notifications(address, &peripheral).await {
            error!("Failed to start notifications on {}: {}", address, e);
        }

        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        let peripheral = self.peripheral(address)?;

        if let Some(listener) = self.listeners.write().remove(address) {
            listener.abort();
        }
        self.characteristics.write().remove(address);

        peripheral.disconnect().await?;
        Ok(())
    }

    async fn read(&self, address: &str, characteristic: &GattCharacteristic) -> Result<Bytes> {
        let peripheral = self.peripheral(address)?;
        let target = self.characteristic(address, characteristic)?;

        let data = peripheral.read(&target).await?;
        trace!("Read {} bytes from {}", data.len(), characteristic);

        Ok(Bytes::from(data))
    }

    async fn write(
        &self,
        address: &str,
        characteristic: &GattCharacteristic,
        value: &[u8],
    ) -> Result<()> {
        let peripheral = self.peripheral(address)?;
        let target = self.characteristic(address, characteristic)?;

        peripheral
            .write(&target, value, WriteType::WithResponse)
            .await?;
        trace!("Wrote {} bytes to {}", value.len(), characteristic);

        Ok(())
    }
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        if let Some(handle) = self.pump_handle.write().take() {
            handle.abort();
        }
        for (_, listener) in self.listeners.write().drain() {
            listener.abort();
        }
    }
}
