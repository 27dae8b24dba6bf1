//! Scripted radio and helpers shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use xyfinder_rust_ble::ble::uuids::{GattCharacteristic, APPLE_MANUFACTURER_ID, XY4_FAMILY_UUID};
use xyfinder_rust_ble::{
    DeviceManager, EngineConfig, Error, EventKind, FinderDevice, FinderEvent, IBeacon,
    PowerState, RadioAdapter, RadioEvent, Result, ScanMode, Sighting,
};

/// Delay before a requested disconnect is reported on the event stream.
pub const DISCONNECT_ECHO_DELAY: Duration = Duration::from_millis(5);

/// A radio call, as recorded by [`FakeRadio`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Enable,
    StartScan(ScanMode),
    StopScan,
    Connect(String),
    Disconnect(String),
    Read(GattCharacteristic),
    Write(GattCharacteristic, Vec<u8>),
}

#[derive(Default)]
struct Script {
    connect_delay: Duration,
    connect_error: Option<Error>,
    operation_delay: Duration,
    failing: HashSet<GattCharacteristic>,
    values: HashMap<GattCharacteristic, Bytes>,
}

/// In-memory radio driven by the test.
pub struct FakeRadio {
    power: Mutex<PowerState>,
    events_tx: broadcast::Sender<RadioEvent>,
    calls: Mutex<Vec<Call>>,
    script: Mutex<Script>,
    max_connections: usize,
}

impl FakeRadio {
    pub fn new(power: PowerState) -> Arc<Self> {
        Self::with_max_connections(power, 4)
    }

    pub fn with_max_connections(power: PowerState, max_connections: usize) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            power: Mutex::new(power),
            events_tx,
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(Script::default()),
            max_connections,
        })
    }

    /// Change the power state and notify the engine.
    pub fn set_power(&self, state: PowerState) {
        *self.power.lock() = state;
        self.emit(RadioEvent::PowerStateChanged(state));
    }

    pub fn emit(&self, event: RadioEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn sight(&self, sightings: Vec<Sighting>) {
        self.emit(RadioEvent::Sightings(sightings));
    }

    /// Report that the peripheral dropped the link.
    pub fn drop_link(&self, address: &str) {
        self.emit(RadioEvent::Disconnected {
            address: address.to_string(),
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| predicate(c)).count()
    }

    pub fn set_value(&self, characteristic: GattCharacteristic, value: &'static [u8]) {
        self.script
            .lock()
            .values
            .insert(characteristic, Bytes::from_static(value));
    }

    pub fn fail_on(&self, characteristic: GattCharacteristic) {
        self.script.lock().failing.insert(characteristic);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.script.lock().connect_delay = delay;
    }

    pub fn set_connect_error(&self, error: Option<Error>) {
        self.script.lock().connect_error = error;
    }

    pub fn set_operation_delay(&self, delay: Duration) {
        self.script.lock().operation_delay = delay;
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    async fn operation(&self, characteristic: &GattCharacteristic) -> Result<Bytes> {
        let (delay, failing, value) = {
            let script = self.script.lock();
            (
                script.operation_delay,
                script.failing.contains(characteristic),
                script.values.get(characteristic).cloned(),
            )
        };
        tokio::time::sleep(delay).await;
        if failing {
            return Err(Error::CharacteristicNotFound {
                uuid: characteristic.uuid.to_string(),
            });
        }
        Ok(value.unwrap_or_default())
    }
}

#[async_trait]
impl RadioAdapter for FakeRadio {
    fn power_state(&self) -> PowerState {
        *self.power.lock()
    }

    async fn enable(&self) -> Result<()> {
        self.record(Call::Enable);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<RadioEvent> {
        self.events_tx.subscribe()
    }

    async fn start_scan(&self, mode: ScanMode) -> Result<()> {
        self.record(Call::StartScan(mode));
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(Call::StopScan);
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<()> {
        self.record(Call::Connect(address.to_string()));
        let (delay, error) = {
            let script = self.script.lock();
            (script.connect_delay, script.connect_error.clone())
        };
        tokio::time::sleep(delay).await;
        match error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        self.record(Call::Disconnect(address.to_string()));

        // Like a platform stack, report the requested drop a little later
        let events_tx = self.events_tx.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(DISCONNECT_ECHO_DELAY).await;
            let _ = events_tx.send(RadioEvent::Disconnected { address });
        });
        Ok(())
    }

    async fn read(&self, _address: &str, characteristic: &GattCharacteristic) -> Result<Bytes> {
        self.record(Call::Read(*characteristic));
        self.operation(characteristic).await
    }

    async fn write(
        &self,
        _address: &str,
        characteristic: &GattCharacteristic,
        value: &[u8],
    ) -> Result<()> {
        self.record(Call::Write(*characteristic, value.to_vec()));
        self.operation(characteristic).await.map(|_| ())
    }

    fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A sighting of an iBeacon frame.
pub fn sighting(family: Uuid, major: u16, minor: u16, rssi: i16) -> Sighting {
    let mut manufacturer_data = HashMap::new();
    manufacturer_data.insert(
        APPLE_MANUFACTURER_ID,
        IBeacon::new(family, major, minor).to_bytes(),
    );
    Sighting {
        address: format!("AA:00:00:00:00:{:02X}", major),
        rssi,
        manufacturer_data,
        services: Vec::new(),
    }
}

/// A sighting of an XY4 at power level 4.
pub fn xy4(major: u16, rssi: i16) -> Sighting {
    sighting(XY4_FAMILY_UUID, major, 0x0104, rssi)
}

/// Let the driver and queue tasks catch up.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Every event still buffered on `stream`.
pub fn drain(stream: &mut broadcast::Receiver<FinderEvent>) -> Vec<FinderEvent> {
    std::iter::from_fn(|| stream.try_recv().ok()).collect()
}

pub fn kinds(events: &[FinderEvent]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind()).collect()
}

/// A manager over `radio` that is scanning in the foreground.
pub async fn scanning_manager(radio: Arc<FakeRadio>) -> DeviceManager {
    let manager = DeviceManager::with_radio(radio, EngineConfig::default()).unwrap();
    manager.start_scanning().await.unwrap();
    manager
}

/// Sight an XY4 with `major` and return its device record.
pub async fn sighted(manager: &DeviceManager, radio: &FakeRadio, major: u16) -> Arc<FinderDevice> {
    radio.sight(vec![xy4(major, -60)]);
    settle().await;
    manager
        .ranged_devices()
        .into_iter()
        .find(|d| d.beacon().map(|b| b.major) == Some(major))
        .expect("device should be ranged")
}
