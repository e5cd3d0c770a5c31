//! Scripted in-memory radio used by the session and manager tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, Semaphore};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::gatt::Service;
use crate::radio::{AdvertisedPeripheral, Advertisement, RadioEvent, RadioLink};

/// One call observed by the fake, recorded for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RadioCall {
    Initialize,
    StartScan,
    StopScan,
    Connect(String),
    Disconnect(String),
    RetrieveServices(String),
    Read(String, Uuid, Uuid),
    Write(String, Uuid, Uuid, Vec<u8>, bool),
    StartNotify(String, Uuid, Uuid),
    StopNotify(String, Uuid, Uuid),
}

/// A peripheral the fake is scripted to serve.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakePeripheral {
    pub services: Vec<Service>,
    /// Values served by reads, keyed by (service, characteristic).
    pub values: HashMap<(Uuid, Uuid), Vec<u8>>,
    /// Characteristics that echo writes back as value updates.
    pub echo: Vec<(Uuid, Uuid)>,
}

/// Holds a gated operation until released, so tests can observe the
/// in-flight window.
pub(crate) struct Gate {
    permits: Arc<Semaphore>,
}

impl Gate {
    pub fn release(&self) {
        self.permits.add_permits(1);
    }
}

#[derive(Default)]
struct Faults {
    connect: HashMap<String, String>,
    discovery: HashMap<String, String>,
    start_notify: bool,
    stop_notify: bool,
}

pub(crate) struct FakeRadio {
    peripherals: RwLock<HashMap<String, FakePeripheral>>,
    calls: Mutex<Vec<RadioCall>>,
    event_tx: broadcast::Sender<RadioEvent>,
    connect_gate: RwLock<Option<Arc<Semaphore>>>,
    discovery_gate: RwLock<Option<Arc<Semaphore>>>,
    read_gate: RwLock<Option<Arc<Semaphore>>>,
    faults: RwLock<Faults>,
    available: RwLock<bool>,
}

impl FakeRadio {
    pub fn new() -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            peripherals: RwLock::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            event_tx,
            connect_gate: RwLock::new(None),
            discovery_gate: RwLock::new(None),
            read_gate: RwLock::new(None),
            faults: RwLock::new(Faults::default()),
            available: RwLock::new(true),
        })
    }

    pub fn add_peripheral(&self, device_id: &str, peripheral: FakePeripheral) {
        self.peripherals
            .write()
            .insert(device_id.to_string(), peripheral);
    }

    pub fn set_value(&self, device_id: &str, service: Uuid, characteristic: Uuid, value: &[u8]) {
        if let Some(peripheral) = self.peripherals.write().get_mut(device_id) {
            peripheral
                .values
                .insert((service, characteristic), value.to_vec());
        }
    }

    pub fn calls(&self) -> Vec<RadioCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: RadioCall) {
        self.calls.lock().push(call);
    }

    /// Makes subsequent connects block until the returned gate is released.
    pub fn hold_connects(&self) -> Gate {
        let permits = Arc::new(Semaphore::new(0));
        *self.connect_gate.write() = Some(permits.clone());
        Gate { permits }
    }

    /// Makes subsequent discoveries block until the returned gate is released.
    pub fn hold_discoveries(&self) -> Gate {
        let permits = Arc::new(Semaphore::new(0));
        *self.discovery_gate.write() = Some(permits.clone());
        Gate { permits }
    }

    /// Makes subsequent reads block until the returned gate is released.
    pub fn hold_reads(&self) -> Gate {
        let permits = Arc::new(Semaphore::new(0));
        *self.read_gate.write() = Some(permits.clone());
        Gate { permits }
    }

    pub fn fail_connect(&self, device_id: &str, reason: &str) {
        self.faults
            .write()
            .connect
            .insert(device_id.to_string(), reason.to_string());
    }

    pub fn fail_discovery(&self, device_id: &str, reason: &str) {
        self.faults
            .write()
            .discovery
            .insert(device_id.to_string(), reason.to_string());
    }

    pub fn fail_start_notify(&self, enabled: bool) {
        self.faults.write().start_notify = enabled;
    }

    pub fn fail_stop_notify(&self, enabled: bool) {
        self.faults.write().stop_notify = enabled;
    }

    pub fn set_available(&self, available: bool) {
        *self.available.write() = available;
    }

    pub fn emit(&self, event: RadioEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn emit_discovery(&self, device_id: &str, name: Option<&str>, rssi: Option<i16>) {
        self.emit(RadioEvent::PeripheralDiscovered(AdvertisedPeripheral {
            id: device_id.to_string(),
            name: name.map(str::to_string),
            rssi,
            advertisement: Advertisement::default(),
        }));
    }

    pub fn emit_value(&self, device_id: &str, service: Uuid, characteristic: Uuid, value: &[u8]) {
        self.emit(RadioEvent::CharacteristicValueUpdated {
            device_id: device_id.to_string(),
            service,
            characteristic,
            value: Bytes::copy_from_slice(value),
        });
    }

    pub fn emit_disconnect(&self, device_id: &str) {
        self.emit(RadioEvent::PeripheralDisconnected {
            device_id: device_id.to_string(),
        });
    }

    async fn wait_for(gate: &RwLock<Option<Arc<Semaphore>>>) {
        let permits = gate.read().clone();
        if let Some(permits) = permits {
            if let Ok(permit) = permits.acquire().await {
                permit.forget();
            }
        }
    }
}

#[async_trait]
impl RadioLink for FakeRadio {
    async fn initialize(&self) -> Result<()> {
        self.record(RadioCall::Initialize);
        Ok(())
    }

    async fn is_available(&self) -> bool {
        *self.available.read()
    }

    async fn start_scan(&self) -> Result<()> {
        self.record(RadioCall::StartScan);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(RadioCall::StopScan);
        self.emit(RadioEvent::ScanStopped);
        Ok(())
    }

    async fn connect(&self, device_id: &str) -> Result<()> {
        self.record(RadioCall::Connect(device_id.to_string()));
        Self::wait_for(&self.connect_gate).await;

        if let Some(reason) = self.faults.read().connect.get(device_id) {
            return Err(Error::Radio(reason.clone()));
        }
        if !self.peripherals.read().contains_key(device_id) {
            return Err(Error::DeviceNotFound {
                device_id: device_id.to_string(),
            });
        }
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<()> {
        self.record(RadioCall::Disconnect(device_id.to_string()));
        Ok(())
    }

    async fn retrieve_services(&self, device_id: &str) -> Result<Vec<Service>> {
        self.record(RadioCall::RetrieveServices(device_id.to_string()));
        Self::wait_for(&self.discovery_gate).await;

        if let Some(reason) = self.faults.read().discovery.get(device_id) {
            return Err(Error::Radio(reason.clone()));
        }
        match self.peripherals.read().get(device_id) {
            Some(peripheral) => Ok(peripheral.services.clone()),
            None => Err(Error::DeviceNotFound {
                device_id: device_id.to_string(),
            }),
        }
    }

    async fn read(&self, device_id: &str, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        self.record(RadioCall::Read(
            device_id.to_string(),
            service,
            characteristic,
        ));
        Self::wait_for(&self.read_gate).await;

        self.peripherals
            .read()
            .get(device_id)
            .and_then(|p| p.values.get(&(service, characteristic)))
            .cloned()
            .ok_or_else(|| Error::Radio(format!("no scripted value for {characteristic}")))
    }

    async fn write(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
        with_response: bool,
    ) -> Result<()> {
        self.record(RadioCall::Write(
            device_id.to_string(),
            service,
            characteristic,
            payload.to_vec(),
            with_response,
        ));
        let echoes = self
            .peripherals
            .read()
            .get(device_id)
            .map(|p| p.echo.contains(&(service, characteristic)))
            .unwrap_or(false);
        if echoes {
            self.emit_value(device_id, service, characteristic, payload);
        }
        Ok(())
    }

    async fn start_notify(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        self.record(RadioCall::StartNotify(
            device_id.to_string(),
            service,
            characteristic,
        ));
        if self.faults.read().start_notify {
            return Err(Error::Radio("notify enable refused".to_string()));
        }
        Ok(())
    }

    async fn stop_notify(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        self.record(RadioCall::StopNotify(
            device_id.to_string(),
            service,
            characteristic,
        ));
        if self.faults.read().stop_notify {
            return Err(Error::Radio("notify disable refused".to_string()));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RadioEvent> {
        self.event_tx.subscribe()
    }
}
