//! btleplug-backed radio transport.
//!
//! Adapts the system Bluetooth adapter to [`RadioLink`]: central events are
//! translated into typed [`RadioEvent`]s, peripheral handles are cached by
//! identifier, and one task per connected peripheral forwards its
//! notification stream.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::gatt::{Characteristic, CharacteristicProperties, Service};
use crate::radio::{AdvertisedPeripheral, Advertisement, RadioEvent, RadioLink};

impl From<btleplug::Error> for Error {
    fn from(e: btleplug::Error) -> Self {
        Error::Radio(e.to_string())
    }
}

fn properties_from_flags(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

type PeripheralMap = Arc<RwLock<HashMap<String, Peripheral>>>;
type PumpMap = Arc<RwLock<HashMap<String, JoinHandle<()>>>>;

/// [`RadioLink`] implementation over the system Bluetooth adapter.
pub struct BtleRadio {
    adapter: Adapter,
    peripherals: PeripheralMap,
    event_tx: broadcast::Sender<RadioEvent>,
    event_pump: RwLock<Option<JoinHandle<()>>>,
    notify_pumps: PumpMap,
    powered: Arc<RwLock<bool>>,
}

impl BtleRadio {
    /// Acquires the first Bluetooth adapter on the system.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await.map_err(|_| Error::RadioUnavailable)?;
        let adapters = manager.adapters().await?;
        let adapter = adapters.into_iter().next().ok_or(Error::RadioUnavailable)?;

        if let Ok(info) = adapter.adapter_info().await {
            info!("Using Bluetooth adapter: {}", info);
        }

        Ok(Self::with_adapter(adapter))
    }

    /// Builds the transport over a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            event_pump: RwLock::new(None),
            notify_pumps: Arc::new(RwLock::new(HashMap::new())),
            powered: Arc::new(RwLock::new(true)),
        }
    }

    fn peripheral(&self, device_id: &str) -> Result<Peripheral> {
        self.peripherals
            .read()
            .get(device_id)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                device_id: device_id.to_string(),
            })
    }

    fn find_characteristic(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(Peripheral, btleplug::api::Characteristic)> {
        let peripheral = self.peripheral(device_id)?;
        let target = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic);
        match target {
            Some(target) => Ok((peripheral, target)),
            None => Err(Error::UnknownCharacteristic {
                uuid: characteristic,
            }),
        }
    }

    fn ensure_event_pump(&self) {
        let mut pump = self.event_pump.write();
        if pump.is_some() {
            debug!("Central event pump already running");
            return;
        }

        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();
        let notify_pumps = self.notify_pumps.clone();
        let event_tx = self.event_tx.clone();
        let powered = self.powered.clone();

        *pump = Some(tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to get adapter event stream: {}", e);
                    return;
                }
            };
            while let Some(event) = events.next().await {
                Self::handle_central_event(
                    event,
                    &adapter,
                    &peripherals,
                    &notify_pumps,
                    &event_tx,
                    &powered,
                )
                .await;
            }
            debug!("Central event stream ended");
        }));
    }

    async fn handle_central_event(
        event: CentralEvent,
        adapter: &Adapter,
        peripherals: &PeripheralMap,
        notify_pumps: &PumpMap,
        event_tx: &broadcast::Sender<RadioEvent>,
        powered: &Arc<RwLock<bool>>,
    ) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                Self::process_sighting(adapter, id, peripherals, event_tx).await;
            }
            // Advertisement payload events may carry a fresher name or RSSI.
            CentralEvent::ManufacturerDataAdvertisement { id, .. }
            | CentralEvent::ServiceDataAdvertisement { id, .. }
            | CentralEvent::ServicesAdvertisement { id, .. } => {
                Self::process_sighting(adapter, id, peripherals, event_tx).await;
            }
            CentralEvent::DeviceConnected(id) => {
                debug!("Device connected: {}", id);
            }
            CentralEvent::DeviceDisconnected(id) => {
                let device_id = id.to_string();
                debug!("Device disconnected: {}", device_id);
                if let Some(pump) = notify_pumps.write().remove(&device_id) {
                    pump.abort();
                }
                let _ = event_tx.send(RadioEvent::PeripheralDisconnected { device_id });
            }
            CentralEvent::StateUpdate(state) => {
                debug!("Adapter state update: {:?}", state);
                *powered.write() = !matches!(state, CentralState::PoweredOff);
            }
        }
    }

    async fn process_sighting(
        adapter: &Adapter,
        id: PeripheralId,
        peripherals: &PeripheralMap,
        event_tx: &broadcast::Sender<RadioEvent>,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                trace!("Failed to get peripheral {}: {}", id, e);
                return;
            }
        };
        let properties = match peripheral.properties().await {
            Ok(Some(properties)) => properties,
            _ => return,
        };

        let device_id = id.to_string();
        peripherals.write().insert(device_id.clone(), peripheral);

        let _ = event_tx.send(RadioEvent::PeripheralDiscovered(AdvertisedPeripheral {
            id: device_id,
            name: properties.local_name,
            rssi: properties.rssi,
            advertisement: Advertisement {
                manufacturer_data: properties.manufacturer_data,
                services: properties.services,
                service_data: properties.service_data,
            },
        }));
    }

    /// Spawns the notification forwarder for a peripheral, once per device.
    fn ensure_notify_pump(&self, device_id: &str, peripheral: &Peripheral) {
        let mut pumps = self.notify_pumps.write();
        if pumps.contains_key(device_id) {
            return;
        }

        let owned_id = device_id.to_string();
        let peripheral = peripheral.clone();
        let event_tx = self.event_tx.clone();

        pumps.insert(
            device_id.to_string(),
            tokio::spawn(async move {
                let mut notifications = match peripheral.notifications().await {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!("Failed to get notification stream for {}: {}", owned_id, e);
                        return;
                    }
                };
                while let Some(notification) = notifications.next().await {
                    // The stream names only the characteristic; resolve its
                    // service from the discovered set.
                    let service = peripheral
                        .characteristics()
                        .into_iter()
                        .find(|c| c.uuid == notification.uuid)
                        .map(|c| c.service_uuid);
                    let Some(service) = service else {
                        trace!(
                            "Notification from unknown characteristic {}",
                            notification.uuid
                        );
                        continue;
                    };
                    let _ = event_tx.send(RadioEvent::CharacteristicValueUpdated {
                        device_id: owned_id.clone(),
                        service,
                        characteristic: notification.uuid,
                        value: Bytes::from(notification.value),
                    });
                }
                debug!("Notification stream ended for {}", owned_id);
            }),
        );
    }
}

#[async_trait]
impl RadioLink for BtleRadio {
    async fn initialize(&self) -> Result<()> {
        match self.adapter.adapter_info().await {
            Ok(info) => debug!("Adapter ready: {}", info),
            Err(e) => warn!("Adapter info unavailable: {}", e),
        }
        self.ensure_event_pump();
        Ok(())
    }

    async fn is_available(&self) -> bool {
        *self.powered.read()
    }

    async fn start_scan(&self) -> Result<()> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        debug!("Scan started");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        // btleplug has no central event for this, so report it ourselves.
        let _ = self.event_tx.send(RadioEvent::ScanStopped);
        Ok(())
    }

    async fn connect(&self, device_id: &str) -> Result<()> {
        let peripheral = self.peripheral(device_id)?;
        if peripheral.is_connected().await.unwrap_or(false) {
            debug!("Peripheral {} already connected at radio level", device_id);
        } else {
            peripheral.connect().await?;
        }
        self.ensure_notify_pump(device_id, &peripheral);
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<()> {
        let peripheral = self.peripheral(device_id)?;
        if let Some(pump) = self.notify_pumps.write().remove(device_id) {
            pump.abort();
        }
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn retrieve_services(&self, device_id: &str) -> Result<Vec<Service>> {
        let peripheral = self.peripheral(device_id)?;
        peripheral.discover_services().await?;

        let mut services = Vec::new();
        for service in peripheral.services() {
            let characteristics = service
                .characteristics
                .iter()
                .map(|c| Characteristic {
                    uuid: c.uuid,
                    properties: properties_from_flags(c.properties),
                    descriptors: c.descriptors.iter().map(|d| d.uuid).collect(),
                })
                .collect();
            services.push(Service {
                uuid: service.uuid,
                characteristics,
            });
        }
        debug!("Discovered {} services on {}", services.len(), device_id);
        Ok(services)
    }

    async fn read(&self, device_id: &str, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        let (peripheral, target) = self.find_characteristic(device_id, service, characteristic)?;
        let data = peripheral.read(&target).await?;
        trace!("Read {} bytes from {}", data.len(), characteristic);
        Ok(data)
    }

    async fn write(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let (peripheral, target) = self.find_characteristic(device_id, service, characteristic)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        peripheral.write(&target, payload, write_type).await?;
        trace!("Wrote {} bytes to {}", payload.len(), characteristic);
        Ok(())
    }

    async fn start_notify(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        let (peripheral, target) = self.find_characteristic(device_id, service, characteristic)?;
        peripheral.subscribe(&target).await?;
        debug!("Subscribed to {} on {}", characteristic, device_id);
        Ok(())
    }

    async fn stop_notify(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        let (peripheral, target) = self.find_characteristic(device_id, service, characteristic)?;
        peripheral.unsubscribe(&target).await?;
        debug!("Unsubscribed from {} on {}", characteristic, device_id);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RadioEvent> {
        self.event_tx.subscribe()
    }
}

impl Drop for BtleRadio {
    fn drop(&mut self) {
        if let Some(pump) = self.event_pump.write().take() {
            pump.abort();
        }
        for (_, pump) in self.notify_pumps.write().drain() {
            pump.abort();
        }
    }
}
