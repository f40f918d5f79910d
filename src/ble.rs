//! [`Transport`] over the system bluetooth stack.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, CharPropFlags, Characteristic as GattCharacteristic,
    Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::TransportError;
use crate::transport::{
    Characteristic, ConnectionState, DeviceHandle, Service, Transport, TransportEvent,
};

const SCAN_POLL: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

pub struct BleTransport {
    adapter: Adapter,
    scan_timeout: Duration,
    peripherals: Mutex<HashMap<String, PlatformPeripheral>>,
}

impl BleTransport {
    /// Uses the first adapter the system reports.
    pub async fn new(scan_timeout: Duration) -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter_list = manager.adapters().await?;

        for adapter in adapter_list.iter() {
            let info = adapter
                .adapter_info()
                .await
                .unwrap_or_else(|_| "unnamed adapter".to_string());
            debug!(adapter = %info, "found bluetooth adapter");
        }

        let adapter = adapter_list
            .into_iter()
            .next()
            .ok_or(TransportError::AdapterNotFound)?;

        Ok(BleTransport {
            adapter,
            scan_timeout,
            peripherals: Mutex::new(HashMap::new()),
        })
    }

    /// Scans until a peripheral advertising `address` (or that name) shows
    /// up. Discovered peripherals may be stale, so connecting can still fail.
    async fn get_peripheral(&self, address: &str) -> Result<PlatformPeripheral, TransportError> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        info!(%address, timeout = ?self.scan_timeout, "scanning");

        let found = timeout(self.scan_timeout, async {
            loop {
                for peripheral in self.adapter.peripherals().await? {
                    if matches_address(&peripheral, address).await {
                        return Ok::<_, TransportError>(peripheral);
                    }
                }
                sleep(SCAN_POLL).await;
            }
        })
        .await;

        if let Err(e) = self.adapter.stop_scan().await {
            debug!(error = %e, "failed to stop scan");
        }

        match found {
            Ok(peripheral) => peripheral,
            Err(_) => Err(TransportError::DeviceNotFound(address.to_string())),
        }
    }

    fn peripheral(&self, device: &DeviceHandle) -> Result<PlatformPeripheral, TransportError> {
        self.peripherals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&device.address)
            .cloned()
            .ok_or_else(|| TransportError::NotConnected(device.address.clone()))
    }

    fn gatt_characteristic(
        peripheral: &PlatformPeripheral,
        characteristic: &Characteristic,
    ) -> Result<GattCharacteristic, TransportError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service)
            .ok_or(TransportError::CharacteristicNotFound(characteristic.uuid))
    }
}

fn peripheral_key(peripheral: &PlatformPeripheral) -> String {
    let address = peripheral.address();
    // some platforms hide the MAC
    if address == BDAddr::default() {
        peripheral.id().to_string()
    } else {
        address.to_string()
    }
}

async fn get_peripheral_name(peripheral: &PlatformPeripheral) -> Option<String> {
    let Ok(Some(properties)) = peripheral.properties().await else {
        return None;
    };

    properties.local_name
}

async fn matches_address(peripheral: &PlatformPeripheral, address: &str) -> bool {
    if peripheral_key(peripheral).eq_ignore_ascii_case(address) {
        return true;
    }
    get_peripheral_name(peripheral).await.as_deref() == Some(address)
}

#[async_trait]
impl Transport for BleTransport {
    #[instrument(skip(self))]
    async fn resolve(&self, address: &str) -> Result<DeviceHandle, TransportError> {
        let peripheral = self.get_peripheral(address).await?;
        let name = get_peripheral_name(&peripheral).await;

        if !peripheral.is_connected().await? {
            timeout(CONNECT_TIMEOUT, peripheral.connect())
                .await
                .map_err(|_| TransportError::Timeout("connecting"))??;
        }
        timeout(DISCOVERY_TIMEOUT, peripheral.discover_services())
            .await
            .map_err(|_| TransportError::Timeout("discovering services"))??;

        let device = DeviceHandle {
            address: peripheral_key(&peripheral),
            name,
        };
        info!(address = %device.address, name = ?device.name, "connected");

        self.peripherals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(device.address.clone(), peripheral);
        Ok(device)
    }

    async fn discover_service(
        &self,
        device: &DeviceHandle,
        service: Uuid,
    ) -> Result<Option<Service>, TransportError> {
        let peripheral = self.peripheral(device)?;
        Ok(peripheral
            .services()
            .iter()
            .find(|s| s.uuid == service)
            .map(|s| Service { uuid: s.uuid }))
    }

    async fn discover_characteristic(
        &self,
        device: &DeviceHandle,
        service: &Service,
        characteristic: Uuid,
    ) -> Result<Option<Characteristic>, TransportError> {
        let peripheral = self.peripheral(device)?;
        let found = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service.uuid)
            .and_then(|s| s.characteristics.into_iter().find(|c| c.uuid == characteristic));

        Ok(found.map(|c| Characteristic {
            service: c.service_uuid,
            uuid: c.uuid,
        }))
    }

    async fn subscribe(
        &self,
        device: &DeviceHandle,
        characteristic: &Characteristic,
    ) -> Result<bool, TransportError> {
        let peripheral = self.peripheral(device)?;
        let gatt = Self::gatt_characteristic(&peripheral, characteristic)?;

        if !gatt
            .properties
            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
        {
            return Ok(false);
        }
        debug!(characteristic = %gatt.uuid, "subscribing");
        peripheral.subscribe(&gatt).await?;
        Ok(true)
    }

    async fn write(
        &self,
        device: &DeviceHandle,
        characteristic: &Characteristic,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device)?;
        let gatt = Self::gatt_characteristic(&peripheral, characteristic)?;
        let write_type = if gatt.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        debug!(characteristic = %gatt.uuid, ?value, "write");
        peripheral.write(&gatt, value, write_type).await?;
        Ok(())
    }

    async fn read(
        &self,
        device: &DeviceHandle,
        characteristic: &Characteristic,
    ) -> Result<Vec<u8>, TransportError> {
        let peripheral = self.peripheral(device)?;
        let gatt = Self::gatt_characteristic(&peripheral, characteristic)?;
        Ok(peripheral.read(&gatt).await?)
    }

    async fn events(
        &self,
        device: &DeviceHandle,
    ) -> Result<BoxStream<'static, TransportEvent>, TransportError> {
        let peripheral = self.peripheral(device)?;

        let notifications = peripheral.notifications().await?.map(|notification| {
            TransportEvent::Notification {
                characteristic: notification.uuid,
                value: notification.value,
            }
        });

        // the link drop shows up on the adapter, not on the peripheral
        let id = peripheral.id();
        let disconnects = self.adapter.events().await?.filter_map(move |event| {
            let lost = matches!(&event, CentralEvent::DeviceDisconnected(other) if *other == id);
            async move {
                lost.then_some(TransportEvent::ConnectionChanged(
                    ConnectionState::Disconnected,
                ))
            }
        });

        Ok(stream::select(notifications, disconnects).boxed())
    }

    async fn release(&self, device: &DeviceHandle) -> Result<(), TransportError> {
        let removed = self
            .peripherals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&device.address);
        let Some(peripheral) = removed else {
            return Ok(());
        };

        if peripheral.is_connected().await.unwrap_or(false) {
            info!(address = %device.address, "disconnecting");
            if let Err(e) = peripheral.disconnect().await {
                warn!(error = %e, "disconnect failed");
                return Err(e.into());
            }
        }
        Ok(())
    }
}
