use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::TransportError;

/// A peripheral the transport has resolved and connected to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub address: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Service {
    pub uuid: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Characteristic {
    pub service: Uuid,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Notification { characteristic: Uuid, value: Vec<u8> },
    ConnectionChanged(ConnectionState),
}

/// GATT access the device session needs. Implemented over btleplug in
/// [`crate::ble`] and by the simulated band in [`crate::fake`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn resolve(&self, address: &str) -> Result<DeviceHandle, TransportError>;

    async fn discover_service(
        &self,
        device: &DeviceHandle,
        service: Uuid,
    ) -> Result<Option<Service>, TransportError>;

    async fn discover_characteristic(
        &self,
        device: &DeviceHandle,
        service: &Service,
        characteristic: Uuid,
    ) -> Result<Option<Characteristic>, TransportError>;

    /// Enables notifications. `Ok(false)` means the characteristic refused.
    async fn subscribe(
        &self,
        device: &DeviceHandle,
        characteristic: &Characteristic,
    ) -> Result<bool, TransportError>;

    async fn write(
        &self,
        device: &DeviceHandle,
        characteristic: &Characteristic,
        value: &[u8],
    ) -> Result<(), TransportError>;

    async fn read(
        &self,
        device: &DeviceHandle,
        characteristic: &Characteristic,
    ) -> Result<Vec<u8>, TransportError>;

    /// Notifications and connection changes for `device`, in arrival order.
    async fn events(
        &self,
        device: &DeviceHandle,
    ) -> Result<BoxStream<'static, TransportEvent>, TransportError>;

    async fn release(&self, device: &DeviceHandle) -> Result<(), TransportError>;
}

/// Discovers `service` then `characteristic`, failing if either is missing.
pub async fn require_characteristic(
    transport: &dyn Transport,
    device: &DeviceHandle,
    service: Uuid,
    characteristic: Uuid,
) -> Result<Characteristic, TransportError> {
    let service = transport
        .discover_service(device, service)
        .await?
        .ok_or(TransportError::ServiceNotFound(service))?;

    transport
        .discover_characteristic(device, &service, characteristic)
        .await?
        .ok_or(TransportError::CharacteristicNotFound(characteristic))
}

/// Like [`require_characteristic`] but a missing service or characteristic is `None`.
pub async fn find_characteristic(
    transport: &dyn Transport,
    device: &DeviceHandle,
    service: Uuid,
    characteristic: Uuid,
) -> Result<Option<Characteristic>, TransportError> {
    let Some(service) = transport.discover_service(device, service).await? else {
        return Ok(None);
    };

    transport
        .discover_characteristic(device, &service, characteristic)
        .await
}
