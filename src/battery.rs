use tracing::debug;

use crate::error::BandError;
use crate::protocol::{
    parse_battery, BatteryReading, BATTERY_CHARACTERISTIC_UUID, SENSOR_SERVICE_UUID,
};
use crate::transport::{require_characteristic, Characteristic, DeviceHandle, Transport};

/// Battery level and charging state. Best effort: nothing in here ever fails
/// the connection.
#[derive(Default)]
pub struct BatteryMonitor {
    characteristic: Option<Characteristic>,
}

impl BatteryMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn characteristic(&self) -> Option<&Characteristic> {
        self.characteristic.as_ref()
    }

    /// Subscribes to battery notifications and reads the current value once.
    pub async fn start(
        &mut self,
        transport: &dyn Transport,
        device: &DeviceHandle,
    ) -> Option<BatteryReading> {
        match self.try_start(transport, device).await {
            Ok(reading) => reading,
            Err(e) => {
                debug!(error = %e, "battery monitor unavailable");
                None
            }
        }
    }

    async fn try_start(
        &mut self,
        transport: &dyn Transport,
        device: &DeviceHandle,
    ) -> Result<Option<BatteryReading>, BandError> {
        let characteristic = require_characteristic(
            transport,
            device,
            SENSOR_SERVICE_UUID,
            BATTERY_CHARACTERISTIC_UUID,
        )
        .await?;

        if !transport.subscribe(device, &characteristic).await? {
            debug!("battery notifications refused");
        }
        self.characteristic = Some(characteristic);

        let value = transport.read(device, &characteristic).await?;
        Ok(self.decode(&value))
    }

    pub fn on_notification(&self, value: &[u8]) -> Option<BatteryReading> {
        if self.characteristic.is_none() {
            return None;
        }
        self.decode(value)
    }

    pub fn release(&mut self) {
        self.characteristic = None;
    }

    fn decode(&self, value: &[u8]) -> Option<BatteryReading> {
        let reading = parse_battery(value);
        if reading.is_none() {
            debug!(?value, "ignoring short battery frame");
        }
        reading
    }
}
