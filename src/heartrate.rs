use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BandError, TransportError};
use crate::protocol::*;
use crate::transport::{
    find_characteristic, require_characteristic, Characteristic, DeviceHandle, Transport,
};

pub const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(5);

/// GATT setup and sampling for the heart rate sensor.
#[derive(Default)]
pub struct HeartrateMonitor {
    active: bool,
    continuous: bool,
    sensor: Option<Characteristic>,
    measurement: Option<Characteristic>,
    control: Option<Characteristic>,
    keep_alive: Option<CancellationToken>,
}

impl HeartrateMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_continuous(&self) -> bool {
        self.continuous
    }

    pub fn measurement(&self) -> Option<&Characteristic> {
        self.measurement.as_ref()
    }

    /// Switches measurement on. A no-op when already running. On failure the
    /// monitor stays inactive and holds nothing. If the control point was
    /// reached, both modes are switched off again first.
    pub async fn start(
        &mut self,
        transport: &Arc<dyn Transport>,
        device: &DeviceHandle,
        continuous: bool,
    ) -> Result<(), BandError> {
        if self.active {
            return Ok(());
        }

        self.continuous = continuous;
        if let Err(e) = self.try_start(transport, device).await {
            warn!(error = %e, "heart rate monitor failed to start");
            self.cancel_keep_alive();
            if let Err(off) = self.switch_off(transport.as_ref(), device).await {
                warn!(error = %off, "could not switch measurement off after failed start");
            }
            self.release();
            return Err(e);
        }

        self.active = true;
        info!(continuous, "heart rate monitor started");
        Ok(())
    }

    async fn try_start(
        &mut self,
        transport: &Arc<dyn Transport>,
        device: &DeviceHandle,
    ) -> Result<(), BandError> {
        let t = transport.as_ref();

        self.sensor =
            find_characteristic(t, device, SENSOR_SERVICE_UUID, SENSOR_CHARACTERISTIC_UUID).await?;
        if let Some(sensor) = self.sensor {
            t.write(device, &sensor, &SENSOR_ENABLE).await?;
        }

        let measurement = require_characteristic(
            t,
            device,
            HEART_RATE_SERVICE_UUID,
            HEART_RATE_MEASUREMENT_UUID,
        )
        .await?;
        if !t.subscribe(device, &measurement).await? {
            return Err(TransportError::SubscribeRefused(measurement.uuid).into());
        }
        self.measurement = Some(measurement);

        let control =
            require_characteristic(t, device, HEART_RATE_SERVICE_UUID, HEART_RATE_CONTROL_UUID)
                .await?;
        self.control = Some(control);

        if self.continuous {
            t.write(device, &control, &HEART_RATE_CONTINUOUS_ON).await?;
            self.keep_alive = Some(spawn_keep_alive(transport.clone(), device.clone(), control));
        } else {
            t.write(device, &control, &HEART_RATE_SINGLE_ON).await?;
        }

        if let Some(sensor) = self.sensor {
            t.write(device, &sensor, &SENSOR_CONFIRM).await?;
        }
        Ok(())
    }

    /// Switches both measurement modes off and drops the handles. A no-op
    /// when not running. State is cleared even if a write fails; the first
    /// write error is returned.
    pub async fn stop(
        &mut self,
        transport: &dyn Transport,
        device: &DeviceHandle,
    ) -> Result<(), BandError> {
        if !self.active {
            return Ok(());
        }

        self.cancel_keep_alive();
        let result = self.switch_off(transport, device).await;
        self.release();
        info!("heart rate monitor stopped");
        result
    }

    /// Writes both off frames, even when the first one fails.
    async fn switch_off(
        &self,
        transport: &dyn Transport,
        device: &DeviceHandle,
    ) -> Result<(), BandError> {
        let Some(control) = self.control else {
            return Ok(());
        };

        let mut result = Ok(());
        for frame in [HEART_RATE_CONTINUOUS_OFF, HEART_RATE_SINGLE_OFF] {
            if let Err(e) = transport.write(device, &control, &frame).await {
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }
        result
    }

    /// Drops all state without talking to the band, for when the link is gone.
    pub fn release(&mut self) {
        self.cancel_keep_alive();
        self.sensor = None;
        self.measurement = None;
        self.control = None;
        self.active = false;
    }

    /// Decodes a measurement. Zero means the sensor could not get a reading
    /// and is dropped. In single-shot mode the first valid sample stops the
    /// monitor.
    pub async fn on_notification(
        &mut self,
        transport: &dyn Transport,
        device: &DeviceHandle,
        value: &[u8],
    ) -> Option<u8> {
        if !self.active || self.measurement.is_none() {
            return None;
        }

        let Some(bpm) = parse_heart_rate(value) else {
            warn!(?value, "dropping malformed heart rate notification");
            return None;
        };
        if bpm == 0 {
            debug!("sensor reported no reading");
            return None;
        }

        if !self.continuous {
            if let Err(e) = self.stop(transport, device).await {
                warn!(error = %e, "failed to stop single-shot measurement");
            }
        }
        Some(bpm)
    }

    fn cancel_keep_alive(&mut self) {
        if let Some(token) = self.keep_alive.take() {
            token.cancel();
        }
    }
}

impl Drop for HeartrateMonitor {
    fn drop(&mut self) {
        self.cancel_keep_alive();
    }
}

fn spawn_keep_alive(
    transport: Arc<dyn Transport>,
    device: DeviceHandle,
    control: Characteristic,
) -> CancellationToken {
    let token = CancellationToken::new();
    let cancelled = token.clone();

    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + KEEP_ALIVE_PERIOD, KEEP_ALIVE_PERIOD);
        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancelled.cancelled() => break,
                result = transport.write(&device, &control, &HEART_RATE_KEEP_ALIVE) => {
                    if let Err(e) = result {
                        warn!(error = %e, "keep-alive write failed");
                    }
                }
            }
        }
        debug!("keep-alive ticker stopped");
    });

    token
}
