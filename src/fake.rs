//! In-process band emulator. Answers the auth handshake, reports battery and
//! produces heart rate samples so the whole pipeline can run without hardware.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::stream::{BoxStream, StreamExt};
use rand::{Rng, RngCore};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::crypto::{encrypt_ecb, SessionKey};
use crate::error::TransportError;
use crate::protocol::*;
use crate::transport::{
    Characteristic, ConnectionState, DeviceHandle, Service, Transport, TransportEvent,
};

const SAMPLE_PERIOD: Duration = Duration::from_millis(800);

const SERVICES: [(Uuid, &[Uuid]); 3] = [
    (AUTH_SERVICE_UUID, &[AUTH_CHARACTERISTIC_UUID]),
    (
        SENSOR_SERVICE_UUID,
        &[SENSOR_CHARACTERISTIC_UUID, BATTERY_CHARACTERISTIC_UUID],
    ),
    (
        HEART_RATE_SERVICE_UUID,
        &[HEART_RATE_MEASUREMENT_UUID, HEART_RATE_CONTROL_UUID],
    ),
];

struct BandState {
    address: String,
    name: String,
    connected: bool,
    stored_key: Option<SessionKey>,
    key: Option<SessionKey>,
    challenge: Option<[u8; 16]>,
    battery: Vec<u8>,
    live_heartrate: bool,
    sampler: Option<CancellationToken>,
    listeners: Vec<UnboundedSender<TransportEvent>>,
    subscribed: HashSet<Uuid>,
    missing: HashSet<Uuid>,
    failing_writes: Vec<(Uuid, Vec<u8>)>,
    writes: Vec<(Uuid, Vec<u8>)>,
}

impl BandState {
    fn notify(&mut self, characteristic: Uuid, value: Vec<u8>) {
        if !self.connected || !self.subscribed.contains(&characteristic) {
            return;
        }

        let event = TransportEvent::Notification { characteristic, value };
        self.listeners
            .retain(|listener| listener.unbounded_send(event.clone()).is_ok());
    }

    fn stop_sampler(&mut self) {
        if let Some(token) = self.sampler.take() {
            token.cancel();
        }
    }
}

#[derive(Clone)]
pub struct FakeBand {
    state: Arc<Mutex<BandState>>,
}

impl FakeBand {
    pub fn new(address: &str, name: &str) -> Self {
        FakeBand {
            state: Arc::new(Mutex::new(BandState {
                address: address.to_string(),
                name: name.to_string(),
                connected: false,
                stored_key: None,
                key: None,
                challenge: None,
                battery: vec![0x0f, 80, 0x00],
                live_heartrate: false,
                sampler: None,
                listeners: Vec::new(),
                subscribed: HashSet::new(),
                missing: HashSet::new(),
                failing_writes: Vec::new(),
                writes: Vec::new(),
            })),
        }
    }

    /// Only accept this key during the handshake, like a 4/5 band paired to
    /// a phone.
    pub fn with_stored_key(self, key: SessionKey) -> Self {
        self.lock().stored_key = Some(key);
        self
    }

    /// Emit random samples on its own once measurement is switched on.
    pub fn with_live_heartrate(self) -> Self {
        self.lock().live_heartrate = true;
        self
    }

    pub fn with_battery(self, frame: &[u8]) -> Self {
        self.lock().battery = frame.to_vec();
        self
    }

    /// Hide a service or characteristic from discovery.
    pub fn without(self, uuid: Uuid) -> Self {
        self.lock().missing.insert(uuid);
        self
    }

    /// Later writes of `frame` to `characteristic` are recorded, then fail.
    pub fn fail_write_of(&self, characteristic: Uuid, frame: &[u8]) {
        self.lock()
            .failing_writes
            .push((characteristic, frame.to_vec()));
    }

    pub fn push_notification(&self, characteristic: Uuid, value: &[u8]) {
        self.lock().notify(characteristic, value.to_vec());
    }

    pub fn push_heartrate(&self, bpm: u8) {
        self.push_notification(HEART_RATE_MEASUREMENT_UUID, &[0x00, bpm]);
    }

    pub fn push_battery(&self, frame: &[u8]) {
        self.push_notification(BATTERY_CHARACTERISTIC_UUID, frame);
    }

    /// Simulates the band walking out of range.
    pub fn drop_link(&self) {
        let mut state = self.lock();
        state.stop_sampler();
        let event = TransportEvent::ConnectionChanged(ConnectionState::Disconnected);
        state
            .listeners
            .retain(|listener| listener.unbounded_send(event.clone()).is_ok());
        state.connected = false;
        state.subscribed.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.lock().writes.clone()
    }

    pub fn writes_to(&self, characteristic: Uuid) -> Vec<Vec<u8>> {
        self.lock()
            .writes
            .iter()
            .filter(|(uuid, _)| *uuid == characteristic)
            .map(|(_, value)| value.clone())
            .collect()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    fn lock(&self) -> MutexGuard<'_, BandState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_device(&self, device: &DeviceHandle) -> Result<(), TransportError> {
        let state = self.lock();
        if state.address != device.address || !state.connected {
            return Err(TransportError::NotConnected(device.address.clone()));
        }
        Ok(())
    }

    fn answer_auth(state: &mut BandState, value: &[u8]) {
        let Some((tag, payload)) = value.split_first_chunk::<2>() else {
            return;
        };

        let response = match *tag {
            AUTH_SEND_KEY => {
                let accepted = match (<[u8; 16]>::try_from(payload), &state.stored_key) {
                    (Ok(key), Some(stored)) => stored.as_bytes() == &key,
                    (Ok(_), None) => true,
                    (Err(_), _) => false,
                };
                if accepted {
                    state.key = <[u8; 16]>::try_from(payload).ok().map(SessionKey::from);
                }
                auth_response(0x01, accepted, &[])
            }
            AUTH_REQUEST_RANDOM => {
                let mut challenge = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut challenge);
                state.challenge = Some(challenge);
                auth_response(0x02, true, &challenge)
            }
            AUTH_SEND_RESPONSE => {
                let expected = match (&state.key, &state.challenge) {
                    (Some(key), Some(challenge)) => encrypt_ecb(key, challenge).ok(),
                    _ => None,
                };
                auth_response(0x03, expected.as_deref() == Some(payload), &[])
            }
            _ => return,
        };

        state.notify(AUTH_CHARACTERISTIC_UUID, response);
    }

    fn answer_heartrate_control(&self, state: &mut BandState, value: &[u8]) {
        match value {
            [0x15, 0x01, 0x01] if state.live_heartrate => {
                state.stop_sampler();
                let token = CancellationToken::new();
                state.sampler = Some(token.clone());
                tokio::spawn(transmit_fake_hr_data(self.state.clone(), token));
            }
            [0x15, 0x02, 0x01] if state.live_heartrate => {
                let bpm = rand::thread_rng().gen_range(50..70);
                state.notify(HEART_RATE_MEASUREMENT_UUID, vec![0x00, bpm]);
            }
            [0x15, _, 0x00] => state.stop_sampler(),
            _ => {}
        }
    }
}

fn auth_response(stage: u8, success: bool, payload: &[u8]) -> Vec<u8> {
    let result = if success {
        AUTH_RESULT_SUCCESS
    } else {
        AUTH_RESULT_FAILURE
    };
    let mut frame = vec![AUTH_RESPONSE_MARKER, stage, result];
    frame.extend_from_slice(payload);
    frame
}

async fn transmit_fake_hr_data(state: Arc<Mutex<BandState>>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(SAMPLE_PERIOD);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let random = rand::thread_rng().gen_range(50..70);
                let Ok(mut state) = state.lock() else { break; };
                state.notify(HEART_RATE_MEASUREMENT_UUID, vec![0x00, random]);
            }
        }
    }
}

#[async_trait]
impl Transport for FakeBand {
    async fn resolve(&self, address: &str) -> Result<DeviceHandle, TransportError> {
        let mut state = self.lock();
        if !state.address.eq_ignore_ascii_case(address) && state.name != address {
            return Err(TransportError::DeviceNotFound(address.to_string()));
        }

        state.connected = true;
        Ok(DeviceHandle {
            address: state.address.clone(),
            name: Some(state.name.clone()),
        })
    }

    async fn discover_service(
        &self,
        device: &DeviceHandle,
        service: Uuid,
    ) -> Result<Option<Service>, TransportError> {
        self.check_device(device)?;
        let state = self.lock();
        let found = SERVICES.iter().any(|(uuid, _)| *uuid == service);
        Ok((found && !state.missing.contains(&service)).then_some(Service { uuid: service }))
    }

    async fn discover_characteristic(
        &self,
        device: &DeviceHandle,
        service: &Service,
        characteristic: Uuid,
    ) -> Result<Option<Characteristic>, TransportError> {
        self.check_device(device)?;
        let state = self.lock();
        let found = SERVICES
            .iter()
            .any(|(uuid, chars)| *uuid == service.uuid && chars.contains(&characteristic));
        Ok((found && !state.missing.contains(&characteristic)).then_some(Characteristic {
            service: service.uuid,
            uuid: characteristic,
        }))
    }

    async fn subscribe(
        &self,
        device: &DeviceHandle,
        characteristic: &Characteristic,
    ) -> Result<bool, TransportError> {
        self.check_device(device)?;
        self.lock().subscribed.insert(characteristic.uuid);
        Ok(true)
    }

    async fn write(
        &self,
        device: &DeviceHandle,
        characteristic: &Characteristic,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.check_device(device)?;
        let mut state = self.lock();
        debug!(characteristic = %characteristic.uuid, ?value, "fake band write");
        state.writes.push((characteristic.uuid, value.to_vec()));

        let fails = state
            .failing_writes
            .iter()
            .any(|(uuid, frame)| *uuid == characteristic.uuid && frame == value);
        if fails {
            return Err(TransportError::Timeout("writing"));
        }

        match characteristic.uuid {
            AUTH_CHARACTERISTIC_UUID => Self::answer_auth(&mut state, value),
            HEART_RATE_CONTROL_UUID => self.answer_heartrate_control(&mut state, value),
            _ => {}
        }
        Ok(())
    }

    async fn read(
        &self,
        device: &DeviceHandle,
        characteristic: &Characteristic,
    ) -> Result<Vec<u8>, TransportError> {
        self.check_device(device)?;
        match characteristic.uuid {
            BATTERY_CHARACTERISTIC_UUID => Ok(self.lock().battery.clone()),
            _ => Ok(Vec::new()),
        }
    }

    async fn events(
        &self,
        device: &DeviceHandle,
    ) -> Result<BoxStream<'static, TransportEvent>, TransportError> {
        self.check_device(device)?;
        let (tx, rx) = unbounded();
        self.lock().listeners.push(tx);
        Ok(rx.boxed())
    }

    async fn release(&self, _device: &DeviceHandle) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.stop_sampler();
        state.connected = false;
        state.subscribed.clear();
        state.listeners.clear();
        state.key = None;
        state.challenge = None;
        Ok(())
    }
}
