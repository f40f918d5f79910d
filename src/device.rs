//! Per-device session. All session state lives in one actor task; the
//! [`Device`] handle posts commands to it and transport callbacks reach it as
//! a stream, so nothing else ever mutates telemetry.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::{AuthStep, Authenticator, KeyMaterial};
use crate::battery::BatteryMonitor;
use crate::crypto::SessionKey;
use crate::error::{BandError, Result};
use crate::heartrate::HeartrateMonitor;
use crate::protocol::BatteryReading;
use crate::signal::{BandSignal, DeviceStatus, Sample, SignalBus};
use crate::transport::{ConnectionState, DeviceHandle, Transport, TransportEvent};

const COMMAND_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceModel {
    MiBand2_3,
    MiBand4_5,
}

/// Protocol variant of a band, with whatever key material it needs.
#[derive(Debug, Clone)]
pub enum Variant {
    Legacy,
    KeyBased(SessionKey),
}

impl Variant {
    /// Key-based variant from a 32 character hex key. Fails before any I/O.
    pub fn key_based(hex_key: &str) -> Result<Self> {
        SessionKey::from_hex(hex_key)
            .map(Variant::KeyBased)
            .map_err(|e| BandError::Configuration(format!("authentication key: {e}")))
    }

    /// Variant for a band generation (2, 3, 4 or 5).
    pub fn for_band_version(version: u8, auth_key: Option<&str>) -> Result<Self> {
        match version {
            2 | 3 => Ok(Variant::Legacy),
            4 | 5 => {
                let key = auth_key.ok_or_else(|| {
                    BandError::Configuration(format!("Mi Band {version} needs an authentication key"))
                })?;
                Self::key_based(key)
            }
            other => Err(BandError::Configuration(format!(
                "unsupported band version {other}"
            ))),
        }
    }

    pub fn model(&self) -> DeviceModel {
        match self {
            Variant::Legacy => DeviceModel::MiBand2_3,
            Variant::KeyBased(_) => DeviceModel::MiBand4_5,
        }
    }

    fn key_material(&self) -> KeyMaterial {
        match self {
            Variant::Legacy => KeyMaterial::Generate,
            Variant::KeyBased(key) => KeyMaterial::PreShared(key.clone()),
        }
    }
}

/// Current values of a session. Only meaningful while authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub address: String,
    pub name: Option<String>,
    pub model: DeviceModel,
    pub status: DeviceStatus,
    pub heartrate: u8,
    pub min_heartrate: Option<u8>,
    pub max_heartrate: u8,
    pub battery: u8,
    pub is_charging: bool,
    pub monitor_active: bool,
}

impl Snapshot {
    pub fn new(address: String, model: DeviceModel) -> Self {
        Snapshot {
            address,
            name: None,
            model,
            status: DeviceStatus::Offline,
            heartrate: 0,
            min_heartrate: None,
            max_heartrate: 0,
            battery: 0,
            is_charging: false,
            monitor_active: false,
        }
    }

    /// Zero is not a reading. Extremes only ever widen.
    pub fn record_heartrate(&mut self, bpm: u8) -> bool {
        if bpm == 0 {
            return false;
        }
        self.heartrate = bpm;
        self.min_heartrate = Some(self.min_heartrate.map_or(bpm, |min| min.min(bpm)));
        self.max_heartrate = self.max_heartrate.max(bpm);
        true
    }
}

/// What every supported band can do, whatever its protocol variant.
#[async_trait]
pub trait HeartrateDevice {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn authenticate(&self) -> Result<()>;
    async fn start_heartrate_monitor(&self, continuous: bool) -> Result<()>;
    async fn stop_heartrate_monitor(&self) -> Result<()>;
}

type Reply = oneshot::Sender<Result<()>>;

enum Command {
    Connect(Reply),
    Disconnect(Reply),
    Authenticate(Reply),
    StartMonitor { continuous: bool, reply: Reply },
    StopMonitor(Reply),
}

/// Handle to a device session. Cheap to clone; the session disconnects and
/// ends once every handle is dropped.
#[derive(Clone)]
pub struct Device {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Snapshot>,
    bus: SignalBus,
}

impl Device {
    /// Creates an offline session for `address`. Must be called inside a
    /// tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, address: impl Into<String>, variant: Variant) -> Self {
        let address = address.into();
        let (commands, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (state, snapshot) = watch::channel(Snapshot::new(address.clone(), variant.model()));
        let bus = SignalBus::default();

        let session = Session {
            transport,
            address,
            variant,
            handle: None,
            events: None,
            auth: Authenticator::new(),
            monitor: HeartrateMonitor::new(),
            battery: BatteryMonitor::new(),
            state,
            bus: bus.clone(),
        };
        tokio::spawn(session.run(commands_rx));

        Device {
            commands,
            snapshot,
            bus,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// Follows the snapshot as the session updates it.
    pub fn watch_snapshot(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Sample> {
        self.bus.subscribe()
    }

    /// Waits until the session reaches `status`.
    pub async fn wait_for_status(&self, status: DeviceStatus) -> Result<()> {
        let mut snapshot = self.snapshot.clone();
        snapshot
            .wait_for(|s| s.status == status)
            .await
            .map(|_| ())
            .map_err(|_| BandError::SessionClosed)
    }

    /// Disconnects and drops this handle.
    pub async fn dispose(self) -> Result<()> {
        self.disconnect().await
    }

    async fn request(&self, command: impl FnOnce(Reply) -> Command) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| BandError::SessionClosed)?;
        response.await.map_err(|_| BandError::SessionClosed)?
    }
}

#[async_trait]
impl HeartrateDevice for Device {
    async fn connect(&self) -> Result<()> {
        self.request(Command::Connect).await
    }

    async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await
    }

    async fn authenticate(&self) -> Result<()> {
        self.request(Command::Authenticate).await
    }

    async fn start_heartrate_monitor(&self, continuous: bool) -> Result<()> {
        self.request(|reply| Command::StartMonitor { continuous, reply })
            .await
    }

    async fn stop_heartrate_monitor(&self) -> Result<()> {
        self.request(Command::StopMonitor).await
    }
}

struct Session {
    transport: Arc<dyn Transport>,
    address: String,
    variant: Variant,
    handle: Option<DeviceHandle>,
    events: Option<BoxStream<'static, TransportEvent>>,
    auth: Authenticator,
    monitor: HeartrateMonitor,
    battery: BatteryMonitor,
    state: watch::Sender<Snapshot>,
    bus: SignalBus,
}

async fn next_event(events: &mut Option<BoxStream<'static, TransportEvent>>) -> Option<TransportEvent> {
    match events {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

impl Session {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = next_event(&mut self.events) => self.handle_event(event).await,
            }
        }

        if let Err(e) = self.disconnect().await {
            debug!(error = %e, "teardown after last handle dropped");
        }
        debug!(address = %self.address, "device session closed");
    }

    async fn handle_command(&mut self, command: Command) {
        let (result, reply) = match command {
            Command::Connect(reply) => (self.connect().await, reply),
            Command::Disconnect(reply) => (self.disconnect().await, reply),
            Command::Authenticate(reply) => (self.authenticate().await, reply),
            Command::StartMonitor { continuous, reply } => {
                (self.start_monitor(continuous).await, reply)
            }
            Command::StopMonitor(reply) => (self.stop_monitor().await, reply),
        };
        let _ = reply.send(result);
    }

    async fn handle_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Notification { characteristic, value }) => {
                self.on_notification(characteristic, &value).await
            }
            Some(TransportEvent::ConnectionChanged(ConnectionState::Connected)) => {}
            Some(TransportEvent::ConnectionChanged(ConnectionState::Disconnected)) | None => {
                self.on_link_lost().await
            }
        }
    }

    async fn connect(&mut self) -> Result<()> {
        if self.handle.is_some() {
            if let Err(e) = self.disconnect().await {
                debug!(error = %e, "error while dropping previous connection");
            }
        }

        info!(address = %self.address, model = ?self.variant.model(), "connecting");
        let device = self.transport.resolve(&self.address).await?;
        let events = match self.transport.events(&device).await {
            Ok(events) => events,
            Err(e) => {
                let _ = self.transport.release(&device).await;
                return Err(e.into());
            }
        };
        self.events = Some(events);
        self.handle = Some(device.clone());

        if let Some(name) = device.name.clone() {
            if self.state.borrow().name.as_ref() != Some(&name) {
                self.state.send_modify(|s| s.name = Some(name.clone()));
                self.bus.emit(BandSignal::Name(name));
            }
        }
        self.set_status(DeviceStatus::OnlineUnauthenticated);

        if let Err(e) = self.begin_authentication(&device).await {
            error!(error = %e, "could not start authentication");
            self.bus.emit(BandSignal::AuthenticationFailed(e.to_string()));
        }
        Ok(())
    }

    async fn authenticate(&mut self) -> Result<()> {
        let Some(device) = self.handle.clone() else {
            return Err(BandError::NotConnected);
        };
        match self.status() {
            DeviceStatus::OnlineAuthenticated => Ok(()),
            DeviceStatus::Offline => Err(BandError::NotConnected),
            DeviceStatus::OnlineUnauthenticated => self.begin_authentication(&device).await,
        }
    }

    async fn begin_authentication(&mut self, device: &DeviceHandle) -> Result<()> {
        let key_material = self.variant.key_material();
        self.auth
            .authenticate(self.transport.as_ref(), device, &key_material)
            .await
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut result = Ok(());

        if let Some(device) = self.handle.clone() {
            let was_active = self.monitor.is_active();
            if let Err(e) = self.monitor.stop(self.transport.as_ref(), &device).await {
                warn!(error = %e, "failed to stop heart rate monitor");
                result = Err(e);
            }
            if was_active {
                self.set_monitor_active(false);
            }
        }

        self.release_characteristics();

        if let Some(device) = self.handle.take() {
            info!(address = %device.address, "disconnecting");
            if let Err(e) = self.transport.release(&device).await {
                warn!(error = %e, "failed to release device");
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }

        self.set_status(DeviceStatus::Offline);
        result
    }

    async fn on_link_lost(&mut self) {
        warn!(address = %self.address, "connection lost");
        let was_active = self.monitor.is_active();
        self.release_characteristics();
        if was_active {
            self.set_monitor_active(false);
        }

        if let Some(device) = self.handle.take() {
            if let Err(e) = self.transport.release(&device).await {
                debug!(error = %e, "release after connection loss");
            }
        }
        self.set_status(DeviceStatus::Offline);
    }

    async fn start_monitor(&mut self, continuous: bool) -> Result<()> {
        let Some(device) = self.handle.clone() else {
            return Err(BandError::NotConnected);
        };
        if self.status() != DeviceStatus::OnlineAuthenticated {
            return Err(BandError::NotAuthenticated);
        }
        if self.monitor.is_active() {
            return Ok(());
        }

        self.monitor.start(&self.transport, &device, continuous).await?;
        self.set_monitor_active(true);
        Ok(())
    }

    async fn stop_monitor(&mut self) -> Result<()> {
        if !self.monitor.is_active() {
            return Ok(());
        }
        let Some(device) = self.handle.clone() else {
            self.monitor.release();
            self.set_monitor_active(false);
            return Ok(());
        };

        let result = self.monitor.stop(self.transport.as_ref(), &device).await;
        self.set_monitor_active(false);
        result
    }

    async fn on_notification(&mut self, characteristic: Uuid, value: &[u8]) {
        let Some(device) = self.handle.clone() else {
            return;
        };
        let is = |c: Option<&crate::transport::Characteristic>| c.is_some_and(|c| c.uuid == characteristic);

        if is(self.auth.characteristic()) {
            self.on_auth_notification(&device, value).await;
        } else if is(self.monitor.measurement()) {
            let was_active = self.monitor.is_active();
            if let Some(bpm) = self
                .monitor
                .on_notification(self.transport.as_ref(), &device, value)
                .await
            {
                self.state.send_modify(|s| {
                    s.record_heartrate(bpm);
                });
                debug!(bpm, "heart rate");
                self.bus.emit(BandSignal::Heartrate(bpm));
            }
            if was_active && !self.monitor.is_active() {
                self.set_monitor_active(false);
            }
        } else if is(self.battery.characteristic()) {
            if let Some(reading) = self.battery.on_notification(value) {
                self.apply_battery(reading);
            }
        } else {
            debug!(%characteristic, "notification for released characteristic");
        }
    }

    async fn on_auth_notification(&mut self, device: &DeviceHandle, value: &[u8]) {
        match self
            .auth
            .on_notification(self.transport.as_ref(), device, value)
            .await
        {
            Ok(AuthStep::Authenticated) => {
                self.set_status(DeviceStatus::OnlineAuthenticated);
                if let Some(reading) = self.battery.start(self.transport.as_ref(), device).await {
                    self.apply_battery(reading);
                }
            }
            Ok(AuthStep::Failed(reason)) => {
                self.bus.emit(BandSignal::AuthenticationFailed(reason.to_string()));
            }
            Ok(AuthStep::Continue | AuthStep::Ignored) => {}
            Err(e) => {
                error!(error = %e, "authentication aborted");
                self.bus.emit(BandSignal::AuthenticationFailed(e.to_string()));
            }
        }
    }

    fn apply_battery(&mut self, reading: BatteryReading) {
        self.state.send_modify(|s| {
            s.battery = reading.level;
            s.is_charging = reading.charging;
        });
        debug!(level = reading.level, charging = reading.charging, "battery");
        self.bus.emit(BandSignal::Battery(reading.level));
        self.bus.emit(BandSignal::IsCharging(reading.charging));
    }

    fn release_characteristics(&mut self) {
        self.monitor.release();
        self.battery.release();
        self.auth.reset();
        self.events = None;
    }

    fn status(&self) -> DeviceStatus {
        self.state.borrow().status
    }

    fn set_status(&mut self, next: DeviceStatus) {
        let current = self.status();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(%current, %next, "refusing status change");
            return;
        }

        self.state.send_modify(|s| s.status = next);
        info!(address = %self.address, status = %next, "status changed");
        self.bus.emit(BandSignal::Status(next));
    }

    fn set_monitor_active(&mut self, active: bool) {
        self.state.send_modify(|s| s.monitor_active = active);
        self.bus.emit(BandSignal::MonitorActive(active));
    }
}
