use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::warn;

pub const BUS_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceStatus {
    #[default]
    Offline,
    OnlineUnauthenticated,
    OnlineAuthenticated,
}

impl DeviceStatus {
    /// Status only moves forward one step at a time or drops back to offline.
    pub fn can_transition_to(self, next: DeviceStatus) -> bool {
        use DeviceStatus::*;
        matches!(
            (self, next),
            (_, Offline) | (Offline, OnlineUnauthenticated) | (OnlineUnauthenticated, OnlineAuthenticated)
        )
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceStatus::Offline => "offline",
            DeviceStatus::OnlineUnauthenticated => "connected, not authenticated",
            DeviceStatus::OnlineAuthenticated => "connected, authenticated",
        };
        f.write_str(label)
    }
}

/// A change published by a device session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BandSignal {
    Heartrate(u8),
    Battery(u8),
    IsCharging(bool),
    MonitorActive(bool),
    Status(DeviceStatus),
    Name(String),
    AuthenticationFailed(String),
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub signal: BandSignal,
    pub at: DateTime<Local>,
}

impl Sample {
    pub fn now(signal: BandSignal) -> Self {
        Sample {
            signal,
            at: Local::now(),
        }
    }
}

/// Fan-out of samples to any number of subscribers. Sending never blocks;
/// a subscriber that falls behind loses the oldest samples.
#[derive(Clone)]
pub struct SignalBus {
    tx: broadcast::Sender<Sample>,
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new(BUS_CAPACITY)
    }
}

impl SignalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        SignalBus { tx }
    }

    pub fn emit(&self, signal: BandSignal) {
        // no subscribers is fine
        let _ = self.tx.send(Sample::now(signal));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Sample> {
        self.tx.subscribe()
    }
}

/// Something that consumes telemetry, like a file writer or a network emitter.
#[async_trait]
pub trait TelemetrySink: Send + 'static {
    fn name(&self) -> &'static str;

    async fn on_sample(&mut self, sample: &Sample) -> anyhow::Result<()>;
}

/// Runs `sink` on its own task until the bus is closed.
pub fn attach<S: TelemetrySink>(mut sink: S, mut samples: broadcast::Receiver<Sample>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match samples.recv().await {
                Ok(sample) => {
                    if let Err(e) = sink.on_sample(&sample).await {
                        warn!(sink = sink.name(), error = %e, "sink failed to handle sample");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(sink = sink.name(), skipped, "sink fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
