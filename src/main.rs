use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bandpulse::ble::BleTransport;
use bandpulse::config::Config;
use bandpulse::device::{Device, HeartrateDevice};
use bandpulse::fake::FakeBand;
use bandpulse::output::{forward_pulses, CsvSink, FileSink, OscEmitter, OscSink};
use bandpulse::pulse::PulseSynthesizer;
use bandpulse::signal::{attach, BandSignal, DeviceStatus};
use bandpulse::transport::Transport;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Config::parse()).await {
        error!("{e:#}");
        exit(1);
    }
}

async fn run(config: Config) -> Result<()> {
    // fails on a bad key before the radio is touched
    let variant = config.variant()?;
    let address = config.device_address()?;

    let transport: Arc<dyn Transport> = if config.simulate {
        info!("using a simulated band");
        Arc::new(FakeBand::new(&address, config.simulated_name()).with_live_heartrate())
    } else {
        Arc::new(BleTransport::new(config.scan_timeout()).await?)
    };

    let device = Device::new(transport, address, variant);
    let outputs = spawn_outputs(&config, &device).await?;

    let result = supervise(&config, &device).await;

    if let Err(e) = device.dispose().await {
        warn!(error = %e, "error while disconnecting");
    }
    for task in outputs {
        if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
            warn!("output did not finish in time");
        }
    }
    result
}

async fn spawn_outputs(config: &Config, device: &Device) -> Result<Vec<JoinHandle<()>>> {
    let mut tasks = Vec::new();

    if let Some(path) = &config.file_output {
        info!(path = %path.display(), "writing heart rate to file");
        tasks.push(attach(FileSink::new(path), device.subscribe()));
    }
    if let Some(path) = &config.csv_output {
        info!(path = %path.display(), "appending heart rate to csv");
        tasks.push(attach(CsvSink::new(path), device.subscribe()));
    }
    if config.osc {
        info!(target = %config.osc_target, "sending OSC");
        let emitter = OscEmitter::bind(config.osc_target).await?;
        let sink = OscSink::new(emitter.clone(), device.watch_snapshot());
        tasks.push(attach(sink, device.subscribe()));

        let (pulse, pulses) = PulseSynthesizer::channel();
        tasks.push(forward_pulses(emitter, pulses));
        tasks.push(tokio::spawn(pulse.drive(device.subscribe())));
    }
    Ok(tasks)
}

/// Follows the session until ctrl-c, the end of a single reading, or a
/// failure that cannot be recovered.
async fn supervise(config: &Config, device: &Device) -> Result<()> {
    let mut samples = device.subscribe();
    device.connect().await?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut was_online = false;

    loop {
        let sample = tokio::select! {
            _ = &mut shutdown => {
                info!("shutting down");
                return Ok(());
            }
            sample = samples.recv() => sample,
        };

        let signal = match sample {
            Ok(sample) => sample.signal,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "supervisor fell behind");
                continue;
            }
            Err(RecvError::Closed) => return Err(anyhow!("device session ended")),
        };

        match signal {
            BandSignal::Status(DeviceStatus::OnlineAuthenticated) => {
                was_online = true;
                device.start_heartrate_monitor(config.continuous).await?;
            }
            BandSignal::Status(DeviceStatus::Offline) if was_online => {
                was_online = false;
                if !config.reconnect {
                    return Err(anyhow!("band disconnected"));
                }
                warn!("band disconnected, reconnecting");
                device.connect().await?;
            }
            BandSignal::AuthenticationFailed(reason) => {
                return Err(anyhow!("authentication failed: {reason}"));
            }
            BandSignal::Heartrate(bpm) => {
                info!(bpm, "heart rate");
                if !config.continuous {
                    return Ok(());
                }
            }
            BandSignal::Battery(level) => info!(level, "battery"),
            BandSignal::Name(name) => info!(%name, "band found"),
            _ => {}
        }
    }
}
