use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rosc::{decoder, OscMessage, OscPacket, OscType};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::timeout;

use bandpulse::crypto::SessionKey;
use bandpulse::device::{Device, HeartrateDevice, Variant};
use bandpulse::error::BandError;
use bandpulse::fake::FakeBand;
use bandpulse::output::{forward_pulses, CsvSink, OscEmitter, OscSink};
use bandpulse::protocol::HEART_RATE_CONTROL_UUID;
use bandpulse::pulse::PulseSynthesizer;
use bandpulse::signal::{attach, BandSignal, DeviceStatus, Sample};

const ADDRESS: &str = "C8:0F:10:12:34:56";
const WAIT: Duration = Duration::from_secs(5);

async fn wait_for_signal(samples: &mut broadcast::Receiver<Sample>, wanted: BandSignal) {
    timeout(WAIT, async {
        loop {
            if samples.recv().await.unwrap().signal == wanted {
                return;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {wanted:?}"));
}

async fn wait_for_osc(socket: &UdpSocket, addr: &str, arg: OscType) {
    timeout(WAIT, async {
        let mut buf = [0u8; 1024];
        loop {
            let (len, _) = socket.recv_from(&mut buf).await.unwrap();
            if let OscPacket::Message(OscMessage { addr: got, args }) =
                decoder::decode_udp(&buf[..len]).unwrap().1
            {
                if got == addr && args == vec![arg.clone()] {
                    return;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no OSC message {addr}"));
}

async fn wait_for_lines(path: &Path, count: usize) -> Vec<String> {
    timeout(WAIT, async {
        loop {
            if let Ok(content) = tokio::fs::read_to_string(path).await {
                let lines: Vec<String> = content.lines().map(str::to_string).collect();
                if lines.len() >= count {
                    return lines;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("csv rows never appeared")
}

#[tokio::test]
async fn test_session_end_to_end() {
    let band = FakeBand::new(ADDRESS, "Mi Band 3").with_battery(&[0x0f, 64, 0x00]);
    let device = Device::new(Arc::new(band.clone()), ADDRESS, Variant::Legacy);
    let mut samples = device.subscribe();

    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("heartrate.csv");
    attach(CsvSink::new(&csv), device.subscribe());

    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let emitter = OscEmitter::bind(receiver.local_addr().unwrap()).await.unwrap();
    attach(OscSink::new(emitter.clone(), device.watch_snapshot()), device.subscribe());
    let (pulse, pulses) = PulseSynthesizer::channel();
    forward_pulses(emitter, pulses);
    tokio::spawn(pulse.drive(device.subscribe()));

    device.connect().await.unwrap();
    wait_for_signal(&mut samples, BandSignal::Status(DeviceStatus::OnlineAuthenticated)).await;
    wait_for_signal(&mut samples, BandSignal::Battery(64)).await;

    device.start_heartrate_monitor(true).await.unwrap();
    wait_for_osc(&receiver, "/avatar/parameters/isHRConnected", OscType::Bool(true)).await;

    band.push_heartrate(90);
    band.push_heartrate(0);
    band.push_heartrate(60);
    wait_for_signal(&mut samples, BandSignal::Heartrate(60)).await;

    let snapshot = device.snapshot();
    assert_eq!(snapshot.heartrate, 60);
    assert_eq!(snapshot.min_heartrate, Some(60));
    assert_eq!(snapshot.max_heartrate, 90);
    assert_eq!(snapshot.battery, 64);

    wait_for_osc(&receiver, "/avatar/parameters/HR/Max", OscType::Int(90)).await;
    wait_for_osc(&receiver, "/avatar/parameters/HeartBeatInt", OscType::Int(1)).await;

    let rows = wait_for_lines(&csv, 3).await;
    assert_eq!(rows[0], "At,Heartrate");
    assert!(rows[1].ends_with(",90"));
    assert!(rows[2].ends_with(",60"));

    band.drop_link();
    wait_for_signal(&mut samples, BandSignal::Status(DeviceStatus::Offline)).await;
    assert!(!device.snapshot().monitor_active);
    wait_for_osc(&receiver, "/avatar/parameters/isHRConnected", OscType::Bool(false)).await;

    // link is gone, so nothing gets switched off on the band
    band.clear_writes();
    device.disconnect().await.unwrap();
    assert!(band.writes_to(HEART_RATE_CONTROL_UUID).is_empty());
}

#[tokio::test]
async fn test_key_based_band_with_matching_key() {
    let band = FakeBand::new(ADDRESS, "Mi Smart Band 4")
        .with_stored_key(SessionKey::from([0x11; 16]));
    let variant = Variant::key_based("11111111111111111111111111111111").unwrap();
    let device = Device::new(Arc::new(band.clone()), ADDRESS, variant);

    device.connect().await.unwrap();
    timeout(WAIT, device.wait_for_status(DeviceStatus::OnlineAuthenticated))
        .await
        .unwrap()
        .unwrap();

    device.disconnect().await.unwrap();
    assert!(!band.is_connected());
}

#[tokio::test]
async fn test_malformed_key_fails_before_any_io() {
    let band = FakeBand::new(ADDRESS, "Mi Smart Band 4");
    let result = Variant::key_based("this is not a key");
    assert!(matches!(result, Err(BandError::Configuration(_))));
    assert!(!band.is_connected());
    assert!(band.writes().is_empty());
}

#[tokio::test]
async fn test_single_reading_with_simulated_sensor() {
    let band = FakeBand::new(ADDRESS, "Mi Band 2").with_live_heartrate();
    let device = Device::new(Arc::new(band.clone()), ADDRESS, Variant::Legacy);
    let mut samples = device.subscribe();

    device.connect().await.unwrap();
    wait_for_signal(&mut samples, BandSignal::Status(DeviceStatus::OnlineAuthenticated)).await;
    device.start_heartrate_monitor(false).await.unwrap();
    wait_for_signal(&mut samples, BandSignal::MonitorActive(false)).await;

    let snapshot = device.snapshot();
    assert!((50..70).contains(&snapshot.heartrate));
    assert_eq!(snapshot.min_heartrate, Some(snapshot.heartrate));
    device.dispose().await.unwrap();
}
