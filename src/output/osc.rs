//! OSC over UDP, addressed the way avatar parameter receivers expect.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use rosc::{encoder, OscMessage, OscPacket, OscType};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::device::Snapshot;
use crate::pulse::PulseEvent;
use crate::signal::{BandSignal, Sample, TelemetrySink};

const PARAMETERS: &str = "/avatar/parameters";

const RATE_INT: [&str; 3] = ["HeartRateInt", "HeartRate3", "HR/Int"];
const RATE_FLOAT: [&str; 4] = ["HeartRateFloat", "HeartRate", "floatHR", "HR/Float"];
const RATE_FLOAT01: [&str; 3] = ["HeartRateFloat01", "HeartRate2", "HR/HalfFloat"];
const RATE_MIN: &str = "HR/Min";
const RATE_MAX: &str = "HR/Max";
const BEAT_INT: &str = "HeartBeatInt";
const BEAT_PULSE: [&str; 2] = ["HeartBeatPulse", "HR/Beat"];
const BEAT_TOGGLE: [&str; 2] = ["HeartBeatToggle", "HR/BeatToggle"];
const CONNECTED: [&str; 2] = ["isHRConnected", "HR/Connected"];

fn message(parameter: &str, arg: OscType) -> OscMessage {
    OscMessage {
        addr: format!("{PARAMETERS}/{parameter}"),
        args: vec![arg],
    }
}

fn each<'a>(parameters: &'a [&'a str], arg: OscType) -> impl Iterator<Item = OscMessage> + 'a {
    parameters
        .iter()
        .map(move |parameter| message(parameter, arg.clone()))
}

/// Rate in three encodings: plain, mapped onto [-1, 1] and onto [0, 1].
pub fn heartrate_messages(bpm: u8, min: Option<u8>, max: Option<u8>) -> Vec<OscMessage> {
    let rate = f32::from(bpm);
    let mut messages: Vec<OscMessage> = each(&RATE_INT, OscType::Int(i32::from(bpm)))
        .chain(each(&RATE_FLOAT, OscType::Float(rate / 127.0 - 1.0)))
        .chain(each(&RATE_FLOAT01, OscType::Float(rate / 255.0)))
        .collect();

    if let Some(min) = min {
        messages.push(message(RATE_MIN, OscType::Int(i32::from(min))));
    }
    if let Some(max) = max {
        messages.push(message(RATE_MAX, OscType::Int(i32::from(max))));
    }
    messages
}

pub fn pulse_messages(event: PulseEvent) -> Vec<OscMessage> {
    match event {
        PulseEvent::Begin { parity } => std::iter::once(message(BEAT_INT, OscType::Int(1)))
            .chain(each(&BEAT_PULSE, OscType::Bool(true)))
            .chain(each(&BEAT_TOGGLE, OscType::Bool(parity)))
            .collect(),
        PulseEvent::End => std::iter::once(message(BEAT_INT, OscType::Int(0)))
            .chain(each(&BEAT_PULSE, OscType::Bool(false)))
            .collect(),
        PulseEvent::Connected(connected) => each(&CONNECTED, OscType::Bool(connected)).collect(),
    }
}

/// One UDP socket aimed at a fixed target. Clones share the socket.
#[derive(Clone)]
pub struct OscEmitter {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
}

impl OscEmitter {
    pub async fn bind(target: SocketAddr) -> anyhow::Result<Self> {
        let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local)
            .await
            .with_context(|| format!("binding OSC socket for {target}"))?;
        Ok(OscEmitter {
            socket: Arc::new(socket),
            target,
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Every message goes out as its own datagram.
    pub async fn send(&self, messages: Vec<OscMessage>) -> anyhow::Result<()> {
        for msg in messages {
            let addr = msg.addr.clone();
            let packet = encoder::encode(&OscPacket::Message(msg))
                .map_err(|e| anyhow!("encoding {addr}: {e:?}"))?;
            self.socket
                .send_to(&packet, self.target)
                .await
                .with_context(|| format!("sending {addr} to {}", self.target))?;
        }
        Ok(())
    }
}

/// Heart rate side of the OSC output. Extremes come from the session
/// snapshot, which is updated before the sample is published.
pub struct OscSink {
    emitter: OscEmitter,
    snapshot: watch::Receiver<Snapshot>,
}

impl OscSink {
    pub fn new(emitter: OscEmitter, snapshot: watch::Receiver<Snapshot>) -> Self {
        OscSink { emitter, snapshot }
    }
}

#[async_trait]
impl TelemetrySink for OscSink {
    fn name(&self) -> &'static str {
        "osc"
    }

    async fn on_sample(&mut self, sample: &Sample) -> anyhow::Result<()> {
        let BandSignal::Heartrate(bpm) = sample.signal else {
            return Ok(());
        };
        if bpm == 0 {
            return Ok(());
        }

        let (min, max) = {
            let snapshot = self.snapshot.borrow();
            let max = snapshot.max_heartrate;
            (snapshot.min_heartrate, (max > 0).then_some(max))
        };
        self.emitter.send(heartrate_messages(bpm, min, max)).await
    }
}

/// Sends every pulse event until the synthesizer goes away.
pub fn forward_pulses(emitter: OscEmitter, mut events: UnboundedReceiver<PulseEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Err(e) = emitter.send(pulse_messages(event)).await {
                warn!(error = %e, "failed to send pulse");
            }
        }
        debug!(target = %emitter.target(), "pulse forwarding stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rosc::decoder;
    use tokio::sync::mpsc;

    use super::*;
    use crate::device::DeviceModel;

    fn addresses(messages: &[OscMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.addr.as_str()).collect()
    }

    #[test]
    fn test_heartrate_encodings() {
        let messages = heartrate_messages(127, None, None);
        assert_eq!(
            addresses(&messages),
            vec![
                "/avatar/parameters/HeartRateInt",
                "/avatar/parameters/HeartRate3",
                "/avatar/parameters/HR/Int",
                "/avatar/parameters/HeartRateFloat",
                "/avatar/parameters/HeartRate",
                "/avatar/parameters/floatHR",
                "/avatar/parameters/HR/Float",
                "/avatar/parameters/HeartRateFloat01",
                "/avatar/parameters/HeartRate2",
                "/avatar/parameters/HR/HalfFloat",
            ]
        );
        assert_eq!(messages[0].args, vec![OscType::Int(127)]);
        assert_eq!(messages[3].args, vec![OscType::Float(0.0)]);
        assert_eq!(messages[7].args, vec![OscType::Float(127.0 / 255.0)]);

        let messages = heartrate_messages(60, Some(55), Some(90));
        let min = messages.iter().find(|m| m.addr.ends_with("HR/Min")).unwrap();
        let max = messages.iter().find(|m| m.addr.ends_with("HR/Max")).unwrap();
        assert_eq!(min.args, vec![OscType::Int(55)]);
        assert_eq!(max.args, vec![OscType::Int(90)]);
    }

    #[test]
    fn test_pulse_encodings() {
        let begin = pulse_messages(PulseEvent::Begin { parity: true });
        assert_eq!(begin.len(), 5);
        assert_eq!(begin[0].args, vec![OscType::Int(1)]);
        assert!(begin
            .iter()
            .filter(|m| m.addr.ends_with("BeatToggle"))
            .all(|m| m.args == vec![OscType::Bool(true)]));

        let end = pulse_messages(PulseEvent::End);
        assert_eq!(
            addresses(&end),
            vec![
                "/avatar/parameters/HeartBeatInt",
                "/avatar/parameters/HeartBeatPulse",
                "/avatar/parameters/HR/Beat",
            ]
        );

        let connected = pulse_messages(PulseEvent::Connected(false));
        assert_eq!(
            addresses(&connected),
            vec!["/avatar/parameters/isHRConnected", "/avatar/parameters/HR/Connected"]
        );
    }

    async fn receive(socket: &UdpSocket) -> OscMessage {
        let mut buf = [0u8; 1024];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        match decoder::decode_udp(&buf[..len]).unwrap().1 {
            OscPacket::Message(msg) => msg,
            other => panic!("unexpected packet {other:?}"),
        }
    }

    async fn receive_batch(socket: &UdpSocket) -> Vec<OscMessage> {
        let mut batch = Vec::new();
        for _ in 0..12 {
            batch.push(receive(socket).await);
        }
        batch
    }

    #[tokio::test]
    async fn test_sink_reports_session_extremes() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let emitter = OscEmitter::bind(receiver.local_addr().unwrap()).await.unwrap();
        let (state, snapshot) = watch::channel(Snapshot::new(
            "C8:0F:10:00:00:01".to_string(),
            DeviceModel::MiBand2_3,
        ));
        let mut sink = OscSink::new(emitter, snapshot);

        // readings taken before the sink was attached still count
        state.send_modify(|s| {
            s.record_heartrate(95);
            s.record_heartrate(80);
        });
        sink.on_sample(&Sample::now(BandSignal::Heartrate(80))).await.unwrap();
        let first = receive_batch(&receiver).await;
        assert_eq!(first[0].addr, "/avatar/parameters/HeartRateInt");
        assert_eq!(first[0].args, vec![OscType::Int(80)]);
        assert_eq!(first[10].addr, "/avatar/parameters/HR/Min");
        assert_eq!(first[10].args, vec![OscType::Int(80)]);
        assert_eq!(first[11].args, vec![OscType::Int(95)]);

        sink.on_sample(&Sample::now(BandSignal::Heartrate(0))).await.unwrap();
        state.send_modify(|s| {
            s.record_heartrate(72);
        });
        sink.on_sample(&Sample::now(BandSignal::Heartrate(72))).await.unwrap();

        let second = receive_batch(&receiver).await;
        assert_eq!(second[0].args, vec![OscType::Int(72)]);
        assert_eq!(second[10].args, vec![OscType::Int(72)]);
        assert_eq!(second[11].args, vec![OscType::Int(95)]);
    }

    #[tokio::test]
    async fn test_forward_pulses_until_closed() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let emitter = OscEmitter::bind(receiver.local_addr().unwrap()).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = forward_pulses(emitter, rx);

        tx.send(PulseEvent::Connected(true)).unwrap();
        drop(tx);
        task.await.unwrap();

        let msg = receive(&receiver).await;
        assert_eq!(msg.addr, "/avatar/parameters/isHRConnected");
        assert_eq!(msg.args, vec![OscType::Bool(true)]);
        assert_eq!(receive(&receiver).await.addr, "/avatar/parameters/HR/Connected");
    }
}
