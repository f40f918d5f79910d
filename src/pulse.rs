//! Turns a heart rate into a beat-by-beat pulse train.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::signal::{BandSignal, DeviceStatus, Sample};

const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseEvent {
    Begin { parity: bool },
    End,
    Connected(bool),
}

pub struct PulseSynthesizer {
    rate: watch::Sender<u8>,
    parity: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<PulseEvent>,
    running: Option<(CancellationToken, JoinHandle<()>)>,
}

impl PulseSynthesizer {
    pub fn new(events: mpsc::UnboundedSender<PulseEvent>) -> Self {
        let (rate, _) = watch::channel(0);
        PulseSynthesizer {
            rate,
            parity: Arc::new(AtomicBool::new(false)),
            events,
            running: None,
        }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PulseEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Takes effect from the next beat on. Zero pauses the pulse train.
    pub fn set_rate(&self, bpm: u8) {
        self.rate.send_replace(bpm);
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn start(&mut self) {
        if self.running.is_some() {
            return;
        }

        let _ = self.events.send(PulseEvent::Connected(true));
        let token = CancellationToken::new();
        let handle = tokio::spawn(beat_loop(
            self.rate.subscribe(),
            self.parity.clone(),
            self.events.clone(),
            token.clone(),
        ));
        self.running = Some((token, handle));
        debug!("pulse started");
    }

    /// Waits for the loop to finish its current beat before reporting
    /// disconnection.
    pub async fn stop(&mut self) {
        let Some((token, handle)) = self.running.take() else {
            return;
        };
        token.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "pulse loop ended abnormally");
        }
        let _ = self.events.send(PulseEvent::Connected(false));
        debug!("pulse stopped");
    }

    /// Follows a device session until its bus closes.
    pub async fn drive(mut self, mut samples: broadcast::Receiver<Sample>) {
        loop {
            match samples.recv().await {
                Ok(sample) => match sample.signal {
                    BandSignal::Heartrate(bpm) => self.set_rate(bpm),
                    BandSignal::MonitorActive(true) => self.start(),
                    BandSignal::MonitorActive(false) | BandSignal::Status(DeviceStatus::Offline) => {
                        self.stop().await
                    }
                    _ => {}
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "pulse fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
        self.stop().await;
    }
}

impl Drop for PulseSynthesizer {
    fn drop(&mut self) {
        if let Some((token, _)) = &self.running {
            token.cancel();
        }
    }
}

async fn beat_loop(
    rate: watch::Receiver<u8>,
    parity: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<PulseEvent>,
    token: CancellationToken,
) {
    let mut next_beat: Option<Instant> = None;

    loop {
        let bpm = *rate.borrow();
        if bpm == 0 {
            next_beat = None;
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep(IDLE_POLL) => continue,
            }
        }

        let interval = Duration::from_millis(60_000 / u64::from(bpm));
        let deadline = *next_beat.get_or_insert_with(|| Instant::now() + interval);
        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep_until(deadline) => {}
        }

        let current = parity.load(Ordering::Relaxed);
        let _ = events.send(PulseEvent::Begin { parity: current });

        let cancelled = tokio::select! {
            _ = token.cancelled() => true,
            _ = sleep(interval / 5) => false,
        };
        let _ = events.send(PulseEvent::End);
        parity.store(!current, Ordering::Relaxed);

        if cancelled {
            break;
        }
        next_beat = Some(deadline + interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalBus;

    async fn next_at(
        rx: &mut mpsc::UnboundedReceiver<PulseEvent>,
        start: Instant,
    ) -> (PulseEvent, u128) {
        let event = rx.recv().await.unwrap();
        (event, start.elapsed().as_millis())
    }

    #[tokio::test(start_paused = true)]
    async fn test_beats_at_sixty_bpm() {
        let (mut pulse, mut rx) = PulseSynthesizer::channel();
        pulse.set_rate(60);
        let start = Instant::now();
        pulse.start();

        assert_eq!(next_at(&mut rx, start).await, (PulseEvent::Connected(true), 0));
        assert_eq!(
            next_at(&mut rx, start).await,
            (PulseEvent::Begin { parity: false }, 1000)
        );
        assert_eq!(next_at(&mut rx, start).await, (PulseEvent::End, 1200));
        assert_eq!(
            next_at(&mut rx, start).await,
            (PulseEvent::Begin { parity: true }, 2000)
        );
        assert_eq!(next_at(&mut rx, start).await, (PulseEvent::End, 2200));
        assert_eq!(
            next_at(&mut rx, start).await,
            (PulseEvent::Begin { parity: false }, 3000)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_rate_is_silent() {
        let (mut pulse, mut rx) = PulseSynthesizer::channel();
        pulse.start();
        assert_eq!(rx.recv().await, Some(PulseEvent::Connected(true)));

        let silent = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(silent.is_err());

        // first beat is a full interval after the rate shows up
        let start = Instant::now();
        pulse.set_rate(120);
        let (event, at) = next_at(&mut rx, start).await;
        assert_eq!(event, PulseEvent::Begin { parity: false });
        assert!((500..=600).contains(&at), "first beat at {at} ms");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_change_applies_to_following_beats() {
        let (mut pulse, mut rx) = PulseSynthesizer::channel();
        pulse.set_rate(60);
        let start = Instant::now();
        pulse.start();
        rx.recv().await;

        assert_eq!(next_at(&mut rx, start).await.1, 1000);
        pulse.set_rate(120);
        assert_eq!(next_at(&mut rx, start).await, (PulseEvent::End, 1200));
        assert_eq!(
            next_at(&mut rx, start).await,
            (PulseEvent::Begin { parity: true }, 2000)
        );
        assert_eq!(next_at(&mut rx, start).await, (PulseEvent::End, 2100));
        assert_eq!(
            next_at(&mut rx, start).await,
            (PulseEvent::Begin { parity: false }, 2500)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_hold_ends_the_beat_and_keeps_parity() {
        let (mut pulse, mut rx) = PulseSynthesizer::channel();
        pulse.set_rate(60);
        pulse.start();
        assert_eq!(rx.recv().await, Some(PulseEvent::Connected(true)));
        assert_eq!(rx.recv().await, Some(PulseEvent::Begin { parity: false }));

        pulse.stop().await;
        assert!(!pulse.is_running());
        assert_eq!(rx.recv().await, Some(PulseEvent::End));
        assert_eq!(rx.recv().await, Some(PulseEvent::Connected(false)));

        pulse.start();
        assert_eq!(rx.recv().await, Some(PulseEvent::Connected(true)));
        assert_eq!(rx.recv().await, Some(PulseEvent::Begin { parity: true }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_are_idempotent() {
        let (mut pulse, mut rx) = PulseSynthesizer::channel();
        pulse.stop().await;
        pulse.start();
        pulse.start();
        pulse.stop().await;
        pulse.stop().await;
        drop(pulse);

        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![PulseEvent::Connected(true), PulseEvent::Connected(false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_follows_session() {
        let bus = SignalBus::new(16);
        let (pulse, mut rx) = PulseSynthesizer::channel();
        let task = tokio::spawn(pulse.drive(bus.subscribe()));

        bus.emit(BandSignal::Heartrate(75));
        bus.emit(BandSignal::MonitorActive(true));
        assert_eq!(rx.recv().await, Some(PulseEvent::Connected(true)));
        assert_eq!(rx.recv().await, Some(PulseEvent::Begin { parity: false }));
        assert_eq!(rx.recv().await, Some(PulseEvent::End));

        bus.emit(BandSignal::Status(DeviceStatus::Offline));
        loop {
            match rx.recv().await {
                Some(PulseEvent::Connected(false)) => break,
                Some(_) => {}
                None => panic!("pulse channel closed early"),
            }
        }

        drop(bus);
        task.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }
}
