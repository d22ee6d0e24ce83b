use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use tracing::{debug, info, warn};

use crate::parser::parse_feedback;
use crate::persistence::RawTelemetryLog;

/// Link-quality report for one uplink, as seen by the network server.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackMessage {
    pub dev_addr: String,
    /// SNR measured by the best receiving gateway, in dB.
    pub snr: f64,
    pub gateway: String,
}

/// Application data returned by the network after a transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downlink {
    pub port: u8,
    pub message: String,
}

/// Create the feedback queue crossing from the pub/sub context into the
/// control loop. Unbounded, so pushes never wait on the consumer.
pub fn feedback_queue() -> (Sender<FeedbackMessage>, FeedbackReceiver) {
    let (tx, rx) = unbounded();
    (tx, FeedbackReceiver { rx })
}

/// Consumer end of the feedback queue. Owned by the control loop.
pub struct FeedbackReceiver {
    rx: Receiver<FeedbackMessage>,
}

impl FeedbackReceiver {
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Block until a message is available, then drain the queue and return
    /// only the most recent one. `None` once every producer is gone and the
    /// queue is empty.
    pub fn recv_latest(&self) -> Option<FeedbackMessage> {
        let first = self.rx.recv().ok()?;
        Some(self.drain_onto(first))
    }

    /// Non-blocking variant of [`recv_latest`](Self::recv_latest).
    pub fn try_recv_latest(&self) -> Option<FeedbackMessage> {
        match self.rx.try_recv() {
            Ok(first) => Some(self.drain_onto(first)),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    fn drain_onto(&self, first: FeedbackMessage) -> FeedbackMessage {
        let mut discarded = 0usize;
        let latest = self.rx.try_iter().fold(first, |_, next| {
            discarded += 1;
            next
        });
        if discarded > 0 {
            debug!(discarded, "stale feedback discarded");
        }
        latest
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Queued,
    OtherDevice,
    Malformed,
    QueueClosed,
}

/// Callback side of the feedback path: parses each pub/sub payload, logs it
/// and forwards matches for the local device into the queue.
pub struct FeedbackIngestor {
    device_addr: String,
    tx: Sender<FeedbackMessage>,
    raw_log: Option<RawTelemetryLog>,
}

impl FeedbackIngestor {
    pub fn new(device_addr: impl Into<String>, tx: Sender<FeedbackMessage>) -> Self {
        Self {
            device_addr: device_addr.into(),
            tx,
            raw_log: None,
        }
    }

    pub fn with_raw_log(mut self, log: RawTelemetryLog) -> Self {
        self.raw_log = Some(log);
        self
    }

    pub fn handle_payload(&mut self, payload: &[u8]) -> IngestOutcome {
        let json: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(json) => json,
            Err(_) => {
                info!(payload = %String::from_utf8_lossy(payload), "non-JSON message dropped");
                return IngestOutcome::Malformed;
            }
        };

        if let Some(log) = &mut self.raw_log
            && let Err(e) = log.append(&json)
        {
            warn!(error = %e, "failed to record raw telemetry");
        }

        let message = match parse_feedback(&json) {
            Ok(message) => message,
            Err(e) => {
                info!(error = %e, "telemetry without usable link metrics dropped");
                return IngestOutcome::Malformed;
            }
        };

        // Network servers disagree on hex case for device addresses.
        if !message.dev_addr.eq_ignore_ascii_case(&self.device_addr) {
            debug!(dev_addr = %message.dev_addr, "telemetry for another device ignored");
            return IngestOutcome::OtherDevice;
        }

        debug!(snr = message.snr, gateway = %message.gateway, "feedback queued");
        match self.tx.send(message) {
            Ok(()) => IngestOutcome::Queued,
            Err(_) => IngestOutcome::QueueClosed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(snr: f64) -> FeedbackMessage {
        FeedbackMessage {
            dev_addr: "260B1234".into(),
            snr,
            gateway: "gw".into(),
        }
    }

    #[test]
    fn drain_keeps_only_the_latest_message() {
        let (tx, rx) = feedback_queue();
        for snr in [1.0, 2.0, 3.0] {
            tx.send(message(snr)).unwrap();
        }

        assert_eq!(rx.recv_latest().unwrap().snr, 3.0);
        assert!(rx.is_empty());
        assert!(rx.try_recv_latest().is_none());
    }

    #[test]
    fn recv_latest_returns_none_when_producers_are_gone() {
        let (tx, rx) = feedback_queue();
        drop(tx);
        assert!(rx.recv_latest().is_none());
    }

    #[test]
    fn recv_latest_waits_for_a_producer_thread() {
        let (tx, rx) = feedback_queue();
        let producer = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            tx.send(message(-4.0)).unwrap();
        });

        assert_eq!(rx.recv_latest().unwrap().snr, -4.0);
        producer.join().unwrap();
    }

    #[test]
    fn ingestor_filters_by_device_address() {
        let (tx, rx) = feedback_queue();
        let mut ingestor = FeedbackIngestor::new("260b1234", tx);

        let ours = br#"{"devaddr":"260B1234","best_gw":{"lsnr":2.5,"desc":"gw-a"}}"#;
        let theirs = br#"{"devaddr":"26011111","best_gw":{"lsnr":9.0,"desc":"gw-a"}}"#;

        assert_eq!(ingestor.handle_payload(theirs), IngestOutcome::OtherDevice);
        assert_eq!(ingestor.handle_payload(ours), IngestOutcome::Queued);
        assert_eq!(rx.try_recv_latest().unwrap().snr, 2.5);
    }

    #[test]
    fn ingestor_drops_malformed_payloads() {
        let (tx, rx) = feedback_queue();
        let mut ingestor = FeedbackIngestor::new("260B1234", tx);

        assert_eq!(ingestor.handle_payload(b"\x00\x01"), IngestOutcome::Malformed);
        assert_eq!(
            ingestor.handle_payload(br#"{"devaddr":"260B1234"}"#),
            IngestOutcome::Malformed
        );
        assert!(rx.is_empty());
    }

    #[test]
    fn ingestor_records_every_json_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.txt");
        let (tx, _rx) = feedback_queue();
        let mut ingestor = FeedbackIngestor::new("260B1234", tx)
            .with_raw_log(RawTelemetryLog::open(&path).unwrap());

        ingestor.handle_payload(br#"{"devaddr":"26011111","best_gw":{"lsnr":1}}"#);
        ingestor.handle_payload(br#"{"status":"up"}"#);
        ingestor.handle_payload(b"nope");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
