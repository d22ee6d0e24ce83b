//! Broker subscription feeding the feedback queue.
//!
//! The rumqttc connection is driven on its own thread; every publish is
//! handed to a [`FeedbackIngestor`]. The subscription is renewed on every
//! ConnAck so a reconnect after a broker restart keeps receiving.

use crossbeam_channel::bounded;
use rumqttc::{Client, Event, MqttOptions, Outgoing, Packet, QoS};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{MQTT_RETRY_DELAY_MS, MqttSettings};
use crate::error::FeedbackError;
use crate::telemetry::{FeedbackIngestor, IngestOutcome};

pub fn mqtt_options(settings: &MqttSettings) -> MqttOptions {
    let mut opts = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    opts.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
    if let Some(username) = &settings.username {
        opts.set_credentials(username, settings.password.clone().unwrap_or_default());
    }
    opts
}

/// Running subscription. Dropping it leaves the thread running; call
/// [`stop`](Self::stop) for an orderly disconnect.
pub struct FeedbackListener {
    client: Client,
    handle: JoinHandle<()>,
}

impl FeedbackListener {
    /// Connect and subscribe, blocking until the first ConnAck or until
    /// `max_connect_attempts` consecutive attempts have failed.
    pub fn start(settings: &MqttSettings, ingestor: FeedbackIngestor) -> Result<Self, FeedbackError> {
        Self::spawn(
            settings,
            ingestor,
            Duration::from_millis(MQTT_RETRY_DELAY_MS),
        )
    }

    fn spawn(
        settings: &MqttSettings,
        mut ingestor: FeedbackIngestor,
        retry_delay: Duration,
    ) -> Result<Self, FeedbackError> {
        let (client, mut connection) = Client::new(mqtt_options(settings), 10);
        let (ready_tx, ready_rx) = bounded::<Result<(), FeedbackError>>(1);

        let subscriber = client.clone();
        let topic = settings.topic.clone();
        let host = settings.host.clone();
        let port = settings.port;
        let max_attempts = settings.max_connect_attempts.max(1);

        info!(%host, port, %topic, "connecting to broker");
        let handle = thread::Builder::new()
            .name("feedback-mqtt".to_string())
            .spawn(move || {
                let mut connected = false;
                let mut failures = 0u32;

                for event in connection.iter() {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!(%topic, "broker connected, subscribing");
                            if let Err(e) = subscriber.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                                warn!(error = %e, "subscribe request failed");
                            }
                            if !connected {
                                connected = true;
                                let _ = ready_tx.send(Ok(()));
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(p))) => {
                            debug!(topic = %p.topic, bytes = p.payload.len(), "publish received");
                            if ingestor.handle_payload(&p.payload) == IngestOutcome::QueueClosed {
                                info!("feedback consumer gone, stopping subscription");
                                break;
                            }
                        }
                        Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                        Ok(_) => {}
                        Err(e) if !connected => {
                            failures += 1;
                            warn!(attempt = failures, max_attempts, error = %e, "broker connection failed");
                            if failures >= max_attempts {
                                let _ = ready_tx.send(Err(FeedbackError::Connect {
                                    host: host.clone(),
                                    port,
                                    attempts: failures,
                                    reason: e.to_string(),
                                }));
                                break;
                            }
                            thread::sleep(retry_delay);
                        }
                        Err(e) => {
                            warn!(error = %e, "broker connection lost, reconnecting");
                            thread::sleep(retry_delay);
                        }
                    }
                }
                debug!("broker event loop finished");
            })
            .map_err(|e| FeedbackError::Connect {
                host: settings.host.clone(),
                port: settings.port,
                attempts: 0,
                reason: e.to_string(),
            })?;

        let ready = ready_rx.recv().unwrap_or_else(|_| {
            Err(FeedbackError::Connect {
                host: settings.host.clone(),
                port: settings.port,
                attempts: 0,
                reason: "broker thread exited before connecting".to_string(),
            })
        });
        ready?;

        Ok(Self { client, handle })
    }

    pub fn stop(self) -> Result<(), FeedbackError> {
        self.client.disconnect()?;
        if self.handle.join().is_err() {
            warn!("broker thread panicked");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::feedback_queue;
    use std::net::TcpListener;

    #[test]
    fn options_follow_settings() {
        let settings = MqttSettings {
            host: "broker.local".into(),
            port: 8883,
            keep_alive_secs: 30,
            client_id: "agent-1".into(),
            ..MqttSettings::default()
        };
        let opts = mqtt_options(&settings);

        assert_eq!(opts.broker_address(), ("broker.local".to_string(), 8883));
        assert_eq!(opts.keep_alive(), Duration::from_secs(30));
        assert_eq!(opts.client_id(), "agent-1");
        assert_eq!(opts.credentials(), None);
    }

    #[test]
    fn username_without_password_still_logs_in() {
        let settings = MqttSettings {
            username: Some("agent".into()),
            ..MqttSettings::default()
        };
        assert_eq!(
            mqtt_options(&settings).credentials(),
            Some(("agent".to_string(), String::new()))
        );

        let settings = MqttSettings {
            username: Some("agent".into()),
            password: Some("secret".into()),
            ..MqttSettings::default()
        };
        assert_eq!(
            mqtt_options(&settings).credentials(),
            Some(("agent".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn unreachable_broker_fails_after_max_attempts() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let settings = MqttSettings {
            host: "127.0.0.1".into(),
            port,
            max_connect_attempts: 2,
            ..MqttSettings::default()
        };
        let (tx, _rx) = feedback_queue();

        let result = FeedbackListener::spawn(
            &settings,
            FeedbackIngestor::new("260B1234", tx),
            Duration::from_millis(10),
        );

        match result {
            Err(FeedbackError::Connect { attempts, port: p, .. }) => {
                assert_eq!(attempts, 2);
                assert_eq!(p, port);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connected to a closed port"),
        }
    }
}
