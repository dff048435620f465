//! Detection subscriber.
//!
//! Holds one rumqttc v5 connection to the broker, subscribed to the detector's
//! result topic. Each publish replaces the detection store and, when viewers are
//! attached, is forwarded to the event bus. The network loop runs on its own
//! thread; a connection error clears the MQTT flag and the loop backs off before
//! letting rumqttc reconnect.

use anyhow::{Context, Result};
use rumqttc::v5::mqttbytes::v5::ConnectReturnCode;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, Event, Incoming, MqttOptions};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::tls::{MqttEndpoint, TlsMaterials};
use crate::detect::{DetectionBatch, DetectionStore};
use crate::events::EventBus;
use crate::session::StreamStatus;

const REQUEST_CHANNEL_CAPACITY: usize = 10;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Everything needed to open the broker connection.
#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub endpoint: MqttEndpoint,
    pub topic: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub reconnect_backoff: Duration,
    pub tls: TlsMaterials,
}

pub struct MqttSubscriber {
    settings: MqttSettings,
    store: Arc<DetectionStore>,
    events: EventBus,
    status: Arc<StreamStatus>,
}

/// A running subscriber thread plus the client used to stop it.
pub struct MqttHandle {
    client: Client,
    thread: JoinHandle<()>,
}

impl MqttHandle {
    /// Ask the broker connection to close and wait for the thread to exit.
    ///
    /// The session's running flag must already be false.
    pub fn shutdown(self) {
        if let Err(e) = self.client.try_disconnect() {
            log::debug!("mqtt: disconnect request not queued: {}", e);
        }
        if self.thread.join().is_err() {
            log::error!("mqtt: subscriber thread panicked");
        }
    }
}

impl MqttSubscriber {
    pub fn new(
        settings: MqttSettings,
        store: Arc<DetectionStore>,
        events: EventBus,
        status: Arc<StreamStatus>,
    ) -> Self {
        Self {
            settings,
            store,
            events,
            status,
        }
    }

    /// Build the client and start the network loop thread.
    ///
    /// Fails only on local misconfiguration (TLS material); an unreachable
    /// broker is retried in the background.
    pub fn spawn(self) -> Result<MqttHandle> {
        let mut options = MqttOptions::new(
            &self.settings.client_id,
            &self.settings.endpoint.host,
            self.settings.endpoint.port,
        );
        options.set_keep_alive(self.settings.keep_alive);
        options.set_clean_start(true);
        if let Some(user) = &self.settings.username {
            options.set_credentials(user, self.settings.password.clone().unwrap_or_default());
        }
        options.set_transport(self.settings.tls.build_transport(&self.settings.endpoint)?);

        let (client, connection) = Client::new(options, REQUEST_CHANNEL_CAPACITY);
        log::info!(
            "mqtt: connecting to {} (topic {}, auth: {})",
            self.settings.endpoint,
            self.settings.topic,
            self.settings.username.is_some()
        );

        let loop_client = client.clone();
        let thread = std::thread::Builder::new()
            .name("mqtt-subscriber".to_string())
            .spawn(move || self.run(loop_client, connection))
            .context("spawn MQTT subscriber thread")?;

        Ok(MqttHandle { client, thread })
    }

    fn run(self, client: Client, mut connection: Connection) {
        for event in connection.iter() {
            if !self.status.is_running() {
                break;
            }
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        self.on_connected(&client);
                    } else {
                        log::warn!("mqtt: broker refused connection: {:?}", ack.code);
                        self.status.set_mqtt_connected(false);
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    if let Err(e) = self.handle_message(&publish.payload) {
                        log::warn!("mqtt: dropping detector message: {:#}", e);
                    }
                }
                Ok(Event::Incoming(Incoming::Disconnect(_))) => {
                    log::warn!("mqtt: broker closed the session");
                    self.status.set_mqtt_connected(false);
                }
                Ok(_) => {}
                Err(e) => {
                    if !self.status.is_running() {
                        break;
                    }
                    log::warn!(
                        "mqtt: connection error: {}. Reconnecting in {:?}",
                        e,
                        self.settings.reconnect_backoff
                    );
                    self.status.set_mqtt_connected(false);
                    self.pause();
                }
            }
        }
        self.status.set_mqtt_connected(false);
        log::info!("mqtt: subscriber stopped");
    }

    fn on_connected(&self, client: &Client) {
        // Clean sessions drop subscriptions, so subscribe on every ConnAck.
        match client.try_subscribe(self.settings.topic.as_str(), QoS::AtMostOnce) {
            Ok(()) => log::info!("mqtt: subscribed to {}", self.settings.topic),
            Err(e) => log::error!("mqtt: subscribe to {} failed: {}", self.settings.topic, e),
        }
        self.status.set_mqtt_connected(true);
    }

    /// Apply one detector payload: replace the store and notify viewers.
    ///
    /// A payload that does not decode leaves the store untouched.
    pub fn handle_message(&self, payload: &[u8]) -> Result<usize> {
        let batch = DetectionBatch::from_payload(payload)?;
        let count = self.store.replace(batch);
        log::debug!("mqtt: {} detections", count);
        self.events.publish_detections(&self.store.snapshot());
        Ok(count)
    }

    fn pause(&self) {
        let deadline = Instant::now() + self.settings.reconnect_backoff;
        while self.status.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(STOP_POLL_INTERVAL.min(deadline - now));
        }
    }
}
