//! MQTT publisher for egress events
//!
//! Publishes detector events to per-floor MQTT topics:
//! - {prefix}/{floor_id}/detection - Detection results (QoS 0)
//! - {prefix}/{floor_id}/session - Session lifecycle events (QoS 1)

use crate::domain::types::FloorId;
use crate::infra::config::Config;
use crate::io::egress_channel::EgressMessage;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Topic for one floor's detection results
pub fn detection_topic(prefix: &str, floor_id: FloorId) -> String {
    format!("{prefix}/{floor_id}/detection")
}

/// Topic for one floor's session lifecycle events
pub fn session_topic(prefix: &str, floor_id: FloorId) -> String {
    format!("{prefix}/{floor_id}/session")
}

/// MQTT publisher actor
///
/// Receives messages from the egress channel and publishes to MQTT topics.
pub struct MqttPublisher {
    client: AsyncClient,
    rx: mpsc::Receiver<EgressMessage>,
    topic_prefix: String,
}

impl MqttPublisher {
    /// Create a new MQTT publisher
    ///
    /// Connects to the broker at the configured MQTT host/port.
    pub fn new(config: &Config, rx: mpsc::Receiver<EgressMessage>) -> Self {
        let client_id = format!("freespot-egress-{}", std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_egress_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_egress_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_egress_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self { client, rx, topic_prefix: config.mqtt_topic_prefix().to_string() }
    }

    /// Run the publisher loop until shutdown, then drain what is queued
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(prefix = %self.topic_prefix, "mqtt_egress_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mqtt_egress_shutdown");
                        while let Ok(msg) = self.rx.try_recv() {
                            self.publish_message(msg).await;
                        }
                        return;
                    }
                }
                msg = self.rx.recv() => {
                    match msg {
                        Some(msg) => self.publish_message(msg).await,
                        None => {
                            info!("mqtt_egress_channel_closed");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn publish_message(&self, msg: EgressMessage) {
        match msg {
            EgressMessage::Detection(payload) => {
                // Results are superseded every interval, fire-and-forget
                let topic = detection_topic(&self.topic_prefix, payload.floor_id);
                if let Err(e) =
                    self.client.publish(&topic, QoS::AtMostOnce, false, payload.json.into_bytes()).await
                {
                    debug!(error = %e, floor_id = %payload.floor_id, "mqtt_egress_detection_failed");
                }
            }
            EgressMessage::SessionEvent(payload) => {
                let topic = session_topic(&self.topic_prefix, payload.floor_id);
                match serde_json::to_vec(&payload) {
                    Ok(json) => {
                        if let Err(e) =
                            self.client.publish(&topic, QoS::AtLeastOnce, false, json).await
                        {
                            error!(error = %e, floor_id = %payload.floor_id, "mqtt_egress_session_failed");
                        }
                    }
                    Err(e) => error!(error = %e, "mqtt_egress_serialize_failed"),
                }
            }
        }
    }
}
