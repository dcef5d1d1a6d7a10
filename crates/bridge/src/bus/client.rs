// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! BUS Bridge: the bridge's connection to the MQTT broker.
//!
//! Owns the single broker connection: connects with a last-will-and-testament
//! publishing `offline` retained, subscribes to the four command topic
//! patterns (re-subscribing on every reconnect, since `rumqttc`'s automatic
//! reconnection does not replay subscriptions on its own), and exposes
//! typed publish helpers for status/device/scene/error topics.

use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS, Transport};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::MqttConfig;
use crate::error::{BridgeError, ErrorRecord};
use crate::registry::{Device, Scene};
use crate::util::epoch_ms;

use super::topics;

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// A `(topic, payload)` pair delivered from a subscribed topic.
pub struct IncomingMessage {
    pub topic: String,
    pub payload: String,
}

/// Handle to the BUS connection. Publish methods are cheap clones of the
/// underlying `rumqttc` client handle; the event loop runs in its own task.
pub struct BusClient {
    client: AsyncClient,
    prefix: String,
    retain: bool,
    qos: QoS,
}

impl BusClient {
    /// Connect to the broker, set up the LWT, and spawn the event-loop task.
    /// Returns the client handle and a channel carrying incoming command
    /// messages on the subscribed topics.
    pub fn connect(config: &MqttConfig, cancel: CancellationToken) -> (Self, mpsc::Receiver<IncomingMessage>) {
        let client_id = format!("{}-plugin-{}", config.topic_prefix, epoch_ms());
        let qos = qos_from_u8(config.qos);

        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(std::time::Duration::from_secs(30));
        if let Some(username) = &config.username {
            options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
        }
        if config.tls {
            options.set_transport(Transport::Tls(rumqttc::TlsConfiguration::Native));
        }
        options.set_last_will(LastWill::new(topics::status_topic(&config.topic_prefix), "offline", qos, true));

        let (client, eventloop) = AsyncClient::new(options, 64);
        let (incoming_tx, incoming_rx) = mpsc::channel(256);

        tokio::spawn(run_event_loop(eventloop, client.clone(), config.topic_prefix.clone(), qos, incoming_tx, cancel));

        (Self { client, prefix: config.topic_prefix.clone(), retain: config.retain, qos }, incoming_rx)
    }

    pub async fn publish_status(&self, status: &str) -> Result<(), BridgeError> {
        self.publish(&topics::status_topic(&self.prefix), status, true).await
    }

    pub async fn publish_device(&self, device: &Device) -> Result<(), BridgeError> {
        let body = serde_json::to_vec(device).map_err(|e| BridgeError::bus(format!("device serialize failed: {e}")))?;
        self.publish_bytes(&topics::device_state_topic(&self.prefix, device.node_id), body, self.retain).await?;
        self.publish(&topics::device_position_topic(&self.prefix, device.node_id), &device.position.to_string(), self.retain)
            .await?;
        self.publish(&topics::device_moving_topic(&self.prefix, device.node_id), &device.moving.to_string(), self.retain)
            .await
    }

    pub async fn publish_scene(&self, scene: &Scene) -> Result<(), BridgeError> {
        let body = serde_json::to_vec(scene).map_err(|e| BridgeError::bus(format!("scene serialize failed: {e}")))?;
        self.publish_bytes(&topics::scene_state_topic(&self.prefix, scene.scene_id), body, self.retain).await
    }

    pub async fn publish_error(&self, record: &ErrorRecord) -> Result<(), BridgeError> {
        let body = serde_json::to_vec(record).map_err(|e| BridgeError::bus(format!("error record serialize failed: {e}")))?;
        self.publish_bytes(&topics::errors_topic(&self.prefix), body, false).await
    }

    /// Publish `status=offline` synchronously, then disconnect.
    pub async fn close(&self) {
        let _ = self.publish_status("offline").await;
        let _ = self.client.disconnect().await;
    }

    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), BridgeError> {
        self.publish_bytes(topic, payload.as_bytes().to_vec(), retain).await
    }

    async fn publish_bytes(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BridgeError> {
        self.client
            .publish(topic, self.qos, retain, payload)
            .await
            .map_err(|e| BridgeError::bus(format!("publish to {topic} failed: {e}")))
    }
}

async fn run_event_loop(
    mut eventloop: rumqttc::EventLoop,
    client: AsyncClient,
    prefix: String,
    qos: QoS,
    incoming_tx: mpsc::Sender<IncomingMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        for topic in topics::subscriptions(&prefix) {
                            if let Err(e) = client.subscribe(&topic, qos).await {
                                tracing::warn!(topic, err = %e, "BUS subscribe failed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let topic = publish.topic.clone();
                        match std::str::from_utf8(&publish.payload) {
                            Ok(payload) => {
                                let _ = incoming_tx.send(IncomingMessage { topic, payload: payload.to_owned() }).await;
                            }
                            Err(_) => tracing::debug!(topic, "dropping non-UTF8 BUS payload"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(err = %e, "BUS event loop error, rumqttc will reconnect");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_from_u8_maps_known_values() {
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
        assert_eq!(qos_from_u8(9), QoS::AtLeastOnce);
    }
}
