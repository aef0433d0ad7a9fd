//! MQTT ingress for queue telemetry
//!
//! Subscribes at QoS 1 with manual acknowledgement. Each publish is handed to
//! the worker pool as an `InboundMessage` that carries its own ack handle; the
//! worker acks once the message is handled.
//!
//! A broker only redelivers un-acked QoS 1 messages when a session resumes,
//! and un-acked messages hold its inflight window. A message the worker gives
//! up on after local retries is therefore released: it stays un-acked and
//! the ingress drops the connection once, so the persistent session
//! redelivers it on reconnect.

use crate::infra::config::Config;
use crate::infra::health::Health;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, Publish, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// One bus message waiting for a worker
#[derive(Debug)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: Instant,
    ack: Option<AckHandle>,
}

#[derive(Debug)]
struct AckHandle {
    session: Arc<Session>,
    publish: Publish,
}

/// The live ingress connection as seen by workers
#[derive(Debug)]
struct Session {
    client: AsyncClient,
    health: Arc<Health>,
    /// A disconnect was requested and no ConnAck has arrived since
    reset_pending: AtomicBool,
}

impl Session {
    async fn request_redelivery(&self) {
        self.health.record_unacked();
        if self.reset_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("mqtt_session_reset_requested");
        if let Err(e) = self.client.disconnect().await {
            error!(error = %e, "mqtt_session_reset_failed");
        }
    }

    fn resumed(&self) {
        self.reset_pending.store(false, Ordering::Release);
        self.health.clear_unacked();
    }
}

impl InboundMessage {
    /// Message with no broker behind it (replay, tests)
    pub fn detached(topic: &str, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.to_string(),
            payload: payload.into(),
            received_at: Instant::now(),
            ack: None,
        }
    }

    fn from_publish(session: &Arc<Session>, publish: Publish) -> Self {
        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            received_at: Instant::now(),
            ack: Some(AckHandle { session: session.clone(), publish }),
        }
    }

    /// Acknowledge to the broker; a no-op for detached messages
    pub async fn ack(self) {
        if let Some(handle) = self.ack {
            if let Err(e) = handle.session.client.ack(&handle.publish).await {
                warn!(topic = %self.topic, error = %e, "mqtt_ack_failed");
            }
        }
    }

    /// Leave the message un-acked and reset the session so the broker
    /// redelivers it; a no-op for detached messages
    pub async fn release(self) {
        if let Some(handle) = self.ack {
            handle.session.request_redelivery().await;
        }
    }
}

/// Connection options for the ingress session
pub fn ingress_options(config: &Config) -> MqttOptions {
    let mut mqttoptions =
        MqttOptions::new(config.mqtt_client_id(), config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    // Persistent session so un-acked messages are redelivered after reconnect
    mqttoptions.set_clean_session(false);
    mqttoptions.set_manual_acks(true);

    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }
    mqttoptions
}

/// Hand one message to the workers. A closed worker channel means nothing is
/// consuming any more, so readiness is cleared before reporting it.
async fn dispatch(
    message_tx: &mpsc::Sender<InboundMessage>,
    message: InboundMessage,
    health: &Health,
) -> bool {
    if message_tx.send(message).await.is_ok() {
        return true;
    }
    health.set_connected(false);
    warn!("mqtt_worker_channel_closed");
    false
}

/// Start the MQTT client and forward messages to the workers
///
/// Uses `send().await` so a full worker channel pauses polling instead of
/// dropping QoS 1 messages.
pub async fn start_mqtt_client(
    config: &Config,
    message_tx: mpsc::Sender<InboundMessage>,
    health: Arc<Health>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (client, mut eventloop) = AsyncClient::new(ingress_options(config), 100);
    client.subscribe(config.mqtt_topic(), QoS::AtLeastOnce).await?;
    let session = Arc::new(Session {
        client: client.clone(),
        health: health.clone(),
        reset_pending: AtomicBool::new(false),
    });

    info!(
        topic = %config.mqtt_topic(),
        host = %config.mqtt_host(),
        port = %config.mqtt_port(),
        "mqtt_subscribed"
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    health.set_connected(false);
                    let _ = client.disconnect().await;
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        health.record_message();
                        debug!(
                            topic = %publish.topic,
                            bytes = %publish.payload.len(),
                            "mqtt_message"
                        );
                        let message = InboundMessage::from_publish(&session, publish);

                        tokio::select! {
                            _ = shutdown.changed() => {
                                // Left un-acked; the broker redelivers it
                                info!("mqtt_shutdown");
                                health.set_connected(false);
                                let _ = client.disconnect().await;
                                return Ok(());
                            }
                            sent = dispatch(&message_tx, message, &health) => {
                                if !sent {
                                    let _ = client.disconnect().await;
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                        session.resumed();
                        health.set_connected(true);
                        info!(session_present = %connack.session_present, "mqtt_connected");
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        // Requested by a worker; the next poll error reconnects
                        health.set_connected(false);
                        info!("mqtt_session_reset");
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        health.set_connected(false);
                        warn!("mqtt_disconnected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        health.set_connected(false);
                        error!(error = %e, "mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}
