//! MQTT publisher for wait-time egress
//!
//! Publishes committed queue state for downstream consumers:
//! - `<updates_topic>/<location_id>` - per-location `WaitTimeUpdate` (QoS 1)
//! - `<snapshot_topic>` - periodic full table, retained (QoS 0)
//!
//! Updates whose estimate barely moved are suppressed by `ChangeFilter`.

use crate::domain::{LocationId, QueueState};
use crate::infra::config::Config;
use crate::infra::metrics::IngestMetrics;
use crate::io::egress_channel::{SnapshotPayload, WaitTimeUpdate};
use crate::services::store::QueueStateStore;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// An estimate that was 0 is re-published once it exceeds this many minutes
const FROM_ZERO_THRESHOLD_MINUTES: f64 = 0.5;

/// Significant-change filter keyed by location
pub struct ChangeFilter {
    min_change_pct: f64,
    last_published: FxHashMap<LocationId, f64>,
}

impl ChangeFilter {
    pub fn new(min_change_pct: f64) -> Self {
        Self { min_change_pct, last_published: FxHashMap::default() }
    }

    /// Decide whether `state` is worth publishing; records it if so
    pub fn should_publish(&mut self, state: &QueueState) -> bool {
        let new = state.estimated_wait_minutes;
        let publish = match self.last_published.get(&state.location_id) {
            None => true,
            Some(&old) if old == 0.0 => new > FROM_ZERO_THRESHOLD_MINUTES,
            Some(&old) => ((new - old).abs() / old) * 100.0 >= self.min_change_pct,
        };
        if publish {
            self.last_published.insert(state.location_id.clone(), new);
        }
        publish
    }
}

/// MQTT publisher actor
///
/// Receives committed rows from the state channel and publishes to MQTT.
pub struct MqttPublisher {
    client: AsyncClient,
    rx: mpsc::Receiver<QueueState>,
    store: Arc<QueueStateStore>,
    metrics: Arc<IngestMetrics>,
    filter: ChangeFilter,
    site_id: String,
    updates_topic: String,
    snapshot_topic: String,
    snapshot_interval: Option<Duration>,
}

impl MqttPublisher {
    /// Create a new MQTT publisher
    ///
    /// Connects to the broker at the configured MQTT host/port.
    pub fn new(
        config: &Config,
        rx: mpsc::Receiver<QueueState>,
        store: Arc<QueueStateStore>,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        let client_id = format!("{}-egress-{}", config.mqtt_client_id(), std::process::id());
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

        let secs = config.publisher_snapshot_interval_secs();
        Self {
            client,
            rx,
            store,
            metrics,
            filter: ChangeFilter::new(config.publisher_min_change_pct()),
            site_id: config.site_id().to_string(),
            updates_topic: config.publisher_updates_topic().to_string(),
            snapshot_topic: config.publisher_snapshot_topic().to_string(),
            snapshot_interval: (secs > 0).then(|| Duration::from_secs(secs)),
        }
    }

    /// Run the publisher loop until shutdown, then drain what is queued
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            updates = %self.updates_topic,
            snapshot = %self.snapshot_topic,
            snapshot_interval_secs = ?self.snapshot_interval.map(|d| d.as_secs()),
            min_change_pct = %self.filter.min_change_pct,
            "mqtt_egress_started"
        );

        let mut snapshot_timer = self.snapshot_interval.map(|period| {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mqtt_egress_shutdown");
                        let mut drained = 0usize;
                        while let Ok(state) = self.rx.try_recv() {
                            self.publish_update(state).await;
                            drained += 1;
                        }
                        debug!(drained = %drained, "mqtt_egress_drained");
                        let _ = self.client.disconnect().await;
                        return;
                    }
                }
                Some(state) = self.rx.recv() => {
                    self.publish_update(state).await;
                }
                _ = next_tick(&mut snapshot_timer) => {
                    self.publish_snapshot().await;
                }
            }
        }
    }

    async fn publish_update(&mut self, state: QueueState) {
        if !self.filter.should_publish(&state) {
            self.metrics.record_publish_suppressed();
            debug!(
                location_id = %state.location_id,
                minutes = %state.estimated_wait_minutes,
                "waittime_update_suppressed"
            );
            return;
        }

        let payload = WaitTimeUpdate::from_state(&state);
        let json = match serde_json::to_vec(&payload) {
            Ok(json) => json,
            Err(e) => {
                warn!(location_id = %state.location_id, error = %e, "waittime_encode_failed");
                return;
            }
        };

        let topic = format!("{}/{}", self.updates_topic, state.location_id);
        match self.client.publish(topic, QoS::AtLeastOnce, false, json).await {
            Ok(()) => {
                self.metrics.record_published();
                debug!(
                    location_id = %state.location_id,
                    minutes = %payload.minutes,
                    "waittime_published"
                );
            }
            Err(e) => {
                self.metrics.record_publish_failed();
                warn!(location_id = %state.location_id, error = %e, "waittime_publish_failed");
            }
        }
    }

    async fn publish_snapshot(&self) {
        let locations: Vec<WaitTimeUpdate> =
            self.store.snapshot_all().iter().map(WaitTimeUpdate::from_state).collect();
        let count = locations.len();
        let payload = SnapshotPayload { site: self.site_id.clone(), ts: Utc::now(), locations };

        if let Ok(json) = serde_json::to_vec(&payload) {
            if let Err(e) =
                self.client.publish(&self.snapshot_topic, QoS::AtMostOnce, true, json).await
            {
                debug!(error = %e, "waittime_snapshot_failed");
            } else {
                debug!(locations = %count, "waittime_snapshot_published");
            }
        }
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
