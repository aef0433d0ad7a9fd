//! Typed channel for wait-time egress
//!
//! Provides a non-blocking way to hand committed queue state to the MQTT
//! publisher. Uses a bounded mpsc channel to prevent unbounded memory growth.

use crate::domain::{PublishError, QueueState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Wait-time update as published to downstream consumers
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WaitTimeUpdate {
    /// Message kind, always "waittime"
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Location id
    pub poi: String,
    pub location_type: String,
    /// Estimated wait, rounded to one decimal
    pub minutes: f64,
    pub queue_length: u32,
    /// Observation time of the event that produced this estimate
    pub ts: DateTime<Utc>,
}

impl WaitTimeUpdate {
    pub fn from_state(state: &QueueState) -> Self {
        Self {
            kind: "waittime",
            poi: state.location_id.0.clone(),
            location_type: state.location_type.as_str().to_string(),
            minutes: round_1(state.estimated_wait_minutes),
            queue_length: state.queue_length,
            ts: state.last_observed_at,
        }
    }
}

/// Periodic retained snapshot of every tracked location
#[derive(Debug, Serialize)]
pub struct SnapshotPayload {
    pub site: String,
    pub ts: DateTime<Utc>,
    pub locations: Vec<WaitTimeUpdate>,
}

#[inline]
fn round_1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Sender handle for committed state
///
/// Clone this to share across workers.
/// Non-blocking - if the channel is full the update is dropped and reported.
#[derive(Clone)]
pub struct StatePublisher {
    tx: Option<mpsc::Sender<QueueState>>,
}

impl StatePublisher {
    pub fn new(tx: mpsc::Sender<QueueState>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Publisher that accepts and discards every update
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Hand a committed row to the egress actor without waiting
    pub fn publish(&self, state: &QueueState) -> Result<(), PublishError> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        tx.try_send(state.clone()).map_err(|e| match e {
            TrySendError::Full(_) => PublishError::ChannelFull,
            TrySendError::Closed(_) => PublishError::ChannelClosed,
        })
    }
}

/// Create a new publisher channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
pub fn create_state_channel(buffer_size: usize) -> (StatePublisher, mpsc::Receiver<QueueState>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (StatePublisher::new(tx), rx)
}
