//! Shared types for the wait-time service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Newtype wrapper for location IDs to provide type safety
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(pub String);

impl std::fmt::Display for LocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LocationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Newtype wrapper for event IDs (the dedup key)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Location category (TOILET, FOOD, BAR, ...)
///
/// Always stored upper-cased so config keys and wire values compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationType(String);

impl LocationType {
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LocationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 2-D venue coordinate, metadata only
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
}

/// A validated queue-length observation
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEvent {
    pub event_id: EventId,
    pub location_type: LocationType,
    pub location_id: LocationId,
    pub location: Option<Location>,
    pub queue_length: u32,
    pub observed_at: DateTime<Utc>,
    /// Per-person service minutes override; `None` means "use carried or default value"
    pub avg_service_time: Option<f64>,
}

/// Authoritative per-location queue state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    pub location_id: LocationId,
    pub location_type: LocationType,
    #[serde(default)]
    pub location: Option<Location>,
    pub queue_length: u32,
    /// Queue length after smoothing; equals `queue_length` when smoothing is off
    pub smoothed_queue_length: f64,
    pub avg_service_time: f64,
    pub estimated_wait_minutes: f64,
    pub last_event_id: EventId,
    pub last_observed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueState {
    /// Build the row that replaces the current one after an accepted event.
    ///
    /// `location` is carried forward when the event does not report one.
    pub fn from_event(
        event: &QueueEvent,
        previous: Option<&QueueState>,
        avg_service_time: f64,
        smoothed_queue_length: f64,
        estimated_wait_minutes: f64,
        updated_at: DateTime<Utc>,
    ) -> Self {
        let location = event.location.or_else(|| previous.and_then(|p| p.location));
        Self {
            location_id: event.location_id.clone(),
            location_type: event.location_type.clone(),
            location,
            queue_length: event.queue_length,
            smoothed_queue_length,
            avg_service_time,
            estimated_wait_minutes,
            last_event_id: event.event_id.clone(),
            last_observed_at: event.observed_at,
            updated_at,
        }
    }
}
