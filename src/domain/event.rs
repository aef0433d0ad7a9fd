//! Queue telemetry envelope and validation
//!
//! Wire format (one JSON object per MQTT message):
//!
//! ```json
//! {
//!   "event_id": "evt-001",
//!   "event_type": "queue_update",
//!   "timestamp": "2025-10-08T18:05:00Z",
//!   "location_type": "TOILET",
//!   "location_id": "toilet_norte_1",
//!   "location": {"x": 12.5, "y": 40.0},
//!   "queue_length": 3,
//!   "avg_service_time": 2.0
//! }
//! ```

use crate::domain::error::ValidationError;
use crate::domain::types::{EventId, Location, LocationId, LocationType, QueueEvent};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};

/// The only event kind this pipeline consumes
pub const QUEUE_UPDATE_EVENT_TYPE: &str = "queue_update";

/// Event envelope as received from the bus, before any checks
#[derive(Debug, Default, Deserialize)]
pub struct RawQueueEvent {
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    /// Observation time - ISO 8601 string or epoch milliseconds
    #[serde(default, alias = "observed_at", deserialize_with = "deserialize_timestamp")]
    pub timestamp: TimestampValue,
    #[serde(default)]
    pub location_type: Option<String>,
    #[serde(default)]
    pub location_id: Option<String>,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub queue_length: Option<i64>,
    #[serde(default)]
    pub avg_service_time: Option<f64>,
}

/// Timestamp that can be either ISO 8601 string or epoch milliseconds
#[derive(Debug, Clone, Default, PartialEq)]
pub enum TimestampValue {
    #[default]
    None,
    IsoString(String),
    EpochMs(i64),
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<TimestampValue, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = TimestampValue;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or integer timestamp")
        }

        fn visit_str<E>(self, value: &str) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::IsoString(value.to_string()))
        }

        fn visit_string<E>(self, value: String) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::IsoString(value))
        }

        fn visit_u64<E>(self, value: u64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            i64::try_from(value)
                .map(TimestampValue::EpochMs)
                .map_err(|_| E::custom("epoch timestamp out of range"))
        }

        fn visit_i64<E>(self, value: i64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::EpochMs(value))
        }

        fn visit_unit<E>(self) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::None)
        }
    }

    deserializer.deserialize_any(TimestampVisitor)
}

/// Parse ISO 8601 / RFC 3339 text; a missing offset is read as UTC
fn parse_iso_time(time_str: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(time_str) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(time_str, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ValidationError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ValidationError::MissingField(field)),
    }
}

impl RawQueueEvent {
    /// Check the envelope and convert it into a typed event
    pub fn validate(self) -> Result<QueueEvent, ValidationError> {
        if let Some(event_type) = self.event_type.as_deref() {
            if event_type != QUEUE_UPDATE_EVENT_TYPE {
                return Err(ValidationError::UnsupportedEventType(event_type.to_string()));
            }
        }

        let event_id = required(self.event_id, "event_id")?;
        let location_id = required(self.location_id, "location_id")?;
        let location_type = required(self.location_type, "location_type")?;

        let raw_length = self.queue_length.ok_or(ValidationError::MissingField("queue_length"))?;
        let queue_length = u32::try_from(raw_length)
            .map_err(|_| ValidationError::InvalidQueueLength(raw_length.to_string()))?;

        let observed_at = match self.timestamp {
            TimestampValue::None => return Err(ValidationError::MissingField("timestamp")),
            TimestampValue::IsoString(s) => {
                parse_iso_time(&s).ok_or(ValidationError::InvalidTimestamp(s))?
            }
            TimestampValue::EpochMs(ms) => DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| ValidationError::InvalidTimestamp(ms.to_string()))?,
        };

        if let Some(minutes) = self.avg_service_time {
            if !minutes.is_finite() || minutes <= 0.0 {
                return Err(ValidationError::InvalidServiceTime(minutes));
            }
        }

        Ok(QueueEvent {
            event_id: EventId(event_id),
            location_type: LocationType::new(&location_type),
            location_id: LocationId(location_id),
            location: self.location,
            queue_length,
            observed_at,
            avg_service_time: self.avg_service_time,
        })
    }
}

/// Parse and validate a raw bus payload
pub fn validate(raw: &[u8]) -> Result<QueueEvent, ValidationError> {
    let envelope: RawQueueEvent = serde_json::from_slice(raw)
        .map_err(|e| ValidationError::MalformedPayload(e.to_string()))?;
    envelope.validate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const VALID: &str = r#"{
        "event_id": "evt-001",
        "event_type": "queue_update",
        "timestamp": "2025-10-08T18:05:00Z",
        "location_type": "toilet",
        "location_id": "L1",
        "location": {"x": 12.5, "y": 40.0},
        "queue_length": 3
    }"#;

    #[test]
    fn test_validate_full_event() {
        let event = validate(VALID.as_bytes()).unwrap();
        assert_eq!(event.event_id, EventId::from("evt-001"));
        assert_eq!(event.location_id, LocationId::from("L1"));
        assert_eq!(event.location_type.as_str(), "TOILET");
        assert_eq!(event.location, Some(Location { x: 12.5, y: 40.0 }));
        assert_eq!(event.queue_length, 3);
        assert_eq!(event.observed_at, Utc.with_ymd_and_hms(2025, 10, 8, 18, 5, 0).unwrap());
        assert_eq!(event.avg_service_time, None);
    }

    #[test]
    fn test_observed_at_alias_and_epoch_ms() {
        let json = r#"{"event_id":"e","location_type":"FOOD","location_id":"L2",
            "queue_length":0,"observed_at":1759946700000}"#;
        let event = validate(json.as_bytes()).unwrap();
        assert_eq!(event.observed_at.timestamp_millis(), 1_759_946_700_000);
    }

    #[test]
    fn test_naive_timestamp_is_utc() {
        let json = r#"{"event_id":"e","location_type":"BAR","location_id":"L3",
            "queue_length":1,"timestamp":"2025-10-08T18:05:00.250"}"#;
        let event = validate(json.as_bytes()).unwrap();
        assert_eq!(event.observed_at.timestamp_millis() % 1000, 250);
        assert_eq!(event.observed_at.timezone(), Utc);
    }

    #[test]
    fn test_offset_timestamp_normalized() {
        let json = r#"{"event_id":"e","location_type":"BAR","location_id":"L3",
            "queue_length":1,"timestamp":"2025-10-08T20:05:00+02:00"}"#;
        let event = validate(json.as_bytes()).unwrap();
        assert_eq!(event.observed_at, Utc.with_ymd_and_hms(2025, 10, 8, 18, 5, 0).unwrap());
    }

    #[test]
    fn test_negative_queue_length_rejected() {
        let json = r#"{"event_id":"e","location_type":"FOOD","location_id":"L2",
            "queue_length":-1,"timestamp":"2025-10-08T18:05:00Z"}"#;
        assert_eq!(
            validate(json.as_bytes()),
            Err(ValidationError::InvalidQueueLength("-1".to_string()))
        );
    }

    #[test]
    fn test_bad_timestamp_rejected() {
        let json = r#"{"event_id":"e","location_type":"FOOD","location_id":"L2",
            "queue_length":1,"timestamp":"yesterday"}"#;
        assert_eq!(
            validate(json.as_bytes()),
            Err(ValidationError::InvalidTimestamp("yesterday".to_string()))
        );
    }

    #[test]
    fn test_missing_fields_rejected() {
        let json = r#"{"event_id":"e","location_type":"FOOD","queue_length":1,
            "timestamp":"2025-10-08T18:05:00Z"}"#;
        assert_eq!(validate(json.as_bytes()), Err(ValidationError::MissingField("location_id")));

        let json = r#"{"event_id":"  ","location_type":"FOOD","location_id":"L2",
            "queue_length":1,"timestamp":"2025-10-08T18:05:00Z"}"#;
        assert_eq!(validate(json.as_bytes()), Err(ValidationError::MissingField("event_id")));

        let json = r#"{"event_id":"e","location_type":"FOOD","location_id":"L2","queue_length":1}"#;
        assert_eq!(validate(json.as_bytes()), Err(ValidationError::MissingField("timestamp")));
    }

    #[test]
    fn test_non_positive_service_time_rejected() {
        let json = r#"{"event_id":"e","location_type":"FOOD","location_id":"L2",
            "queue_length":1,"timestamp":"2025-10-08T18:05:00Z","avg_service_time":0}"#;
        assert_eq!(validate(json.as_bytes()), Err(ValidationError::InvalidServiceTime(0.0)));
    }

    #[test]
    fn test_other_event_types_rejected() {
        let json = r#"{"event_id":"e","event_type":"gate_open","location_type":"FOOD",
            "location_id":"L2","queue_length":1,"timestamp":"2025-10-08T18:05:00Z"}"#;
        assert_eq!(
            validate(json.as_bytes()),
            Err(ValidationError::UnsupportedEventType("gate_open".to_string()))
        );
    }

    #[test]
    fn test_unknown_location_type_accepted() {
        let json = r#"{"event_id":"e","location_type":"KIOSK","location_id":"K1",
            "queue_length":2,"timestamp":"2025-10-08T18:05:00Z"}"#;
        let event = validate(json.as_bytes()).unwrap();
        assert_eq!(event.location_type.as_str(), "KIOSK");
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(validate(b"not json"), Err(ValidationError::MalformedPayload(_))));
    }
}
