//! Error taxonomy for the ingestion pipeline
//!
//! Only `StoreError` is retryable. Everything else is handled where it
//! happens: counted, logged, and the stream moves on.

use thiserror::Error;

/// Malformed or out-of-range telemetry message
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("payload is not valid JSON: {0}")]
    MalformedPayload(String),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("queue_length must be a non-negative integer, got {0}")]
    InvalidQueueLength(String),

    #[error("avg_service_time must be positive, got {0}")]
    InvalidServiceTime(f64),

    #[error("unparseable timestamp `{0}`")]
    InvalidTimestamp(String),

    #[error("unsupported event_type `{0}`")]
    UnsupportedEventType(String),
}

/// Backing persistence failed; the event must be redelivered
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend row could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Downstream delivery failed; committed state is unaffected
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("publish channel full")]
    ChannelFull,

    #[error("publish channel closed")]
    ChannelClosed,
}

/// Per-event failure surfaced by the consumer
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid event: {0}")]
    Validation(#[from] ValidationError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl IngestError {
    /// Whether redelivering the same message may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_errors_are_retryable() {
        let validation = IngestError::from(ValidationError::MissingField("event_id"));
        let store = IngestError::from(StoreError::Unavailable("down".to_string()));
        assert!(!validation.is_retryable());
        assert!(store.is_retryable());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ValidationError::MissingField("location_id").to_string(),
            "missing required field `location_id`"
        );
        assert_eq!(PublishError::ChannelFull.to_string(), "publish channel full");
    }
}
