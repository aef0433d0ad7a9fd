//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `mqtt` - MQTT ingress for queue telemetry (QoS 1, manual acks)
//! - `mqtt_egress` - MQTT publisher for wait-time updates and snapshots
//! - `egress_channel` - Typed channel between the consumer and the publisher
//! - `persistence` - State backends (memory, JSONL file)
//! - `http` - HTTP read API, health and Prometheus metrics

pub mod egress_channel;
pub mod http;
pub mod mqtt;
pub mod mqtt_egress;
pub mod persistence;

// Re-export commonly used types
pub use egress_channel::{create_state_channel, StatePublisher, WaitTimeUpdate};
pub use mqtt::InboundMessage;
pub use mqtt_egress::MqttPublisher;
pub use persistence::{JsonlBackend, MemoryBackend, StateBackend};
