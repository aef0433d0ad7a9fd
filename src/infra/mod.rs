//! Infrastructure - configuration, metrics, and health
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `metrics` - Lock-free metrics collection
//! - `health` - Bus connectivity and readiness flags

pub mod config;
pub mod health;
pub mod metrics;

// Re-export commonly used types
pub use config::{Config, PersistenceBackend};
pub use health::{Health, WorkerLease};
pub use metrics::IngestMetrics;
