//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::estimator::{
    ServiceTimeTable, Smoothing, SmoothingMode, DEFAULT_EMA_ALPHA,
    DEFAULT_FALLBACK_SERVICE_MINUTES,
};
use anyhow::{ensure, Context};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    #[default]
    Memory,
    Jsonl,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Topic carrying queue_update events
    #[serde(default = "default_mqtt_topic")]
    pub topic: String,
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_mqtt_topic() -> String {
    "stadium/events/queues".to_string()
}

fn default_mqtt_client_id() -> String {
    "waittime-service".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Number of concurrent consumer workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bounded capacity between the MQTT ingress and the workers
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Local retries of a store failure before the message is released
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Delay before the first retry, doubled on each further one
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            channel_capacity: default_channel_capacity(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_workers() -> usize {
    2
}

fn default_channel_capacity() -> usize {
    1000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct EstimatorConfig {
    /// Per-person minutes for categories missing from `service_minutes`
    #[serde(default = "default_fallback_service_minutes")]
    pub fallback_service_minutes: f64,
    /// Category name to per-person minutes (e.g. TOILET = 2.0)
    #[serde(default = "default_service_minutes")]
    pub service_minutes: HashMap<String, f64>,
    #[serde(default)]
    pub smoothing: SmoothingMode,
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            fallback_service_minutes: default_fallback_service_minutes(),
            service_minutes: default_service_minutes(),
            smoothing: SmoothingMode::None,
            ema_alpha: default_ema_alpha(),
        }
    }
}

fn default_fallback_service_minutes() -> f64 {
    DEFAULT_FALLBACK_SERVICE_MINUTES
}

fn default_service_minutes() -> HashMap<String, f64> {
    HashMap::from([("TOILET".to_string(), 2.0)])
}

fn default_ema_alpha() -> f64 {
    DEFAULT_EMA_ALPHA
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "default_publisher_enabled")]
    pub enabled: bool,
    /// Per-location updates go to `<updates_topic>/<location_id>` (QoS 1)
    #[serde(default = "default_updates_topic")]
    pub updates_topic: String,
    /// Full state table, retained (QoS 0)
    #[serde(default = "default_snapshot_topic")]
    pub snapshot_topic: String,
    /// 0 disables snapshots
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,
    /// Minimum relative change of the wait estimate before re-publishing (percent)
    #[serde(default = "default_min_change_pct")]
    pub min_change_pct: f64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            enabled: default_publisher_enabled(),
            updates_topic: default_updates_topic(),
            snapshot_topic: default_snapshot_topic(),
            snapshot_interval_secs: default_snapshot_interval(),
            min_change_pct: default_min_change_pct(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_publisher_enabled() -> bool {
    true
}

fn default_updates_topic() -> String {
    "stadium/waittime/updates".to_string()
}

fn default_snapshot_topic() -> String {
    "stadium/waittime/snapshot".to_string()
}

fn default_snapshot_interval() -> u64 {
    30
}

fn default_min_change_pct() -> f64 {
    15.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub backend: PersistenceBackend,
    /// JSONL file for the `jsonl` backend
    #[serde(default = "default_persistence_path")]
    pub path: String,
    /// Rewrite the JSONL file once it holds this many lines
    #[serde(default = "default_compact_after_lines")]
    pub compact_after_lines: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::default(),
            path: default_persistence_path(),
            compact_after_lines: default_compact_after_lines(),
        }
    }
}

fn default_compact_after_lines() -> usize {
    10_000
}

fn default_persistence_path() -> String {
    "data/queue_state.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub interval_secs: u64,
    /// HTTP port for /metrics, /health and /api/waittime (0 to disable)
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_http_port() -> u16 {
    8001
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Venue identifier used as the Prometheus `site` label
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "stadium".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub estimator: EstimatorConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_topic: String,
    mqtt_client_id: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    ingest_workers: usize,
    ingest_channel_capacity: usize,
    ingest_retry_attempts: u32,
    ingest_retry_backoff_ms: u64,
    fallback_service_minutes: f64,
    service_minutes: HashMap<String, f64>,
    smoothing: SmoothingMode,
    ema_alpha: f64,
    publisher_enabled: bool,
    publisher_updates_topic: String,
    publisher_snapshot_topic: String,
    publisher_snapshot_interval_secs: u64,
    publisher_min_change_pct: f64,
    publisher_channel_capacity: usize,
    persistence_backend: PersistenceBackend,
    persistence_path: String,
    persistence_compact_after_lines: usize,
    metrics_interval_secs: u64,
    http_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        let estimator = EstimatorConfig::default();
        let publisher = PublisherConfig::default();
        Self {
            site_id: default_site_id(),
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_topic: default_mqtt_topic(),
            mqtt_client_id: default_mqtt_client_id(),
            mqtt_username: None,
            mqtt_password: None,
            ingest_workers: default_workers(),
            ingest_channel_capacity: default_channel_capacity(),
            ingest_retry_attempts: default_retry_attempts(),
            ingest_retry_backoff_ms: default_retry_backoff_ms(),
            fallback_service_minutes: estimator.fallback_service_minutes,
            service_minutes: estimator.service_minutes,
            smoothing: estimator.smoothing,
            ema_alpha: estimator.ema_alpha,
            publisher_enabled: publisher.enabled,
            publisher_updates_topic: publisher.updates_topic,
            publisher_snapshot_topic: publisher.snapshot_topic,
            publisher_snapshot_interval_secs: publisher.snapshot_interval_secs,
            publisher_min_change_pct: publisher.min_change_pct,
            publisher_channel_capacity: publisher.channel_capacity,
            persistence_backend: PersistenceBackend::Memory,
            persistence_path: default_persistence_path(),
            persistence_compact_after_lines: default_compact_after_lines(),
            metrics_interval_secs: 10,
            http_port: default_http_port(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        // Check for --config argument
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self {
            site_id: toml_config.site.id,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_topic: toml_config.mqtt.topic,
            mqtt_client_id: toml_config.mqtt.client_id,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            ingest_workers: toml_config.ingest.workers,
            ingest_channel_capacity: toml_config.ingest.channel_capacity,
            ingest_retry_attempts: toml_config.ingest.retry_attempts,
            ingest_retry_backoff_ms: toml_config.ingest.retry_backoff_ms,
            fallback_service_minutes: toml_config.estimator.fallback_service_minutes,
            service_minutes: toml_config.estimator.service_minutes,
            smoothing: toml_config.estimator.smoothing,
            ema_alpha: toml_config.estimator.ema_alpha,
            publisher_enabled: toml_config.publisher.enabled,
            publisher_updates_topic: toml_config.publisher.updates_topic,
            publisher_snapshot_topic: toml_config.publisher.snapshot_topic,
            publisher_snapshot_interval_secs: toml_config.publisher.snapshot_interval_secs,
            publisher_min_change_pct: toml_config.publisher.min_change_pct,
            publisher_channel_capacity: toml_config.publisher.channel_capacity,
            persistence_backend: toml_config.persistence.backend,
            persistence_path: toml_config.persistence.path,
            persistence_compact_after_lines: toml_config.persistence.compact_after_lines,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            http_port: toml_config.metrics.http_port,
            config_file: path.display().to_string(),
        };

        config
            .validate()
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.ingest_workers >= 1, "ingest.workers must be at least 1");
        ensure!(self.ingest_channel_capacity >= 1, "ingest.channel_capacity must be at least 1");
        ensure!(
            self.publisher_channel_capacity >= 1,
            "publisher.channel_capacity must be at least 1"
        );
        ensure!(
            self.fallback_service_minutes.is_finite() && self.fallback_service_minutes > 0.0,
            "estimator.fallback_service_minutes must be positive"
        );
        for (category, minutes) in &self.service_minutes {
            ensure!(
                minutes.is_finite() && *minutes > 0.0,
                "estimator.service_minutes.{} must be positive",
                category
            );
        }
        ensure!(
            self.ema_alpha > 0.0 && self.ema_alpha <= 1.0,
            "estimator.ema_alpha must be in (0, 1]"
        );
        ensure!(self.publisher_min_change_pct >= 0.0, "publisher.min_change_pct must be >= 0");
        ensure!(
            self.persistence_compact_after_lines >= 1,
            "persistence.compact_after_lines must be at least 1"
        );
        Ok(())
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Service-time table built from `[estimator]`
    pub fn service_time_table(&self) -> ServiceTimeTable {
        ServiceTimeTable::new(
            self.service_minutes.iter().map(|(k, v)| (k.as_str(), *v)),
            self.fallback_service_minutes,
        )
    }

    pub fn smoothing(&self) -> Smoothing {
        match self.smoothing {
            SmoothingMode::None => Smoothing::None,
            SmoothingMode::Ema => Smoothing::Ema { alpha: self.ema_alpha },
        }
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_topic(&self) -> &str {
        &self.mqtt_topic
    }

    pub fn mqtt_client_id(&self) -> &str {
        &self.mqtt_client_id
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn ingest_workers(&self) -> usize {
        self.ingest_workers
    }

    pub fn ingest_channel_capacity(&self) -> usize {
        self.ingest_channel_capacity
    }

    pub fn ingest_retry_attempts(&self) -> u32 {
        self.ingest_retry_attempts
    }

    pub fn ingest_retry_backoff_ms(&self) -> u64 {
        self.ingest_retry_backoff_ms
    }

    pub fn publisher_enabled(&self) -> bool {
        self.publisher_enabled
    }

    pub fn publisher_updates_topic(&self) -> &str {
        &self.publisher_updates_topic
    }

    pub fn publisher_snapshot_topic(&self) -> &str {
        &self.publisher_snapshot_topic
    }

    pub fn publisher_snapshot_interval_secs(&self) -> u64 {
        self.publisher_snapshot_interval_secs
    }

    pub fn publisher_min_change_pct(&self) -> f64 {
        self.publisher_min_change_pct
    }

    pub fn publisher_channel_capacity(&self) -> usize {
        self.publisher_channel_capacity
    }

    pub fn persistence_backend(&self) -> &PersistenceBackend {
        &self.persistence_backend
    }

    pub fn persistence_path(&self) -> PathBuf {
        PathBuf::from(&self.persistence_path)
    }

    pub fn persistence_compact_after_lines(&self) -> usize {
        self.persistence_compact_after_lines
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to switch smoothing on
    #[cfg(test)]
    pub fn with_smoothing(mut self, smoothing: SmoothingMode, alpha: f64) -> Self {
        self.smoothing = smoothing;
        self.ema_alpha = alpha;
        self
    }
}
