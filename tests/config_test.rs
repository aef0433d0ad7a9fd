//! Integration tests for configuration loading

use std::io::Write;
use tempfile::NamedTempFile;
use waittime_service::domain::{LocationType, Smoothing};
use waittime_service::infra::{Config, PersistenceBackend};

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content.as_bytes()).unwrap();
    temp_file.flush().unwrap();
    temp_file
}

#[test]
fn test_load_config_from_file() {
    let temp_file = write_config(
        r#"
[site]
id = "test-site"

[mqtt]
host = "test-host"
port = 1884
topic = "test/queues"
username = "svc"
password = "secret"

[ingest]
workers = 4
retry_attempts = 5
retry_backoff_ms = 20

[estimator]
fallback_service_minutes = 3.0
smoothing = "ema"
ema_alpha = 0.5

[estimator.service_minutes]
toilet = 2.5
FOOD = 4.0

[publisher]
enabled = false
min_change_pct = 10.0

[persistence]
backend = "jsonl"
path = "/tmp/state.jsonl"
compact_after_lines = 500

[metrics]
interval_secs = 15
http_port = 9091
"#,
    );

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "test-site");
    assert_eq!(config.mqtt_host(), "test-host");
    assert_eq!(config.mqtt_port(), 1884);
    assert_eq!(config.mqtt_topic(), "test/queues");
    assert_eq!(config.mqtt_username(), Some("svc"));
    assert_eq!(config.mqtt_password(), Some("secret"));
    assert_eq!(config.ingest_workers(), 4);
    assert_eq!(config.ingest_channel_capacity(), 1000);
    assert_eq!(config.ingest_retry_attempts(), 5);
    assert_eq!(config.ingest_retry_backoff_ms(), 20);
    assert_eq!(config.smoothing(), Smoothing::Ema { alpha: 0.5 });
    assert!(!config.publisher_enabled());
    assert_eq!(config.publisher_min_change_pct(), 10.0);
    assert_eq!(config.persistence_backend(), &PersistenceBackend::Jsonl);
    assert_eq!(config.persistence_path().to_str(), Some("/tmp/state.jsonl"));
    assert_eq!(config.persistence_compact_after_lines(), 500);
    assert_eq!(config.metrics_interval_secs(), 15);
    assert_eq!(config.http_port(), 9091);

    let table = config.service_time_table();
    assert_eq!(table.default_for(&LocationType::new("TOILET")), 2.5);
    assert_eq!(table.default_for(&LocationType::new("food")), 4.0);
    assert_eq!(table.default_for(&LocationType::new("KIOSK")), 3.0);
}

#[test]
fn test_minimal_config_uses_defaults() {
    let temp_file = write_config(
        r#"
[mqtt]
host = "broker"
port = 1883

[metrics]
interval_secs = 5
"#,
    );

    let config = Config::from_file(temp_file.path()).unwrap();
    assert_eq!(config.site_id(), "stadium");
    assert_eq!(config.mqtt_topic(), "stadium/events/queues");
    assert_eq!(config.publisher_updates_topic(), "stadium/waittime/updates");
    assert_eq!(config.publisher_min_change_pct(), 15.0);
    assert_eq!(config.smoothing(), Smoothing::None);
    assert_eq!(config.persistence_backend(), &PersistenceBackend::Memory);
    assert_eq!(config.http_port(), 8001);
    assert_eq!(config.ingest_retry_attempts(), 3);
    assert_eq!(config.ingest_retry_backoff_ms(), 100);
    assert_eq!(config.persistence_compact_after_lines(), 10_000);
    assert_eq!(config.service_time_table().default_for(&LocationType::new("TOILET")), 2.0);
}

#[test]
fn test_invalid_values_rejected() {
    let base = "[mqtt]\nhost = \"b\"\nport = 1883\n[metrics]\ninterval_secs = 5\n";
    for extra in [
        "[ingest]\nworkers = 0\n",
        "[estimator]\nema_alpha = 0.0\n",
        "[estimator]\nfallback_service_minutes = -1.0\n",
        "[estimator.service_minutes]\nTOILET = 0.0\n",
        "[persistence]\ncompact_after_lines = 0\n",
    ] {
        let temp_file = write_config(&format!("{base}{extra}"));
        assert!(Config::from_file(temp_file.path()).is_err(), "accepted: {extra}");
    }
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.mqtt_host(), "localhost");
    assert_eq!(config.mqtt_port(), 1883);
    assert_eq!(config.config_file(), "default");
}

#[test]
fn test_dev_config_parses() {
    let config = Config::from_file("config/dev.toml").unwrap();
    assert_eq!(config.mqtt_topic(), "stadium/events/queues");
    assert_eq!(config.ingest_workers(), 2);
}
