//! Wait-time service - queue telemetry in, wait-time estimates out
//!
//! Consumes queue_update events from MQTT, keeps the authoritative
//! per-location queue state, and re-publishes wait-time estimates.
//!
//! Module structure:
//! - `domain/` - Core types (QueueEvent, QueueState), validation, estimator
//! - `io/` - External interfaces (MQTT in/out, state backends, HTTP)
//! - `services/` - Business logic (QueueStateStore, Consumer)
//! - `infra/` - Infrastructure (Config, Metrics, Health)

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use waittime_service::domain::WaitEstimator;
use waittime_service::infra::{Config, Health, IngestMetrics, PersistenceBackend};
use waittime_service::io::http::{self, HttpState};
use waittime_service::io::{
    create_state_channel, JsonlBackend, MemoryBackend, MqttPublisher, StateBackend,
    StatePublisher,
};
use waittime_service::services::{Consumer, QueueStateStore, RetryPolicy, SharedReceiver};

/// Wait-time service - queue telemetry ingestion and wait-time estimation
#[derive(Parser, Debug)]
#[command(name = "waittime-service", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

async fn open_backend(config: &Config) -> anyhow::Result<Arc<dyn StateBackend>> {
    match config.persistence_backend() {
        PersistenceBackend::Memory => Ok(Arc::new(MemoryBackend::new())),
        PersistenceBackend::Jsonl => {
            let path = config.persistence_path();
            let backend = JsonlBackend::open(&path)
                .await
                .with_context(|| format!("Failed to open state file {}", path.display()))?
                .with_compaction_threshold(config.persistence_compact_after_lines());
            backend
                .compact()
                .await
                .with_context(|| format!("Failed to compact state file {}", path.display()))?;
            Ok(Arc::new(backend))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(
        version = %env!("CARGO_PKG_VERSION"),
        git_hash = %env!("GIT_HASH"),
        "waittime-service starting"
    );

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        mqtt_topic = %config.mqtt_topic(),
        workers = %config.ingest_workers(),
        smoothing = ?config.smoothing(),
        persistence = ?config.persistence_backend(),
        publisher_enabled = %config.publisher_enabled(),
        http_port = %config.http_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Shared components
    let metrics = Arc::new(IngestMetrics::new());
    let health = Arc::new(Health::new());
    let backend = open_backend(&config).await?;
    let store = Arc::new(QueueStateStore::new(backend));
    store.hydrate().await.context("Failed to load queue state from backend")?;

    // HTTP read surface (if port > 0)
    let http_task = if config.http_port() > 0 {
        let listener = http::bind(config.http_port())
            .await
            .with_context(|| format!("Failed to bind HTTP port {}", config.http_port()))?;
        let http_state = HttpState {
            store: store.clone(),
            metrics: metrics.clone(),
            health: health.clone(),
            site_id: Arc::new(config.site_id().to_string()),
        };
        Some(tokio::spawn(http::serve(listener, http_state, shutdown_rx.clone())))
    } else {
        None
    };

    // Publisher
    let (publisher, egress_task) = if config.publisher_enabled() {
        let (publisher, state_rx) = create_state_channel(config.publisher_channel_capacity());
        let mqtt_publisher = MqttPublisher::new(&config, state_rx, store.clone(), metrics.clone());
        let task = tokio::spawn(mqtt_publisher.run(shutdown_rx.clone()));
        (publisher, Some(task))
    } else {
        (StatePublisher::disabled(), None)
    };

    // Workers share one receiver fed by the MQTT ingress
    let (message_tx, message_rx) = mpsc::channel(config.ingest_channel_capacity());
    let receiver: SharedReceiver = Arc::new(Mutex::new(message_rx));
    let estimator = Arc::new(WaitEstimator::new(config.service_time_table(), config.smoothing()));
    let retry = RetryPolicy {
        attempts: config.ingest_retry_attempts(),
        backoff: Duration::from_millis(config.ingest_retry_backoff_ms()),
    };
    let consumer =
        Consumer::new(store.clone(), estimator, publisher, metrics.clone()).with_retry(retry);
    let workers: Vec<_> = (0..config.ingest_workers())
        .map(|id| {
            // Readiness drops if every worker exits
            let lease = health.worker_started();
            let worker = consumer.clone().run(id, receiver.clone(), shutdown_rx.clone());
            tokio::spawn(async move {
                let _lease = lease;
                worker.await
            })
        })
        .collect();
    drop(consumer);

    // MQTT ingress
    let mqtt_config = config.clone();
    let mqtt_health = health.clone();
    let mqtt_shutdown = shutdown_rx.clone();
    let ingress_task = tokio::spawn(async move {
        if let Err(e) = waittime_service::io::mqtt::start_mqtt_client(
            &mqtt_config,
            message_tx,
            mqtt_health,
            mqtt_shutdown,
        )
        .await
        {
            error!(error = %e, "mqtt_client_error");
        }
    });

    // Periodic metrics log
    let metrics_clone = metrics.clone();
    let metrics_store = store.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    let mut metrics_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    metrics_clone.report(metrics_store.len()).log();
                }
                _ = metrics_shutdown.changed() => {
                    if *metrics_shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    info!("shutdown_signal_received");
    health.set_shutting_down();
    let _ = shutdown_tx.send(true);

    // Ingress stops polling, workers finish the in-flight message, egress drains
    let _ = ingress_task.await;
    for worker in workers {
        let _ = worker.await;
    }
    if let Some(task) = egress_task {
        let _ = task.await;
    }
    if let Some(task) = http_task {
        let _ = task.await;
    }

    metrics.report(store.len()).log();
    info!("waittime-service shutdown complete");
    Ok(())
}
