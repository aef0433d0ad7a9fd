//! HTTP read surface
//!
//! - `GET /api/waittime` - every tracked location (`?location_type=` filters,
//!   `?poi=` selects one)
//! - `GET /api/waittime/{location_id}` - one location, 404 when never seen
//! - `GET /health` - readiness JSON, 503 while not ready
//! - `GET /metrics` - Prometheus text format
//!
//! Uses hyper for the HTTP server. Handlers only read committed snapshots and
//! atomics, so a slow client never holds a store lock.

use crate::domain::{LocationId, LocationType};
use crate::infra::health::Health;
use crate::infra::metrics::{
    IngestMetrics, MetricsSnapshot, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS,
};
use crate::services::store::QueueStateStore;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

const API_PREFIX: &str = "/api/waittime";

/// Everything the handlers read
#[derive(Clone)]
pub struct HttpState {
    pub store: Arc<QueueStateStore>,
    pub metrics: Arc<IngestMetrics>,
    pub health: Arc<Health>,
    pub site_id: Arc<String>,
}

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a cumulative histogram with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {cumulative}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(snapshot: &MetricsSnapshot, site: &str) -> String {
    let c = &snapshot.counters;
    let mut output = String::with_capacity(4096);

    let counters: [(&str, &str, u64); 13] = [
        ("waittime_events_received_total", "Bus messages handed to a worker", c.events_received),
        ("waittime_events_accepted_total", "Events committed to the store", c.events_accepted),
        ("waittime_events_invalid_total", "Messages rejected by validation", c.events_invalid),
        ("waittime_events_duplicate_total", "Redelivered event ids discarded", c.events_duplicate),
        ("waittime_events_stale_total", "Out-of-order events discarded", c.events_stale),
        ("waittime_store_errors_total", "State backend failures", c.store_errors),
        (
            "waittime_messages_released_total",
            "Messages left un-acked for broker redelivery after local retries",
            c.messages_released,
        ),
        (
            "waittime_unknown_location_type_total",
            "Locations estimated with the fallback service time",
            c.unknown_location_type,
        ),
        ("waittime_publish_enqueued_total", "Updates handed to the publisher", c.publish_enqueued),
        ("waittime_publish_dropped_total", "Updates dropped on a full channel", c.publish_dropped),
        ("waittime_published_total", "Updates published to MQTT", c.published),
        (
            "waittime_publish_suppressed_total",
            "Updates below the significant-change threshold",
            c.publish_suppressed,
        ),
        ("waittime_publish_failed_total", "MQTT publish failures", c.publish_failed),
    ];
    for (name, help, val) in counters {
        write_metric(&mut output, name, help, MetricType::Counter, site, val);
    }

    write_metric(
        &mut output,
        "waittime_tracked_locations",
        "Locations with committed state",
        MetricType::Gauge,
        site,
        c.tracked_locations as u64,
    );

    write_histogram(
        &mut output,
        "waittime_process_latency_us",
        "Receive-to-commit latency in microseconds",
        site,
        &snapshot.lat_buckets,
        snapshot.lat_sum_us,
    );

    output
}

fn respond(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, "application/json", body),
        Err(e) => {
            error!(error = %e, "http_encode_failed");
            respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "encode error")
        }
    }
}

fn not_found() -> Response<Full<Bytes>> {
    respond(StatusCode::NOT_FOUND, "application/json", r#"{"error":"not_found"}"#)
}

/// Decoded value of `key` in a `a=1&b=2` query string
fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    let raw = query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)?;
    urlencoding::decode(&raw.replace('+', " "))
        .ok()
        .map(|v| v.into_owned())
        .filter(|v| !v.is_empty())
}

fn location(state: &HttpState, id: &str) -> Response<Full<Bytes>> {
    match state.store.get(&LocationId::from(id)) {
        Some(row) => json(StatusCode::OK, &row),
        None => not_found(),
    }
}

/// Route one request; pure apart from reading shared state
pub fn route(
    state: &HttpState,
    method: &Method,
    path: &str,
    query: Option<&str>,
) -> Response<Full<Bytes>> {
    if *method != Method::GET {
        return respond(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "method not allowed");
    }

    match path {
        "/metrics" => {
            let snapshot = state.metrics.snapshot(state.store.len());
            respond(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                format_prometheus_metrics(&snapshot, &state.site_id),
            )
        }
        "/health" => {
            let report = state.health.report(&state.site_id, state.store.len());
            let status = if state.health.is_ready() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json(status, &report)
        }
        API_PREFIX => {
            if let Some(poi) = query_param(query, "poi") {
                return location(state, &poi);
            }
            let mut rows = state.store.snapshot_all();
            if let Some(raw) = query_param(query, "location_type") {
                let wanted = LocationType::new(&raw);
                rows.retain(|row| row.location_type == wanted);
            }
            json(StatusCode::OK, &rows)
        }
        _ => match path.strip_prefix(API_PREFIX).and_then(|rest| rest.strip_prefix('/')) {
            Some(id) if !id.is_empty() && !id.contains('/') => match urlencoding::decode(id) {
                Ok(id) => location(state, &id),
                Err(_) => not_found(),
            },
            _ => not_found(),
        },
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: HttpState,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = route(&state, req.method(), req.uri().path(), req.uri().query());
    debug!(
        method = %req.method(),
        path = %req.uri().path(),
        status = %response.status().as_u16(),
        "http_request"
    );
    Ok(response)
}

/// Bind the HTTP listener; failure here is a startup error
pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await
}

/// Serve HTTP on `listener` until shutdown
pub async fn serve(listener: TcpListener, state: HttpState, mut shutdown: watch::Receiver<bool>) {
    info!(addr = ?listener.local_addr().ok(), site = %state.site_id, "http_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("http_server_shutdown");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventId, QueueEvent};
    use crate::io::persistence::MemoryBackend;
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;

    async fn insert(store: &QueueStateStore, id: &str, kind: &str, len: u32) {
        let event = QueueEvent {
            event_id: EventId::from("e1"),
            location_type: LocationType::new(kind),
            location_id: LocationId::from(id),
            location: None,
            queue_length: len,
            observed_at: Utc.with_ymd_and_hms(2025, 10, 8, 18, 0, 0).unwrap(),
            avg_service_time: None,
        };
        let mut guard = store.lock(&event.location_id).await.unwrap();
        guard.upsert(&event, 2.0, f64::from(len), f64::from(len) * 2.0).await.unwrap();
    }

    async fn test_state() -> HttpState {
        let store = Arc::new(QueueStateStore::new(Arc::new(MemoryBackend::new())));
        insert(&store, "L1", "TOILET", 3).await;
        insert(&store, "F1", "FOOD", 2).await;
        HttpState {
            store,
            metrics: Arc::new(IngestMetrics::new()),
            health: Arc::new(Health::new()),
            site_id: Arc::new("stadium".to_string()),
        }
    }

    async fn body(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_single_location() {
        let state = test_state().await;
        let response = route(&state, &Method::GET, "/api/waittime/L1", None);
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body(response).await).unwrap();
        assert_eq!(json["location_id"], "L1");
        assert_eq!(json["estimated_wait_minutes"], 6.0);

        let response = route(&state, &Method::GET, "/api/waittime", Some("poi=F1"));
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_location_is_404() {
        let state = test_state().await;
        for (path, query) in [
            ("/api/waittime/nope", None),
            ("/api/waittime/", None),
            ("/api/waittime", Some("poi=nope")),
            ("/other", None),
        ] {
            let response = route(&state, &Method::GET, path, query);
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
        }
    }

    #[tokio::test]
    async fn test_list_sorted_and_filtered() {
        let state = test_state().await;
        let response = route(&state, &Method::GET, "/api/waittime", None);
        let rows: Vec<serde_json::Value> = serde_json::from_str(&body(response).await).unwrap();
        let ids: Vec<&str> = rows.iter().filter_map(|r| r["location_id"].as_str()).collect();
        assert_eq!(ids, vec!["F1", "L1"]);

        let response = route(&state, &Method::GET, "/api/waittime", Some("location_type=toilet"));
        let rows: Vec<serde_json::Value> = serde_json::from_str(&body(response).await).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["location_id"], "L1");
    }

    #[tokio::test]
    async fn test_health_follows_readiness() {
        let state = test_state().await;
        let response = route(&state, &Method::GET, "/health", None);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.health.set_connected(true);
        let worker = state.health.worker_started();
        let response = route(&state, &Method::GET, "/health", None);
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body(response).await).unwrap();
        assert_eq!(json["status"], "ready");
        assert_eq!(json["tracked_locations"], 2);

        drop(worker);
        let response = route(&state, &Method::GET, "/health", None);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_format() {
        let state = test_state().await;
        state.metrics.record_received();
        state.metrics.record_event_processed(150);

        let response = route(&state, &Method::GET, "/metrics", None);
        let text = body(response).await;
        assert!(text.contains("waittime_events_received_total{site=\"stadium\"} 1"));
        assert!(text.contains("waittime_tracked_locations{site=\"stadium\"} 2"));
        assert!(text.contains("waittime_process_latency_us_bucket{site=\"stadium\",le=\"200\"} 1"));
        assert!(text.contains("waittime_process_latency_us_count{site=\"stadium\"} 1"));
    }

    #[test]
    fn test_query_param() {
        assert_eq!(query_param(Some("a=1&poi=L1"), "poi").as_deref(), Some("L1"));
        assert_eq!(query_param(Some("poi=Restroom%20A3"), "poi").as_deref(), Some("Restroom A3"));
        assert_eq!(query_param(Some("poi=Food+Court"), "poi").as_deref(), Some("Food Court"));
        assert_eq!(query_param(Some("poi="), "poi"), None);
        assert_eq!(query_param(None, "poi"), None);
    }

    #[tokio::test]
    async fn test_percent_encoded_ids() {
        let state = test_state().await;
        insert(&state.store, "Restroom A3", "FAMILY ROOM", 1).await;

        let response = route(&state, &Method::GET, "/api/waittime/Restroom%20A3", None);
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body(response).await).unwrap();
        assert_eq!(json["location_id"], "Restroom A3");

        let response = route(&state, &Method::GET, "/api/waittime", Some("poi=Restroom%20A3"));
        assert_eq!(response.status(), StatusCode::OK);

        let query = Some("location_type=family%20room");
        let response = route(&state, &Method::GET, "/api/waittime", query);
        let rows: Vec<serde_json::Value> = serde_json::from_str(&body(response).await).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["location_id"], "Restroom A3");

        let response = route(&state, &Method::GET, "/api/waittime/%FF", None);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_non_get_rejected() {
        let state = test_state().await;
        let response = route(&state, &Method::POST, "/api/waittime", None);
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
