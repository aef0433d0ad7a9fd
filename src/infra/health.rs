//! Liveness/readiness flags shared between the MQTT ingress, the ingest
//! workers, shutdown handling and the HTTP `/health` endpoint.
//!
//! Ready means consuming: connected to the bus, at least one worker alive,
//! no released message waiting for a session reset, and not shutting down.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug)]
pub struct Health {
    connected: AtomicBool,
    shutting_down: AtomicBool,
    /// Epoch ms of the last inbound bus message (0 = none yet)
    last_message_ms: AtomicU64,
    /// Live ingest workers
    workers: AtomicUsize,
    /// Messages released un-acked since the current session started
    unacked: AtomicU64,
    started: Instant,
}

/// Held by a running worker; dropping it (exit or panic) marks the worker gone
#[derive(Debug)]
pub struct WorkerLease {
    health: Arc<Health>,
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.health.workers.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Health {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            last_message_ms: AtomicU64::new(0),
            workers: AtomicUsize::new(0),
            unacked: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn set_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }

    pub fn record_message(&self) {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        self.last_message_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn worker_started(self: &Arc<Self>) -> WorkerLease {
        self.workers.fetch_add(1, Ordering::Relaxed);
        WorkerLease { health: self.clone() }
    }

    pub fn workers(&self) -> usize {
        self.workers.load(Ordering::Relaxed)
    }

    pub fn record_unacked(&self) {
        self.unacked.fetch_add(1, Ordering::Relaxed);
    }

    /// A new session started; the broker redelivers whatever was released
    pub fn clear_unacked(&self) {
        self.unacked.store(0, Ordering::Relaxed);
    }

    pub fn unacked(&self) -> u64 {
        self.unacked.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn is_ready(&self) -> bool {
        self.is_connected()
            && self.workers() > 0
            && self.unacked() == 0
            && !self.shutting_down.load(Ordering::Relaxed)
    }

    pub fn report(&self, site: &str, tracked_locations: usize) -> HealthResponse {
        let last = self.last_message_ms.load(Ordering::Relaxed);
        HealthResponse {
            status: if self.is_ready() { "ready" } else { "not_ready" },
            site: site.to_string(),
            version: env!("CARGO_PKG_VERSION"),
            git_hash: env!("GIT_HASH"),
            uptime_seconds: self.started.elapsed().as_secs(),
            mqtt_connected: self.is_connected(),
            workers: self.workers(),
            unacked_messages: self.unacked(),
            last_message_ms: (last > 0).then_some(last),
            tracked_locations,
        }
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub site: String,
    pub version: &'static str,
    pub git_hash: &'static str,
    pub uptime_seconds: u64,
    pub mqtt_connected: bool,
    pub workers: usize,
    pub unacked_messages: u64,
    pub last_message_ms: Option<u64>,
    pub tracked_locations: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_requires_connection() {
        let health = Arc::new(Health::new());
        let _worker = health.worker_started();
        assert!(!health.is_ready());
        health.set_connected(true);
        assert!(health.is_ready());
        health.set_connected(false);
        assert!(!health.is_ready());
    }

    #[test]
    fn test_ready_requires_live_worker() {
        let health = Arc::new(Health::new());
        health.set_connected(true);
        assert!(!health.is_ready());

        let first = health.worker_started();
        let second = health.worker_started();
        assert_eq!(health.workers(), 2);
        drop(first);
        assert!(health.is_ready());
        drop(second);
        assert_eq!(health.workers(), 0);
        assert!(!health.is_ready());
    }

    #[test]
    fn test_worker_lease_released_on_panic() {
        let health = Arc::new(Health::new());
        let lease = health.worker_started();
        let result = std::thread::spawn(move || {
            let _lease = lease;
            panic!("worker died");
        })
        .join();
        assert!(result.is_err());
        assert_eq!(health.workers(), 0);
    }

    #[test]
    fn test_unacked_messages_clear_readiness_until_new_session() {
        let health = Arc::new(Health::new());
        let _worker = health.worker_started();
        health.set_connected(true);

        health.record_unacked();
        health.record_unacked();
        assert_eq!(health.unacked(), 2);
        assert!(!health.is_ready());

        health.clear_unacked();
        assert!(health.is_ready());
    }

    #[test]
    fn test_shutdown_clears_readiness() {
        let health = Arc::new(Health::new());
        let _worker = health.worker_started();
        health.set_connected(true);
        health.set_shutting_down();
        assert!(!health.is_ready());
        assert!(health.is_connected());
    }

    #[test]
    fn test_report() {
        let health = Arc::new(Health::new());
        let report = health.report("stadium", 2);
        assert_eq!(report.status, "not_ready");
        assert_eq!(report.last_message_ms, None);
        assert_eq!(report.tracked_locations, 2);

        let _worker = health.worker_started();
        health.set_connected(true);
        health.record_message();
        let report = health.report("stadium", 2);
        assert_eq!(report.status, "ready");
        assert_eq!(report.workers, 1);
        assert_eq!(report.unacked_messages, 0);
        assert!(report.last_message_ms.is_some());
    }
}
