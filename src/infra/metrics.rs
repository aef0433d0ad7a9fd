//! Lock-free ingestion metrics
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! One `IngestMetrics` is created per pipeline and injected into every
//! worker, so independent pipelines (and tests) never share counters.
//!
//! NOTE: All atomics use Relaxed ordering; these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector for the ingestion pipeline
pub struct IngestMetrics {
    /// Messages handed to a worker (monotonic)
    events_received: AtomicU64,
    /// Events applied to the store (monotonic)
    events_accepted: AtomicU64,
    /// Events rejected by validation (monotonic)
    events_invalid: AtomicU64,
    /// Re-delivered event ids (monotonic)
    events_duplicate: AtomicU64,
    /// Events older than the stored observation (monotonic)
    events_stale: AtomicU64,
    /// Backing store failures (monotonic)
    store_errors: AtomicU64,
    /// Accepted events whose category had no configured service time (monotonic)
    unknown_location_type: AtomicU64,
    /// Updates handed to the publisher channel (monotonic)
    publish_enqueued: AtomicU64,
    /// Updates dropped because the publisher channel was full or closed (monotonic)
    publish_dropped: AtomicU64,
    /// Updates sent to MQTT by the egress actor (monotonic)
    published: AtomicU64,
    /// Updates below the significant-change threshold (monotonic)
    publish_suppressed: AtomicU64,
    /// Egress MQTT publish failures (monotonic)
    publish_failed: AtomicU64,
    /// Messages handed back to the broker un-acked after local retries (monotonic)
    messages_released: AtomicU64,
    /// Processing latency histogram (monotonic, for Prometheus)
    latency_buckets_total: [AtomicU64; NUM_BUCKETS],
    /// Sum of all processing latencies (monotonic)
    latency_sum_total_us: AtomicU64,
    /// Events processed since last report (reset on report)
    events_since_report: AtomicU64,
    /// Sum of latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Processing latency histogram buckets (reset on report)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Last report time (only accessed from reporter)
    last_report_time: Mutex<Instant>,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            events_accepted: AtomicU64::new(0),
            events_invalid: AtomicU64::new(0),
            events_duplicate: AtomicU64::new(0),
            events_stale: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
            unknown_location_type: AtomicU64::new(0),
            publish_enqueued: AtomicU64::new(0),
            publish_dropped: AtomicU64::new(0),
            published: AtomicU64::new(0),
            publish_suppressed: AtomicU64::new(0),
            publish_failed: AtomicU64::new(0),
            messages_released: AtomicU64::new(0),
            latency_buckets_total: std::array::from_fn(|_| AtomicU64::new(0)),
            latency_sum_total_us: AtomicU64::new(0),
            events_since_report: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            last_report_time: Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_accepted(&self) {
        self.events_accepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_invalid(&self) {
        self.events_invalid.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_duplicate(&self) {
        self.events_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stale(&self) {
        self.events_stale.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unknown_location_type(&self) {
        self.unknown_location_type.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_publish_enqueued(&self) {
        self.publish_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_publish_dropped(&self) {
        self.publish_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_publish_suppressed(&self) {
        self.publish_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_publish_failed(&self) {
        self.publish_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_released(&self) {
        self.messages_released.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one message fully processed with given latency (lock-free)
    #[inline]
    pub fn record_event_processed(&self, latency_us: u64) {
        let bucket = bucket_index(latency_us);

        self.latency_buckets_total[bucket].fetch_add(1, Ordering::Relaxed);
        self.latency_sum_total_us.fetch_add(latency_us, Ordering::Relaxed);

        self.events_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_us, latency_us);
    }

    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }

    pub fn events_accepted(&self) -> u64 {
        self.events_accepted.load(Ordering::Relaxed)
    }

    pub fn events_invalid(&self) -> u64 {
        self.events_invalid.load(Ordering::Relaxed)
    }

    pub fn events_duplicate(&self) -> u64 {
        self.events_duplicate.load(Ordering::Relaxed)
    }

    pub fn events_stale(&self) -> u64 {
        self.events_stale.load(Ordering::Relaxed)
    }

    pub fn store_errors(&self) -> u64 {
        self.store_errors.load(Ordering::Relaxed)
    }

    pub fn unknown_location_type(&self) -> u64 {
        self.unknown_location_type.load(Ordering::Relaxed)
    }

    pub fn publish_enqueued(&self) -> u64 {
        self.publish_enqueued.load(Ordering::Relaxed)
    }

    pub fn publish_dropped(&self) -> u64 {
        self.publish_dropped.load(Ordering::Relaxed)
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn publish_suppressed(&self) -> u64 {
        self.publish_suppressed.load(Ordering::Relaxed)
    }

    pub fn messages_released(&self) -> u64 {
        self.messages_released.load(Ordering::Relaxed)
    }

    fn counters(&self, tracked_locations: usize) -> Counters {
        Counters {
            events_received: self.events_received(),
            events_accepted: self.events_accepted(),
            events_invalid: self.events_invalid(),
            events_duplicate: self.events_duplicate(),
            events_stale: self.events_stale(),
            store_errors: self.store_errors(),
            unknown_location_type: self.unknown_location_type(),
            publish_enqueued: self.publish_enqueued(),
            publish_dropped: self.publish_dropped(),
            published: self.published(),
            publish_suppressed: self.publish_suppressed(),
            publish_failed: self.publish_failed.load(Ordering::Relaxed),
            messages_released: self.messages_released(),
            tracked_locations,
        }
    }

    /// Calculate and return the periodic summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self, tracked_locations: usize) -> MetricsSummary {
        let events_count = self.events_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let events_per_sec = if elapsed.as_secs_f64() > 0.0 {
            events_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if events_count > 0 { latency_sum / events_count } else { 0 };

        MetricsSummary {
            counters: self.counters(tracked_locations),
            events_per_sec,
            avg_process_latency_us: avg_latency,
            max_process_latency_us: max_latency,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&lat_buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            lat_buckets,
        }
    }

    /// Cumulative view for scraping; resets nothing
    pub fn snapshot(&self, tracked_locations: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters(tracked_locations),
            lat_buckets: load_buckets(&self.latency_buckets_total),
            lat_sum_us: self.latency_sum_total_us.load(Ordering::Relaxed),
        }
    }
}

impl Default for IngestMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

/// Monotonic counters shared by the periodic summary and the scrape snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub events_received: u64,
    pub events_accepted: u64,
    pub events_invalid: u64,
    pub events_duplicate: u64,
    pub events_stale: u64,
    pub store_errors: u64,
    pub unknown_location_type: u64,
    pub publish_enqueued: u64,
    pub publish_dropped: u64,
    pub published: u64,
    pub publish_suppressed: u64,
    pub publish_failed: u64,
    pub messages_released: u64,
    pub tracked_locations: usize,
}

#[derive(Debug)]
pub struct MetricsSummary {
    pub counters: Counters,
    pub events_per_sec: f64,
    pub avg_process_latency_us: u64,
    pub max_process_latency_us: u64,
    /// Processing latency histogram buckets for the last period
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
}

#[derive(Debug)]
pub struct MetricsSnapshot {
    pub counters: Counters,
    /// Cumulative processing latency histogram
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_sum_us: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        let c = &self.counters;
        info!(
            received = %c.events_received,
            accepted = %c.events_accepted,
            invalid = %c.events_invalid,
            duplicate = %c.events_duplicate,
            stale = %c.events_stale,
            store_errors = %c.store_errors,
            released = %c.messages_released,
            published = %c.published,
            suppressed = %c.publish_suppressed,
            dropped = %c.publish_dropped,
            locations = %c.tracked_locations,
            events_per_sec = format!("{:.1}", self.events_per_sec),
            avg_latency_us = %self.avg_process_latency_us,
            max_latency_us = %self.max_process_latency_us,
            p50_us = %self.lat_p50_us,
            p95_us = %self.lat_p95_us,
            p99_us = %self.lat_p99_us,
            "metrics"
        );
    }
}
