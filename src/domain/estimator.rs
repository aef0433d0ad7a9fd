//! Wait-time estimation
//!
//! `estimate` is the whole model: people waiting times minutes per person.
//! `WaitEstimator` adds the two policies around it - which service time to
//! use (override, carried value, category default) and how to smooth
//! successive queue-length observations.

use crate::domain::types::{LocationType, QueueEvent, QueueState};
use rustc_hash::FxHashMap;
use serde::Deserialize;

/// Generic per-person service time for categories without a configured value
pub const DEFAULT_FALLBACK_SERVICE_MINUTES: f64 = 3.5;

/// Default EMA smoothing factor when `smoothing = "ema"` sets no alpha
pub const DEFAULT_EMA_ALPHA: f64 = 0.3;

/// Expected wait in minutes for `queue_length` people at `avg_service_time` each
#[inline]
pub fn estimate(queue_length: f64, avg_service_time: f64) -> f64 {
    if queue_length > 0.0 {
        queue_length * avg_service_time
    } else {
        0.0
    }
}

/// Category-keyed default service times
#[derive(Debug, Clone)]
pub struct ServiceTimeTable {
    minutes: FxHashMap<LocationType, f64>,
    fallback: f64,
}

impl Default for ServiceTimeTable {
    fn default() -> Self {
        let mut minutes = FxHashMap::default();
        minutes.insert(LocationType::new("TOILET"), 2.0);
        Self { minutes, fallback: DEFAULT_FALLBACK_SERVICE_MINUTES }
    }
}

impl ServiceTimeTable {
    pub fn new<'a>(entries: impl IntoIterator<Item = (&'a str, f64)>, fallback: f64) -> Self {
        let minutes = entries.into_iter().map(|(k, v)| (LocationType::new(k), v)).collect();
        Self { minutes, fallback }
    }

    /// Whether the category has its own configured default
    pub fn is_known(&self, location_type: &LocationType) -> bool {
        self.minutes.contains_key(location_type)
    }

    pub fn default_for(&self, location_type: &LocationType) -> f64 {
        self.minutes.get(location_type).copied().unwrap_or(self.fallback)
    }

    pub fn fallback(&self) -> f64 {
        self.fallback
    }

    /// Resolve the service time for an accepted event.
    ///
    /// Explicit override wins, then the last stored value, then the category default.
    pub fn resolve(
        &self,
        location_type: &LocationType,
        override_minutes: Option<f64>,
        previous: Option<&QueueState>,
    ) -> f64 {
        override_minutes
            .or_else(|| previous.map(|p| p.avg_service_time))
            .unwrap_or_else(|| self.default_for(location_type))
    }
}

/// Queue-length smoothing policy
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmoothingMode {
    /// Each observation replaces the previous one
    #[default]
    None,
    /// Exponential moving average over queue length
    Ema,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Smoothing {
    None,
    Ema { alpha: f64 },
}

impl Smoothing {
    pub fn apply(&self, previous: Option<f64>, observed: f64) -> f64 {
        match (*self, previous) {
            (Smoothing::None, _) | (Smoothing::Ema { .. }, None) => observed,
            (Smoothing::Ema { alpha }, Some(prev)) => alpha * observed + (1.0 - alpha) * prev,
        }
    }
}

/// Computed values for one accepted event
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub avg_service_time: f64,
    pub smoothed_queue_length: f64,
    pub wait_minutes: f64,
}

/// Service-time resolution plus smoothing plus `estimate`
#[derive(Debug, Clone)]
pub struct WaitEstimator {
    table: ServiceTimeTable,
    smoothing: Smoothing,
}

impl Default for WaitEstimator {
    fn default() -> Self {
        Self::new(ServiceTimeTable::default(), Smoothing::None)
    }
}

impl WaitEstimator {
    pub fn new(table: ServiceTimeTable, smoothing: Smoothing) -> Self {
        Self { table, smoothing }
    }

    pub fn table(&self) -> &ServiceTimeTable {
        &self.table
    }

    /// Compute the next estimate for `event` given the currently stored row
    pub fn next(&self, event: &QueueEvent, previous: Option<&QueueState>) -> Estimate {
        let avg_service_time =
            self.table.resolve(&event.location_type, event.avg_service_time, previous);
        let smoothed_queue_length = self
            .smoothing
            .apply(previous.map(|p| p.smoothed_queue_length), f64::from(event.queue_length));
        Estimate {
            avg_service_time,
            smoothed_queue_length,
            wait_minutes: estimate(smoothed_queue_length, avg_service_time),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{EventId, LocationId};
    use chrono::Utc;

    fn event(location_type: &str, queue_length: u32, avg: Option<f64>) -> QueueEvent {
        QueueEvent {
            event_id: EventId::from("e"),
            location_type: LocationType::new(location_type),
            location_id: LocationId::from("L1"),
            location: None,
            queue_length,
            observed_at: Utc::now(),
            avg_service_time: avg,
        }
    }

    fn state_after(
        estimator: &WaitEstimator,
        ev: &QueueEvent,
        prev: Option<&QueueState>,
    ) -> QueueState {
        let est = estimator.next(ev, prev);
        QueueState::from_event(
            ev,
            prev,
            est.avg_service_time,
            est.smoothed_queue_length,
            est.wait_minutes,
            Utc::now(),
        )
    }

    #[test]
    fn test_estimate_is_length_times_service_time() {
        for n in 1..50u32 {
            for t in [0.5, 1.0, 2.0, 3.5, 7.25] {
                assert_eq!(estimate(f64::from(n), t), f64::from(n) * t);
            }
        }
    }

    #[test]
    fn test_estimate_empty_queue_is_zero() {
        for t in [0.1, 2.0, 1000.0] {
            assert_eq!(estimate(0.0, t), 0.0);
        }
    }

    #[test]
    fn test_default_table() {
        let table = ServiceTimeTable::default();
        assert_eq!(table.default_for(&LocationType::new("TOILET")), 2.0);
        assert_eq!(table.default_for(&LocationType::new("KIOSK")), 3.5);
        assert!(table.is_known(&LocationType::new("toilet")));
        assert!(!table.is_known(&LocationType::new("KIOSK")));
    }

    #[test]
    fn test_configured_table_normalizes_keys() {
        let table = ServiceTimeTable::new([("food", 4.0), ("Bar", 1.5)], 3.0);
        assert_eq!(table.default_for(&LocationType::new("FOOD")), 4.0);
        assert_eq!(table.default_for(&LocationType::new("bar")), 1.5);
        assert_eq!(table.default_for(&LocationType::new("TOILET")), 3.0);
    }

    #[test]
    fn test_service_time_carry_forward() {
        let estimator = WaitEstimator::default();

        let first = event("TOILET", 3, None);
        let s1 = state_after(&estimator, &first, None);
        assert_eq!(s1.avg_service_time, 2.0);
        assert_eq!(s1.estimated_wait_minutes, 6.0);

        let with_override = event("TOILET", 3, Some(5.0));
        let s2 = state_after(&estimator, &with_override, Some(&s1));
        assert_eq!(s2.avg_service_time, 5.0);
        assert_eq!(s2.estimated_wait_minutes, 15.0);

        // omitted override keeps the last explicit value, not the category default
        let omitted = event("TOILET", 2, None);
        let s3 = state_after(&estimator, &omitted, Some(&s2));
        assert_eq!(s3.avg_service_time, 5.0);
        assert_eq!(s3.estimated_wait_minutes, 10.0);
    }

    #[test]
    fn test_ema_smoothing() {
        let estimator =
            WaitEstimator::new(ServiceTimeTable::default(), Smoothing::Ema { alpha: 0.5 });

        let s1 = state_after(&estimator, &event("TOILET", 4, None), None);
        assert_eq!(s1.smoothed_queue_length, 4.0);
        assert_eq!(s1.estimated_wait_minutes, 8.0);

        let s2 = state_after(&estimator, &event("TOILET", 8, None), Some(&s1));
        assert_eq!(s2.queue_length, 8);
        assert_eq!(s2.smoothed_queue_length, 6.0);
        assert_eq!(s2.estimated_wait_minutes, 12.0);
    }

    #[test]
    fn test_no_smoothing_replaces_outright() {
        let estimator = WaitEstimator::default();
        let s1 = state_after(&estimator, &event("FOOD", 10, None), None);
        let s2 = state_after(&estimator, &event("FOOD", 0, None), Some(&s1));
        assert_eq!(s2.smoothed_queue_length, 0.0);
        assert_eq!(s2.estimated_wait_minutes, 0.0);
    }
}
