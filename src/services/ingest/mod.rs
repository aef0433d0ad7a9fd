//! Ingestion consumer - turns queue telemetry into committed state
//!
//! Per event, under the location's writer lock:
//! 1. same `event_id` as the stored row -> `Duplicate`
//! 2. `(observed_at, event_id)` not newer than the stored row -> `Stale`
//! 3. otherwise estimate, write through the store, then hand the row to the
//!    publisher
//!
//! The first event for a location is always accepted. Equal timestamps are
//! ordered by `event_id`, so a redelivered older event can never displace a
//! newer one. Several workers share one receiver; per-key locking plus the
//! stale check make the final state independent of which worker handled
//! which event.
//!
//! Store failures are retried in place with exponential backoff. A message
//! that still fails is released back to the bus un-acked for redelivery.


use crate::domain::{validate, IngestError, PublishError, QueueEvent, QueueState, WaitEstimator};
use crate::infra::metrics::IngestMetrics;
use crate::io::egress_channel::StatePublisher;
use crate::io::mqtt::InboundMessage;
use crate::services::store::QueueStateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// Receiver shared by every worker; each message goes to exactly one of them
pub type SharedReceiver = Arc<Mutex<mpsc::Receiver<InboundMessage>>>;

/// Result of handling one valid event
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Accepted(QueueState),
    Duplicate,
    Stale,
}

/// Local retry of store failures before a message is released to the bus
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub attempts: u32,
    /// Delay before the first retry; doubles on each further retry
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3, backoff: Duration::from_millis(100) }
    }
}

/// Newer timestamp wins; equal timestamps fall back to the greater `event_id`
fn supersedes(event: &QueueEvent, current: &QueueState) -> bool {
    (event.observed_at, &event.event_id) > (current.last_observed_at, &current.last_event_id)
}

/// Stateless worker handle; clone one per worker task
#[derive(Clone)]
pub struct Consumer {
    store: Arc<QueueStateStore>,
    estimator: Arc<WaitEstimator>,
    publisher: StatePublisher,
    metrics: Arc<IngestMetrics>,
    retry: RetryPolicy,
}

impl Consumer {
    pub fn new(
        store: Arc<QueueStateStore>,
        estimator: Arc<WaitEstimator>,
        publisher: StatePublisher,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        Self { store, estimator, publisher, metrics, retry: RetryPolicy::default() }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validate a raw bus payload and handle the resulting event
    pub async fn process_payload(&self, raw: &[u8]) -> Result<IngestOutcome, IngestError> {
        let event = self.decode(raw)?;
        self.handle_event(event).await
    }

    fn decode(&self, raw: &[u8]) -> Result<QueueEvent, IngestError> {
        self.metrics.record_received();
        validate(raw).map_err(|e| {
            self.metrics.record_invalid();
            warn!(error = %e, bytes = %raw.len(), "event_invalid");
            e.into()
        })
    }

    /// `handle_event`, retrying retryable failures per the retry policy
    pub async fn handle_with_retry(
        &self,
        event: QueueEvent,
    ) -> Result<IngestOutcome, IngestError> {
        let mut backoff = self.retry.backoff;
        let mut attempt = 0;
        loop {
            match self.handle_event(event.clone()).await {
                Err(e) if e.is_retryable() && attempt < self.retry.attempts => {
                    attempt += 1;
                    debug!(
                        event_id = %event.event_id,
                        attempt = %attempt,
                        backoff_ms = %backoff.as_millis(),
                        "event_retry"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                result => return result,
            }
        }
    }

    /// Apply the duplicate/stale policy and commit accepted events
    pub async fn handle_event(&self, event: QueueEvent) -> Result<IngestOutcome, IngestError> {
        let mut guard = match self.store.lock(&event.location_id).await {
            Ok(guard) => guard,
            Err(e) => {
                self.metrics.record_store_error();
                warn!(
                    location_id = %event.location_id,
                    event_id = %event.event_id,
                    error = %e,
                    "store_lock_failed"
                );
                return Err(e.into());
            }
        };

        if let Some(current) = guard.current() {
            if current.last_event_id == event.event_id {
                self.metrics.record_duplicate();
                debug!(
                    location_id = %event.location_id,
                    event_id = %event.event_id,
                    "event_duplicate"
                );
                return Ok(IngestOutcome::Duplicate);
            }
            if !supersedes(&event, current) {
                self.metrics.record_stale();
                debug!(
                    location_id = %event.location_id,
                    event_id = %event.event_id,
                    observed_at = %event.observed_at,
                    last_observed_at = %current.last_observed_at,
                    "event_stale"
                );
                return Ok(IngestOutcome::Stale);
            }
        }

        let estimate = self.estimator.next(&event, guard.current());
        if event.avg_service_time.is_none()
            && guard.current().is_none()
            && !self.estimator.table().is_known(&event.location_type)
        {
            self.metrics.record_unknown_location_type();
            debug!(
                location_id = %event.location_id,
                location_type = %event.location_type,
                fallback_minutes = %estimate.avg_service_time,
                "location_type_unknown"
            );
        }

        let state = match guard
            .upsert(
                &event,
                estimate.avg_service_time,
                estimate.smoothed_queue_length,
                estimate.wait_minutes,
            )
            .await
        {
            Ok(state) => state,
            Err(e) => {
                self.metrics.record_store_error();
                warn!(
                    location_id = %event.location_id,
                    event_id = %event.event_id,
                    error = %e,
                    "store_write_failed"
                );
                return Err(e.into());
            }
        };

        self.metrics.record_accepted();
        debug!(
            location_id = %state.location_id,
            event_id = %state.last_event_id,
            queue_length = %state.queue_length,
            wait_minutes = %state.estimated_wait_minutes,
            "event_accepted"
        );

        // Still under the writer lock, so per-location publish order matches commit order
        self.publish(&state);
        drop(guard);

        Ok(IngestOutcome::Accepted(state))
    }

    fn publish(&self, state: &QueueState) {
        match self.publisher.publish(state) {
            Ok(()) => {
                if self.publisher.is_enabled() {
                    self.metrics.record_publish_enqueued();
                }
            }
            Err(e @ PublishError::ChannelFull) => {
                self.metrics.record_publish_dropped();
                warn!(location_id = %state.location_id, error = %e, "publish_dropped");
            }
            Err(e @ PublishError::ChannelClosed) => {
                self.metrics.record_publish_dropped();
                debug!(location_id = %state.location_id, error = %e, "publish_dropped");
            }
        }
    }

    /// Worker loop: take one message at a time until shutdown or channel close
    ///
    /// Messages are acked once handled. A message whose store failure outlasts
    /// the local retries is released un-acked for broker redelivery.
    pub async fn run(
        self,
        worker_id: usize,
        receiver: SharedReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(worker_id = %worker_id, "ingest_worker_started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let message = {
                let mut rx = receiver.lock().await;
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                    message = rx.recv() => message,
                }
            };

            let Some(message) = message else {
                break;
            };

            let result = match self.decode(&message.payload) {
                Ok(event) => self.handle_with_retry(event).await,
                Err(e) => Err(e),
            };
            self.metrics.record_event_processed(message.received_at.elapsed().as_micros() as u64);

            match result {
                Err(e) if e.is_retryable() => {
                    self.metrics.record_released();
                    warn!(
                        worker_id = %worker_id,
                        topic = %message.topic,
                        error = %e,
                        "message_released"
                    );
                    message.release().await;
                }
                _ => message.ack().await,
            }
        }

        info!(worker_id = %worker_id, "ingest_worker_stopped");
    }
}
