//! Domain models - queue telemetry, queue state and the wait-time model
//!
//! - `types` - `QueueEvent`, `QueueState` and the id newtypes
//! - `event` - wire envelope parsing and validation
//! - `estimator` - wait-time estimate, service-time defaults, smoothing
//! - `error` - error taxonomy shared by the pipeline

pub mod error;
pub mod estimator;
pub mod event;
pub mod types;

pub use error::{IngestError, PublishError, StoreError, ValidationError};
pub use estimator::{estimate, ServiceTimeTable, Smoothing, WaitEstimator};
pub use event::validate;
pub use types::{EventId, Location, LocationId, LocationType, QueueEvent, QueueState};
