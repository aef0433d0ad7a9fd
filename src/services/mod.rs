//! Services - business logic and state management
//!
//! - `store` - Authoritative per-location queue state with write-through
//! - `ingest` - Consumer applying the duplicate/stale policy and estimator

pub mod ingest;
pub mod store;

// Re-export commonly used types
pub use ingest::{Consumer, IngestOutcome, RetryPolicy, SharedReceiver};
pub use store::{LocationGuard, QueueStateStore};
